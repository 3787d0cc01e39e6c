use thiserror::Error;

/// Everything that can go wrong while driving a share toward "mounted".
///
/// Variants carry just enough structure for the retry loop and the UI;
/// helper stderr is folded into the classification, not carried around.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MountError {
    #[error("server unreachable")]
    ServerUnreachable,

    #[error("authentication failed")]
    AuthFailed,

    #[error("mount path invalid: {0}")]
    MountPathInvalid(String),

    #[error("mount failed (errno {0})")]
    MountFailed(i32),

    #[error("unmount failed (errno {0})")]
    UnmountFailed(i32),

    #[error("timed out")]
    TimeoutExceeded,

    #[error("VPN connection required")]
    VpnRequired,

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("permission denied")]
    PermissionDenied,

    #[error("already mounted")]
    AlreadyMounted,

    #[error("share already mounted at {0}")]
    ShareAlreadyMountedElsewhere(String),

    #[error("not mounted")]
    NotMounted,

    #[error("stale mount")]
    StaleMount,

    #[error("network unavailable")]
    NetworkUnavailable,

    #[error("authentication required")]
    AuthRequired,

    #[error("no stored credential")]
    CredentialNotFound,

    #[error("internal error: {0}")]
    Internal(String),
}

impl MountError {
    /// The authentication family is terminal: retrying with the same inputs
    /// cannot succeed, so the episode loop stops on these.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            MountError::AuthFailed
                | MountError::AuthRequired
                | MountError::CredentialNotFound
                | MountError::PermissionDenied
        )
    }

    /// Short action the user can take, where one exists.
    pub fn recovery_hint(&self) -> Option<String> {
        match self {
            MountError::AuthFailed | MountError::AuthRequired => {
                Some("Check the username and password for this share".to_string())
            }
            MountError::CredentialNotFound => {
                Some("Save a password for this share and try again".to_string())
            }
            MountError::VpnRequired => Some("Connect to VPN and try again".to_string()),
            MountError::ShareAlreadyMountedElsewhere(path) => {
                Some(format!("The share is already mounted at {}", path))
            }
            MountError::ServerUnreachable | MountError::NetworkUnavailable => {
                Some("Check the network connection to the server".to_string())
            }
            MountError::MountPathInvalid(_) => {
                Some("Choose a different local mount path".to_string())
            }
            _ => None,
        }
    }
}
