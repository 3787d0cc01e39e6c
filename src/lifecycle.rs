use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ShareConfig, ShareId};
use crate::driver::Mounter;
use crate::error::MountError;
use crate::inspect::MountInspector;
use crate::journal::{Journal, JournalLevel};
use crate::keystore::Keystore;
use crate::probe::{NetworkStatus, Reachability, DEFAULT_PROBE_TIMEOUT, HEALTH_PROBE_TIMEOUT};
use crate::retry::RetryGovernor;
use crate::route::RouteCheck;
use crate::sched::EvalEvent;
use crate::state::{MountHealth, ShareState, ShareStatus};

/// A Mounting operation older than this is presumed wedged.
const STUCK_MOUNT_CUTOFF: Duration = Duration::from_secs(120);
/// Unmounts wedge faster and get a shorter leash.
const STUCK_UNMOUNT_CUTOFF: Duration = Duration::from_secs(60);

/// Auto-evaluation leaves a share alone for this long after the user
/// explicitly disconnected it.
pub const SUSPENSION_WINDOW: Duration = Duration::from_secs(300);

/// Health probes skip a share this soon after a successful mount.
const HEALTH_GRACE_WINDOW: Duration = Duration::from_secs(60);

pub type StateMap = Arc<Mutex<HashMap<ShareId, ShareState>>>;
pub type ConfigMap = Arc<Mutex<HashMap<ShareId, ShareConfig>>>;
pub type Notifier = Arc<dyn Fn(ShareId) + Send + Sync>;

/// The services an evaluation consults, injected so tests can stand in
/// for every one of them.
pub struct Services {
    pub mounter: Arc<dyn Mounter>,
    pub inspector: Arc<MountInspector>,
    pub prober: Arc<dyn Reachability>,
    pub network: Arc<dyn NetworkStatus>,
    pub routes: Arc<dyn RouteCheck>,
    pub governor: Arc<RetryGovernor>,
    pub keystore: Arc<dyn Keystore>,
    pub journal: Arc<Journal>,
}

/// Runs the per-share evaluation algorithm and the mount episode. One
/// evaluator is shared by all shares; the scheduler guarantees per-share
/// serialization, so state reads stay coherent within one evaluation
/// step. Every await is followed by a fresh read of the authoritative
/// state, never by trusting an old snapshot.
pub struct Evaluator {
    services: Services,
    configs: ConfigMap,
    states: StateMap,
    notify: Notifier,
    /// In-flight mount episodes, cancellable by user-initiated unmounts.
    episodes: Mutex<HashMap<ShareId, CancellationToken>>,
}

impl Evaluator {
    pub fn new(services: Services, configs: ConfigMap, states: StateMap, notify: Notifier) -> Self {
        Self {
            services,
            configs,
            states,
            notify,
            episodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    fn config(&self, id: ShareId) -> Option<ShareConfig> {
        self.configs.lock().unwrap().get(&id).cloned()
    }

    fn with_state<R>(&self, id: ShareId, f: impl FnOnce(&mut ShareState) -> R) -> R {
        let mut states = self.states.lock().unwrap();
        f(states.entry(id).or_default())
    }

    pub fn status(&self, id: ShareId) -> ShareStatus {
        self.with_state(id, |s| s.status.clone())
    }

    /// Apply a transition and tell observers when it was taken.
    fn apply_status(&self, id: ShareId, to: ShareStatus) -> bool {
        let before = self.with_state(id, |s| s.status.clone());
        if before == to {
            return true;
        }
        let taken = self.with_state(id, |s| s.apply(id, to));
        if taken {
            (self.notify)(id);
        }
        taken
    }

    fn journal(&self, config: &ShareConfig, level: JournalLevel, message: String) {
        self.services.journal.record(config.id, &config.display_name, level, message, None, None);
    }

    /// The evaluation algorithm: decide what this share needs right now
    /// and do exactly one thing about it.
    pub async fn evaluate(&self, id: ShareId, event: EvalEvent, token: CancellationToken) {
        let Some(config) = self.config(id) else { return };

        // step 1: disabled shares only move for the user
        if !config.is_enabled() && event != EvalEvent::UserInitiated {
            return;
        }

        // step 2: honor a user-initiated disconnect
        if event != EvalEvent::UserInitiated && self.with_state(id, |s| s.is_suspended()) {
            debug!(share = %id, "suspended after user disconnect, skipping");
            return;
        }

        let mount_path = config.resolved_mount_path();

        // step 3: believe the kernel first
        if self.services.inspector.is_network_mount(&mount_path) {
            let reachable = self
                .services
                .prober
                .is_reachable(
                    &config.server_address,
                    config.protocol.default_port(),
                    HEALTH_PROBE_TIMEOUT,
                )
                .await;
            if token.is_cancelled() {
                return;
            }
            let health = if reachable { MountHealth::Connected } else { MountHealth::Degraded };
            self.adopt_mounted(id, health);
            return;
        }

        // step 4: reconcile our own record with reality
        self.reconcile(id, &config);
        if token.is_cancelled() {
            return;
        }

        // step 5: is the world even reachable for this share
        if !self.services.network.is_connected() {
            self.journal(&config, JournalLevel::Warning, "no network connectivity".to_string());
            self.apply_status(id, ShareStatus::Unmounted);
            return;
        }
        if config.requires_vpn {
            let accessible =
                self.services.routes.server_accessible_via_vpn(&config.server_address).await;
            if token.is_cancelled() {
                return;
            }
            if !accessible {
                self.journal(
                    &config,
                    JournalLevel::Warning,
                    format!("{} is not reachable over VPN", config.server_address),
                );
                self.apply_status(id, ShareStatus::Unmounted);
                return;
            }
        }

        // step 6: go mount it
        self.mount_episode(id, &config, token).await;
    }

    /// The kernel already has this share attached; bring our state along.
    /// From states with no direct edge to Mounted the adoption ladders
    /// through the legal intermediate transitions.
    fn adopt_mounted(&self, id: ShareId, health: MountHealth) {
        let current = self.with_state(id, |s| s.status.clone());
        match current {
            ShareStatus::Mounted(_) | ShareStatus::Mounting { .. } => {
                self.apply_status(id, ShareStatus::Mounted(health));
            }
            ShareStatus::Unmounting => {
                // an unmount is in flight; let it finish and reconcile on
                // the next evaluation
            }
            ShareStatus::Error(_) | ShareStatus::Disabled => {
                self.apply_status(id, ShareStatus::Unmounted);
                self.apply_status(
                    id,
                    ShareStatus::Mounting { attempt: 1, max_attempts: 1, last_error: None },
                );
                self.apply_status(id, ShareStatus::Mounted(health));
            }
            ShareStatus::Unmounted => {
                self.apply_status(
                    id,
                    ShareStatus::Mounting { attempt: 1, max_attempts: 1, last_error: None },
                );
                self.apply_status(id, ShareStatus::Mounted(health));
            }
        }
    }

    /// Drop state that no longer matches the kernel, and un-wedge
    /// operations that have been "in flight" for implausibly long.
    fn reconcile(&self, id: ShareId, config: &ShareConfig) {
        let status = self.with_state(id, |s| s.status.clone());

        match status {
            ShareStatus::Mounted(_) => {
                // the step-3 check said the path is not a network mount
                debug!(share = %id, "mount disappeared, dropping to unmounted");
                self.apply_status(id, ShareStatus::Unmounted);
            }
            ShareStatus::Mounting { .. } => {
                let started = self.with_state(id, |s| s.operation_start);
                if started.is_some_and(|at| at.elapsed() > STUCK_MOUNT_CUTOFF) {
                    warn!(
                        share = %id,
                        "mount operation timed out after {} s, resetting",
                        STUCK_MOUNT_CUTOFF.as_secs()
                    );
                    self.cancel_episode(id);
                    self.with_state(id, |s| s.operation_start = None);
                    self.apply_status(id, ShareStatus::Unmounted);
                }
            }
            ShareStatus::Unmounting => {
                let started = self.with_state(id, |s| s.operation_start);
                if started.is_some_and(|at| at.elapsed() > STUCK_UNMOUNT_CUTOFF) {
                    warn!(
                        share = %id,
                        "unmount operation timed out after {} s, resetting to kernel state",
                        STUCK_UNMOUNT_CUTOFF.as_secs()
                    );
                    self.with_state(id, |s| s.operation_start = None);
                    let mount_path = config.resolved_mount_path();
                    let actual = if self.services.inspector.is_network_mount(&mount_path) {
                        ShareStatus::Mounted(MountHealth::Connected)
                    } else {
                        ShareStatus::Unmounted
                    };
                    // Unmounting -> Mounted is not an edge; route via Unmounted
                    if actual.is_mounted() {
                        self.apply_status(id, ShareStatus::Unmounted);
                    }
                    self.apply_status(id, actual);
                }
            }
            _ => {}
        }
    }

    /// One bounded run of mount attempts: Mounting{1,N} to Mounted or
    /// Error. The episode token is a child of the evaluation token, so a
    /// superseding event or a user unmount both stop the retry sleep.
    async fn mount_episode(&self, id: ShareId, config: &ShareConfig, eval_token: CancellationToken) {
        let max_attempts = config.max_attempts();
        let token = eval_token.child_token();
        self.episodes.lock().unwrap().insert(id, token.clone());
        let _cleanup = scopeguard::guard((), |_| {
            self.episodes.lock().unwrap().remove(&id);
        });

        if !self.apply_status(
            id,
            ShareStatus::Mounting { attempt: 1, max_attempts, last_error: None },
        ) {
            return;
        }

        let mut attempt = 1u32;
        let mut last_error = MountError::TimeoutExceeded;

        while attempt <= max_attempts && !token.is_cancelled() {
            if !self.services.governor.should_retry(id) {
                self.journal(
                    config,
                    JournalLevel::Error,
                    "too many consecutive failures, backing off".to_string(),
                );
                self.apply_status(id, ShareStatus::Error(MountError::TimeoutExceeded));
                return;
            }

            // informational: the helper gets invoked either way, but the
            // probe result makes failure logs much easier to read
            let reachable = self
                .services
                .prober
                .is_reachable(
                    &config.server_address,
                    config.protocol.default_port(),
                    DEFAULT_PROBE_TIMEOUT,
                )
                .await;
            if !reachable {
                debug!(share = %id, server = %config.server_address, "server not answering probe");
            }
            if token.is_cancelled() {
                return;
            }

            let credential = match self.fetch_credential(config).await {
                Ok(credential) => credential,
                Err(error) => {
                    self.journal(
                        config,
                        JournalLevel::Error,
                        format!("cannot mount: {}", error),
                    );
                    self.apply_status(id, ShareStatus::Error(error));
                    return;
                }
            };
            if token.is_cancelled() {
                return;
            }

            self.services.journal.record(
                config.id,
                &config.display_name,
                JournalLevel::Info,
                format!("mounting {} (attempt {}/{})", config.display_url(), attempt, max_attempts),
                None,
                Some(attempt),
            );

            match self.services.mounter.mount(config, credential.as_ref()).await {
                Ok(()) => {
                    self.services.governor.record_success(id);
                    self.with_state(id, |s| s.last_success_at = Some(Instant::now()));
                    self.apply_status(id, ShareStatus::Mounted(MountHealth::Connected));
                    self.journal(
                        config,
                        JournalLevel::Success,
                        format!("mounted at {}", config.resolved_mount_path().display()),
                    );
                    return;
                }
                Err(error) if error.is_auth_failure() => {
                    self.journal(
                        config,
                        JournalLevel::Error,
                        format!("authentication failed: {}", error),
                    );
                    self.apply_status(id, ShareStatus::Error(error));
                    return;
                }
                Err(error) => {
                    self.services.governor.record_failure(id);
                    self.with_state(id, |s| {
                        s.consecutive_failures = self.services.governor.failures(id)
                    });
                    last_error = error;
                }
            }

            if attempt >= max_attempts {
                break;
            }

            let Some(delay) = self.services.governor.next_delay(
                id,
                config.retry_strategy,
                config.custom_retry_interval,
            ) else {
                // Manual strategy: one attempt, then wait for the user
                break;
            };

            attempt += 1;
            self.apply_status(
                id,
                ShareStatus::Mounting {
                    attempt,
                    max_attempts,
                    last_error: Some(last_error.clone()),
                },
            );
            self.journal(
                config,
                JournalLevel::Warning,
                format!("retrying in {} s after: {}", delay.as_secs(), last_error),
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => return,
            }
        }

        if token.is_cancelled() {
            return;
        }
        self.journal(
            config,
            JournalLevel::Error,
            format!("giving up after {} attempts: {}", attempt, last_error),
        );
        self.apply_status(id, ShareStatus::Error(last_error));
    }

    /// Credentials are fetched only when the share opted into saved
    /// credentials and has a username; NFS goes through the same gate
    /// even though it never authenticates users.
    async fn fetch_credential(
        &self,
        config: &ShareConfig,
    ) -> Result<Option<crate::keystore::Credential>, MountError> {
        if !config.save_credentials || config.username.is_empty() {
            return Ok(None);
        }
        match self
            .services
            .keystore
            .get(&config.server_address, &config.username, config.protocol)
            .await
        {
            Ok(Some(credential)) => Ok(Some(credential)),
            Ok(None) => {
                if config.protocol.requires_auth() {
                    Err(MountError::CredentialNotFound)
                } else {
                    Ok(None)
                }
            }
            Err(e) => {
                warn!(share = %config.id, "keystore read failed: {}", e);
                Err(MountError::CredentialNotFound)
            }
        }
    }

    pub fn cancel_episode(&self, id: ShareId) {
        if let Some(token) = self.episodes.lock().unwrap().remove(&id) {
            token.cancel();
        }
    }

    /// Unmount a share now. A user-initiated disconnect cancels any
    /// in-flight mount episode first and arms the suspension window so
    /// auto-evaluation does not immediately remount it.
    pub async fn unmount(&self, id: ShareId, user_initiated: bool) {
        let Some(config) = self.config(id) else { return };
        self.cancel_episode(id);

        let mount_path = config.resolved_mount_path();
        if !self.apply_status(id, ShareStatus::Unmounting) {
            // not in a state that can unmount (e.g. already unmounted)
            if user_initiated {
                self.with_state(id, |s| s.suspended_until = Some(Instant::now() + SUSPENSION_WINDOW));
            }
            return;
        }

        match self.services.mounter.unmount(&mount_path).await {
            Ok(()) => {
                self.apply_status(id, ShareStatus::Unmounted);
                self.journal(&config, JournalLevel::Info, "unmounted".to_string());
            }
            Err(error) => {
                self.journal(
                    &config,
                    JournalLevel::Error,
                    format!("unmount failed: {}", error),
                );
                self.apply_status(id, ShareStatus::Error(error));
            }
        }

        if user_initiated {
            self.with_state(id, |s| s.suspended_until = Some(Instant::now() + SUSPENSION_WINDOW));
        }
    }

    /// One pass of the health prober over every enabled share. Shares in
    /// trouble are re-scheduled through the scheduler (passed as a
    /// callback to keep the prober decoupled from it).
    pub async fn health_tick(&self, reschedule: &(dyn Fn(ShareId) + Sync)) {
        let configs: Vec<ShareConfig> = {
            let configs = self.configs.lock().unwrap();
            configs.values().filter(|c| c.is_enabled()).cloned().collect()
        };

        let checks = configs.iter().map(|config| self.health_check_share(config));
        futures::future::join_all(checks).await;

        for config in &configs {
            if self.with_state(config.id, |s| s.status.is_unhealthy() && !s.is_suspended()) {
                reschedule(config.id);
            }
        }
    }

    async fn health_check_share(&self, config: &ShareConfig) {
        let id = config.id;
        let (status, last_success) =
            self.with_state(id, |s| (s.status.clone(), s.last_success_at));

        if !matches!(status, ShareStatus::Mounted(_)) {
            return;
        }

        // grace window: a fresh mount is taken at its word
        if status == ShareStatus::Mounted(MountHealth::Connected)
            && last_success.is_some_and(|at| at.elapsed() < HEALTH_GRACE_WINDOW)
        {
            return;
        }

        let mount_path = config.resolved_mount_path();
        if !self.services.inspector.is_network_mount(&mount_path) {
            self.journal(
                config,
                JournalLevel::Warning,
                "mount disappeared from the kernel table".to_string(),
            );
            self.apply_status(id, ShareStatus::Unmounted);
            return;
        }

        let reachable = self
            .services
            .prober
            .is_reachable(
                &config.server_address,
                config.protocol.default_port(),
                HEALTH_PROBE_TIMEOUT,
            )
            .await;

        if reachable {
            self.with_state(id, |s| s.health_failures = 0);
            self.apply_status(id, ShareStatus::Mounted(MountHealth::Connected));
        } else {
            // present but unreachable: leave it mounted. Unmounting here
            // thrashes through every transient VPN drop.
            self.with_state(id, |s| s.health_failures += 1);
            self.apply_status(id, ShareStatus::Mounted(MountHealth::Degraded));
        }
    }

    /// True when any enabled share is in a state that warrants the
    /// faster health cadence.
    pub fn any_share_unhealthy(&self) -> bool {
        let configs = self.configs.lock().unwrap();
        let states = self.states.lock().unwrap();
        configs.values().any(|c| {
            c.is_enabled()
                && states.get(&c.id).is_some_and(|s| s.status.is_unhealthy())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Protocol, RetryStrategy};
    use crate::inspect::{MountRecord, MountTable};
    use crate::keystore::{Credential, MemoryKeystore};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FixtureTable(Mutex<Vec<MountRecord>>);

    impl FixtureTable {
        fn empty() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Vec::new())))
        }
    }

    impl MountTable for FixtureTable {
        fn entries(&self) -> std::io::Result<Vec<MountRecord>> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    struct MockMounter {
        mount_results: Mutex<Vec<Result<(), MountError>>>,
        mounts: AtomicUsize,
        unmounts: AtomicUsize,
    }

    impl MockMounter {
        fn succeeding() -> Arc<Self> {
            Self::with_results(vec![])
        }

        fn with_results(results: Vec<Result<(), MountError>>) -> Arc<Self> {
            Arc::new(Self {
                mount_results: Mutex::new(results),
                mounts: AtomicUsize::new(0),
                unmounts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Mounter for MockMounter {
        async fn mount(
            &self,
            _config: &ShareConfig,
            _credential: Option<&Credential>,
        ) -> Result<(), MountError> {
            self.mounts.fetch_add(1, Ordering::SeqCst);
            let mut results = self.mount_results.lock().unwrap();
            if results.is_empty() {
                Ok(())
            } else {
                results.remove(0)
            }
        }

        async fn unmount(&self, _path: &Path) -> Result<(), MountError> {
            self.unmounts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockProber(AtomicBool);

    #[async_trait]
    impl Reachability for MockProber {
        async fn is_reachable(&self, _host: &str, _port: u16, _timeout: Duration) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct MockNetwork(AtomicBool);

    impl NetworkStatus for MockNetwork {
        fn is_connected(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct MockRoutes(AtomicBool);

    #[async_trait]
    impl RouteCheck for MockRoutes {
        async fn server_accessible_via_vpn(&self, _host: &str) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Rig {
        evaluator: Arc<Evaluator>,
        mounter: Arc<MockMounter>,
        transitions: Arc<Mutex<Vec<ShareStatus>>>,
        config: ShareConfig,
    }

    async fn rig_with(
        mounter: Arc<MockMounter>,
        reachable: bool,
        keystore: Arc<dyn Keystore>,
        config: ShareConfig,
    ) -> Rig {
        rig_with_routes(mounter, reachable, true, keystore, config).await
    }

    async fn rig_with_routes(
        mounter: Arc<MockMounter>,
        reachable: bool,
        routes_ok: bool,
        keystore: Arc<dyn Keystore>,
        mut config: ShareConfig,
    ) -> Rig {
        config.mount_path = "/mnt/test-share".to_string();
        let states: StateMap = Arc::new(Mutex::new(HashMap::new()));
        let configs: ConfigMap = Arc::new(Mutex::new(HashMap::new()));
        configs.lock().unwrap().insert(config.id, config.clone());

        let transitions: Arc<Mutex<Vec<ShareStatus>>> = Arc::new(Mutex::new(Vec::new()));
        let notify: Notifier = {
            let transitions = transitions.clone();
            let states = states.clone();
            let id = config.id;
            Arc::new(move |share| {
                if share == id {
                    let status = states.lock().unwrap().get(&share).unwrap().status.clone();
                    transitions.lock().unwrap().push(status);
                }
            })
        };

        let services = Services {
            mounter: mounter.clone(),
            inspector: Arc::new(MountInspector::new(FixtureTable::empty())),
            prober: Arc::new(MockProber(AtomicBool::new(reachable))),
            network: Arc::new(MockNetwork(AtomicBool::new(true))),
            routes: Arc::new(MockRoutes(AtomicBool::new(routes_ok))),
            governor: Arc::new(RetryGovernor::new()),
            keystore,
            journal: Arc::new(Journal::new()),
        };

        let evaluator = Arc::new(Evaluator::new(services, configs, states, notify));
        Rig { evaluator, mounter, transitions, config }
    }

    fn smb_config() -> ShareConfig {
        let mut config = ShareConfig::new("NAS", Protocol::Smb, "10.0.0.5", "data");
        config.username = "alice".to_string();
        config.save_credentials = true;
        config.retry_strategy = RetryStrategy::Normal;
        config
    }

    fn alice_cred() -> Credential {
        Credential {
            server: "10.0.0.5".to_string(),
            username: "alice".to_string(),
            password: "p@ss".to_string(),
            port: 445,
            protocol: Protocol::Smb,
        }
    }

    #[tokio::test]
    async fn happy_path_walks_unmounted_mounting_connected() {
        let keystore = Arc::new(MemoryKeystore::with(alice_cred()).await);
        let rig = rig_with(MockMounter::succeeding(), true, keystore, smb_config()).await;

        rig.evaluator
            .evaluate(rig.config.id, EvalEvent::Startup, CancellationToken::new())
            .await;

        let transitions = rig.transitions.lock().unwrap().clone();
        assert_eq!(
            transitions,
            vec![
                ShareStatus::Mounting { attempt: 1, max_attempts: 5, last_error: None },
                ShareStatus::Mounted(MountHealth::Connected),
            ]
        );
        assert_eq!(rig.evaluator.services().governor.failures(rig.config.id), 0);
        assert!(rig
            .evaluator
            .services()
            .governor
            .was_recently_successful(rig.config.id, Duration::from_secs(5)));

        // secret hygiene: the stored password never reaches the journal,
        // while the masked URL form does
        let entries = rig.evaluator.services().journal.recent();
        for entry in &entries {
            assert!(!entry.message.contains("p@ss"));
            assert!(!entry.error.as_deref().unwrap_or("").contains("p@ss"));
        }
        assert!(entries.iter().any(|e| e.message.contains("alice:***@10.0.0.5")));
    }

    #[tokio::test]
    async fn auth_failure_is_terminal_no_retry() {
        let keystore = Arc::new(MemoryKeystore::with(alice_cred()).await);
        let mounter = MockMounter::with_results(vec![Err(MountError::AuthFailed)]);
        let rig = rig_with(mounter, true, keystore, smb_config()).await;

        rig.evaluator
            .evaluate(rig.config.id, EvalEvent::Startup, CancellationToken::new())
            .await;

        assert_eq!(rig.mounter.mounts.load(Ordering::SeqCst), 1);
        assert_eq!(
            rig.evaluator.status(rig.config.id),
            ShareStatus::Error(MountError::AuthFailed)
        );
    }

    #[tokio::test]
    async fn missing_credential_is_terminal() {
        let keystore = Arc::new(MemoryKeystore::new());
        let rig = rig_with(MockMounter::succeeding(), true, keystore, smb_config()).await;

        rig.evaluator
            .evaluate(rig.config.id, EvalEvent::Startup, CancellationToken::new())
            .await;

        assert_eq!(rig.mounter.mounts.load(Ordering::SeqCst), 0);
        assert_eq!(
            rig.evaluator.status(rig.config.id),
            ShareStatus::Error(MountError::CredentialNotFound)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_until_success() {
        let keystore = Arc::new(MemoryKeystore::with(alice_cred()).await);
        let mounter = MockMounter::with_results(vec![
            Err(MountError::ServerUnreachable),
            Err(MountError::ServerUnreachable),
            Ok(()),
        ]);
        let rig = rig_with(mounter, true, keystore, smb_config()).await;

        rig.evaluator
            .evaluate(rig.config.id, EvalEvent::Startup, CancellationToken::new())
            .await;

        assert_eq!(rig.mounter.mounts.load(Ordering::SeqCst), 3);
        assert_eq!(
            rig.evaluator.status(rig.config.id),
            ShareStatus::Mounted(MountHealth::Connected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn episode_exhausts_attempts_into_error() {
        let keystore = Arc::new(MemoryKeystore::with(alice_cred()).await);
        let mut config = smb_config();
        config.max_retry_attempts = Some(2);
        let mounter = MockMounter::with_results(vec![
            Err(MountError::ServerUnreachable),
            Err(MountError::MountFailed(5)),
        ]);
        let rig = rig_with(mounter, true, keystore, config).await;

        rig.evaluator
            .evaluate(rig.config.id, EvalEvent::Startup, CancellationToken::new())
            .await;

        assert_eq!(rig.mounter.mounts.load(Ordering::SeqCst), 2);
        assert_eq!(
            rig.evaluator.status(rig.config.id),
            ShareStatus::Error(MountError::MountFailed(5))
        );
    }

    #[tokio::test]
    async fn manual_strategy_attempts_once() {
        let keystore = Arc::new(MemoryKeystore::with(alice_cred()).await);
        let mut config = smb_config();
        config.retry_strategy = RetryStrategy::Manual;
        config.max_retry_attempts = Some(5);
        let mounter = MockMounter::with_results(vec![Err(MountError::ServerUnreachable)]);
        let rig = rig_with(mounter, true, keystore, config).await;

        rig.evaluator
            .evaluate(rig.config.id, EvalEvent::Startup, CancellationToken::new())
            .await;

        assert_eq!(rig.mounter.mounts.load(Ordering::SeqCst), 1);
        assert!(matches!(
            rig.evaluator.status(rig.config.id),
            ShareStatus::Error(MountError::ServerUnreachable)
        ));
    }

    #[tokio::test]
    async fn disabled_share_ignores_auto_events() {
        let keystore = Arc::new(MemoryKeystore::with(alice_cred()).await);
        let mut config = smb_config();
        config.management_state = crate::config::ManagementState::Disabled;
        let rig = rig_with(MockMounter::succeeding(), true, keystore, config).await;

        rig.evaluator
            .evaluate(rig.config.id, EvalEvent::NetworkChange, CancellationToken::new())
            .await;
        assert_eq!(rig.mounter.mounts.load(Ordering::SeqCst), 0);
        assert_eq!(rig.evaluator.status(rig.config.id), ShareStatus::Unmounted);
    }

    #[tokio::test]
    async fn suspended_share_ignores_auto_events() {
        let keystore = Arc::new(MemoryKeystore::with(alice_cred()).await);
        let rig = rig_with(MockMounter::succeeding(), true, keystore, smb_config()).await;

        rig.evaluator.with_state(rig.config.id, |s| {
            s.suspended_until = Some(Instant::now() + Duration::from_secs(300))
        });
        rig.evaluator
            .evaluate(rig.config.id, EvalEvent::HealthCheck, CancellationToken::new())
            .await;
        assert_eq!(rig.mounter.mounts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn vpn_required_and_unroutable_stays_unmounted() {
        let keystore = Arc::new(MemoryKeystore::with(alice_cred()).await);
        let mut config = smb_config();
        config.requires_vpn = true;
        let rig =
            rig_with_routes(MockMounter::succeeding(), true, false, keystore, config).await;

        rig.evaluator
            .evaluate(rig.config.id, EvalEvent::VpnChange, CancellationToken::new())
            .await;
        assert_eq!(rig.mounter.mounts.load(Ordering::SeqCst), 0);
        assert_eq!(rig.evaluator.status(rig.config.id), ShareStatus::Unmounted);
    }

    #[tokio::test]
    async fn user_unmount_arms_suspension_window() {
        let keystore = Arc::new(MemoryKeystore::with(alice_cred()).await);
        let rig = rig_with(MockMounter::succeeding(), true, keystore, smb_config()).await;

        rig.evaluator
            .evaluate(rig.config.id, EvalEvent::UserInitiated, CancellationToken::new())
            .await;
        assert!(rig.evaluator.status(rig.config.id).is_mounted());

        rig.evaluator.unmount(rig.config.id, true).await;
        assert_eq!(rig.evaluator.status(rig.config.id), ShareStatus::Unmounted);
        assert!(rig.evaluator.with_state(rig.config.id, |s| s.is_suspended()));
        assert_eq!(rig.mounter.unmounts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn health_grace_window_skips_fresh_mounts() {
        let keystore = Arc::new(MemoryKeystore::with(alice_cred()).await);
        let rig = rig_with(MockMounter::succeeding(), true, keystore, smb_config()).await;

        rig.evaluator
            .evaluate(rig.config.id, EvalEvent::Startup, CancellationToken::new())
            .await;
        assert!(rig.evaluator.status(rig.config.id).is_mounted());

        // inspector knows nothing about this mount, so a health check
        // outside the grace window would drop it to Unmounted
        rig.evaluator.health_tick(&|_| {}).await;
        assert!(
            rig.evaluator.status(rig.config.id).is_mounted(),
            "health probe must skip inside the grace window"
        );

        // age the mount out of the window; the same probe now demotes it
        rig.evaluator.with_state(rig.config.id, |s| {
            s.last_success_at = Instant::now().checked_sub(Duration::from_secs(120))
        });
        rig.evaluator.health_tick(&|_| {}).await;
        assert_eq!(rig.evaluator.status(rig.config.id), ShareStatus::Unmounted);
    }

    #[tokio::test]
    async fn unhealthy_shares_are_rescheduled_not_probed() {
        let keystore = Arc::new(MemoryKeystore::with(alice_cred()).await);
        let mounter = MockMounter::with_results(vec![Err(MountError::AuthFailed)]);
        let rig = rig_with(mounter, true, keystore, smb_config()).await;

        rig.evaluator
            .evaluate(rig.config.id, EvalEvent::Startup, CancellationToken::new())
            .await;
        assert!(matches!(rig.evaluator.status(rig.config.id), ShareStatus::Error(_)));

        let rescheduled = Arc::new(Mutex::new(Vec::new()));
        {
            let rescheduled = rescheduled.clone();
            rig.evaluator
                .health_tick(&move |id| rescheduled.lock().unwrap().push(id))
                .await;
        }
        assert_eq!(rescheduled.lock().unwrap().as_slice(), &[rig.config.id]);
    }

    #[tokio::test]
    async fn cancelled_episode_leaves_state_untouched() {
        let keystore = Arc::new(MemoryKeystore::with(alice_cred()).await);
        let token = CancellationToken::new();
        token.cancel();
        let rig = rig_with(MockMounter::succeeding(), true, keystore, smb_config()).await;

        rig.evaluator.evaluate(rig.config.id, EvalEvent::Startup, token).await;
        // the pre-cancelled token stops the evaluation before the helper runs
        assert_eq!(rig.mounter.mounts.load(Ordering::SeqCst), 0);
        assert_eq!(rig.evaluator.status(rig.config.id), ShareStatus::Unmounted);
    }
}
