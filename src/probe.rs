use std::time::Duration;

use async_trait::async_trait;
use nix::ifaddrs::getifaddrs;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::watch;
use tracing::{debug, trace};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// How often the interface set is re-snapshotted when no OS path event
/// source is wired.
const PATH_SCAN_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    Ethernet,
    Wifi,
    Cellular,
    Loopback,
    Other,
}

impl InterfaceType {
    fn from_name(name: &str) -> Self {
        if name.starts_with("lo") {
            InterfaceType::Loopback
        } else if name.starts_with("wl") || name.starts_with("wlan") || name.starts_with("ath") {
            InterfaceType::Wifi
        } else if name.starts_with("en") || name.starts_with("eth") {
            InterfaceType::Ethernet
        } else if name.starts_with("pdp_ip") || name.starts_with("ww") || name.starts_with("rmnet")
        {
            InterfaceType::Cellular
        } else {
            InterfaceType::Other
        }
    }
}

/// Current network path as observers see it. Only `connected` is
/// load-bearing; the rest is reported verbatim to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStatus {
    pub connected: bool,
    pub interface_type: InterfaceType,
    pub expensive: bool,
    pub constrained: bool,
}

impl PathStatus {
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            interface_type: InterfaceType::Other,
            expensive: false,
            constrained: false,
        }
    }
}

/// "Does the host have connectivity at all" seam. Only connected-vs-not
/// is load-bearing for evaluations.
pub trait NetworkStatus: Send + Sync {
    fn is_connected(&self) -> bool;
}

impl NetworkStatus for NetworkPathMonitor {
    fn is_connected(&self) -> bool {
        self.current().connected
    }
}

/// Reachability seam; mocked in evaluation tests.
#[async_trait]
pub trait Reachability: Send + Sync {
    /// True when a TCP connection to (host, port) can be established
    /// within the timeout. Resolution failures count as unreachable.
    async fn is_reachable(&self, host: &str, port: u16, timeout: Duration) -> bool;
}

pub struct TcpProber;

#[async_trait]
impl Reachability for TcpProber {
    async fn is_reachable(&self, host: &str, port: u16, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, probe_once(host, port)).await {
            Ok(result) => result,
            Err(_) => {
                trace!(host, port, "reachability probe timed out");
                false
            }
        }
    }
}

/// Dropping the connect future on timeout closes the socket; the await
/// completes exactly once either way.
async fn probe_once(host: &str, port: u16) -> bool {
    let addrs = match lookup_host((host, port)).await {
        Ok(addrs) => addrs,
        Err(e) => {
            trace!(host, "resolution failed: {}", e);
            return false;
        }
    };
    for addr in addrs {
        if TcpStream::connect(addr).await.is_ok() {
            return true;
        }
    }
    false
}

/// (interface name, has at least one address)
fn current_interfaces() -> Vec<(String, bool)> {
    let Ok(addrs) = getifaddrs() else { return Vec::new() };
    let mut out: Vec<(String, bool)> = Vec::new();
    for ifaddr in addrs {
        let has_addr = ifaddr.address.is_some_and(|a| {
            a.as_sockaddr_in().is_some() || a.as_sockaddr_in6().is_some()
        });
        match out.iter_mut().find(|(name, _)| *name == ifaddr.interface_name) {
            Some((_, flag)) => *flag |= has_addr,
            None => out.push((ifaddr.interface_name, has_addr)),
        }
    }
    out
}

/// Classify a set of interfaces into one path status. The "best" active
/// interface wins: ethernet over wifi over cellular.
pub fn snapshot_path_status(interfaces: &[(String, bool)]) -> PathStatus {
    let mut best: Option<InterfaceType> = None;
    for (name, has_addr) in interfaces {
        if !has_addr {
            continue;
        }
        let kind = InterfaceType::from_name(name);
        if kind == InterfaceType::Loopback {
            continue;
        }
        best = Some(match (best, kind) {
            (None, k) => k,
            (Some(InterfaceType::Ethernet), _) => InterfaceType::Ethernet,
            (Some(_), InterfaceType::Ethernet) => InterfaceType::Ethernet,
            (Some(InterfaceType::Wifi), _) => InterfaceType::Wifi,
            (Some(_), InterfaceType::Wifi) => InterfaceType::Wifi,
            (Some(k), _) => k,
        });
    }

    match best {
        Some(kind) => PathStatus {
            connected: true,
            interface_type: kind,
            expensive: kind == InterfaceType::Cellular,
            constrained: false,
        },
        None => PathStatus::disconnected(),
    }
}

/// Publishes path-status changes over a watch channel. The daemon runs
/// one; the coordinator subscribes and fans NetworkChange events out to
/// the shares on every transition.
pub struct NetworkPathMonitor {
    tx: watch::Sender<PathStatus>,
}

impl NetworkPathMonitor {
    pub fn new() -> Self {
        let initial = snapshot_path_status(&current_interfaces());
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<PathStatus> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> PathStatus {
        *self.tx.borrow()
    }

    /// Re-snapshot immediately. Returns true when the status changed.
    pub fn scan_now(&self) -> bool {
        let status = snapshot_path_status(&current_interfaces());
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                debug!(?status, "network path changed");
                *current = status;
                true
            }
        })
    }

    /// Push a status directly. Test and simulation entry point.
    pub fn inject(&self, status: PathStatus) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        })
    }

    /// Background scanner; safety net for hosts without an OS event feed.
    pub fn spawn_scanner(self: &std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PATH_SCAN_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.scan_now();
            }
        })
    }
}

impl Default for NetworkPathMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn local_listener_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let prober = TcpProber;
        assert!(prober.is_reachable("127.0.0.1", port, DEFAULT_PROBE_TIMEOUT).await);
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        // bind then drop to get a port that is very likely closed
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let prober = TcpProber;
        assert!(!prober.is_reachable("127.0.0.1", port, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn unresolvable_host_is_unreachable() {
        let prober = TcpProber;
        assert!(
            !prober
                .is_reachable("host.invalid.tether.test", 445, Duration::from_secs(2))
                .await
        );
    }

    #[test]
    fn path_classification_prefers_ethernet() {
        let status = snapshot_path_status(&[
            ("lo0".to_string(), true),
            ("wlan0".to_string(), true),
            ("eth0".to_string(), true),
        ]);
        assert!(status.connected);
        assert_eq!(status.interface_type, InterfaceType::Ethernet);
        assert!(!status.expensive);
    }

    #[test]
    fn loopback_only_is_disconnected() {
        let status = snapshot_path_status(&[("lo0".to_string(), true)]);
        assert!(!status.connected);
    }

    #[test]
    fn cellular_is_expensive() {
        let status = snapshot_path_status(&[("rmnet0".to_string(), true)]);
        assert!(status.connected);
        assert!(status.expensive);
    }

    #[tokio::test]
    async fn inject_notifies_subscribers_once_per_change() {
        let monitor = NetworkPathMonitor::new();
        let mut rx = monitor.subscribe();
        rx.mark_unchanged();

        let next = PathStatus {
            connected: !monitor.current().connected,
            interface_type: InterfaceType::Other,
            expensive: false,
            constrained: false,
        };
        assert!(monitor.inject(next));
        assert!(rx.has_changed().unwrap());
        rx.mark_unchanged();

        // same value again: no notification
        assert!(!monitor.inject(next));
        assert!(!rx.has_changed().unwrap());
    }
}
