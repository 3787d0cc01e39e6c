use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tether::coordinator::Coordinator;
use tether::driver::MountDriver;
use tether::inspect::MountInspector;
use tether::journal::Journal;
use tether::keystore::FileKeystore;
use tether::lifecycle::Services;
use tether::probe::{NetworkPathMonitor, TcpProber};
use tether::recovery::CrashRecovery;
use tether::repo::{ConfigRepository, JsonFileRepository};
use tether::retry::RetryGovernor;
use tether::route::VpnRouteMonitor;

/// Keeps configured network shares mounted while the network comes and
/// goes.
#[derive(Parser, Debug)]
#[command(name = "tetherd", version)]
struct Args {
    /// Share configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Credential store file (used when no platform vault is wired)
    #[arg(long)]
    keyring: Option<PathBuf>,

    /// Directory for runtime state (startup record)
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("tether")
}

fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(|| default_config_dir().join("shares.json"));
    let keyring_path = args.keyring.unwrap_or_else(|| default_config_dir().join("keyring.json"));
    let state_dir = args.state_dir.unwrap_or_else(default_state_dir);

    info!(config = %config_path.display(), "starting tetherd");

    let repo = Arc::new(JsonFileRepository::new(config_path));
    let keystore = Arc::new(FileKeystore::new(keyring_path));
    let journal = Arc::new(Journal::new());

    let inspector = Arc::new(MountInspector::system());
    let driver = Arc::new(MountDriver::new(inspector.clone()));

    let network = Arc::new(NetworkPathMonitor::new());
    let network_scanner = network.spawn_scanner();
    let vpn = Arc::new(VpnRouteMonitor::system());
    vpn.wait_for_initialization().await;
    let vpn_scanner = vpn.spawn_scanner();

    // reconcile leftovers from a crashed instance before anything else
    // runs; the repository must be readable for this, so a broken config
    // is a fatal init failure
    let recovery = CrashRecovery::new(&state_dir);
    let expected: Vec<PathBuf> = repo
        .fetch_all()
        .await
        .context("reading share configuration")?
        .iter()
        .map(|c| c.resolved_mount_path())
        .collect();
    let unclean = recovery.run(&expected, driver.as_ref()).await?;
    if unclean {
        warn!("recovered from unclean shutdown");
    }

    let services = Services {
        mounter: driver,
        inspector,
        prober: Arc::new(TcpProber),
        network: network.clone(),
        routes: vpn.clone(),
        governor: Arc::new(RetryGovernor::new()),
        keystore,
        journal,
    };

    let coordinator = Coordinator::new(repo, services, network.subscribe(), vpn.subscribe());
    coordinator.start().await.context("starting coordinator")?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
            // host integrations send SIGUSR1 on wake-from-sleep
            _ = sigusr1.recv() => coordinator.handle_system_wake(),
        }
    }

    info!("shutting down");
    coordinator.stop();
    network_scanner.abort();
    vpn_scanner.abort();
    recovery.mark_clean_shutdown().await;
    Ok(())
}
