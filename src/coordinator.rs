use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ManagementState, ShareConfig, ShareId};
use crate::error::MountError;
use crate::journal::{Journal, JournalLevel};
use crate::keystore::Keystore;
use crate::lifecycle::{ConfigMap, Evaluator, Notifier, Services, StateMap};
use crate::probe::PathStatus;
use crate::repo::ConfigRepository;
use crate::route::RouteCheck;
use crate::sched::{EvalEvent, Scheduler};
use crate::state::{MountHealth, ShareSnapshot, ShareState, ShareStatus};

/// Rapid state transitions collapse into one observer delivery.
const OBSERVER_DEBOUNCE: Duration = Duration::from_millis(100);

/// Health probe cadence: relaxed when everything is fine, faster when any
/// share wants attention.
const HEALTH_PERIOD: Duration = Duration::from_secs(30);
const HEALTH_PERIOD_DEGRADED: Duration = Duration::from_secs(20);

/// Aggregated daemon status, rendered by the menu-bar collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallStatus {
    AllConnected,
    Connecting,
    PartiallyConnected,
    Disconnected,
}

pub type Observer = Box<dyn Fn(&HashMap<ShareId, ShareSnapshot>) + Send + Sync>;

/// Owns the share states, subscribes to the outside world, and fans
/// evaluations out through the scheduler. Everything the UI or CLI does
/// goes through here.
pub struct Coordinator {
    repo: Arc<dyn ConfigRepository>,
    keystore: Arc<dyn Keystore>,
    configs: ConfigMap,
    states: StateMap,
    evaluator: Arc<Evaluator>,
    scheduler: Arc<Scheduler>,
    journal: Arc<Journal>,

    observers: Arc<Mutex<Vec<Observer>>>,
    observer_dirty: Arc<AtomicBool>,
    observer_notify: Arc<Notify>,

    network_rx: Mutex<Option<watch::Receiver<PathStatus>>>,
    vpn_rx: Mutex<Option<watch::Receiver<bool>>>,

    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(
        repo: Arc<dyn ConfigRepository>,
        services: Services,
        network_rx: watch::Receiver<PathStatus>,
        vpn_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let configs: ConfigMap = Arc::new(Mutex::new(HashMap::new()));
        let states: StateMap = Arc::new(Mutex::new(HashMap::new()));

        let observer_dirty = Arc::new(AtomicBool::new(false));
        let observer_notify = Arc::new(Notify::new());
        let notifier: Notifier = {
            let dirty = observer_dirty.clone();
            let notify = observer_notify.clone();
            Arc::new(move |_id| {
                if !dirty.swap(true, Ordering::SeqCst) {
                    notify.notify_one();
                }
            })
        };

        let keystore = services.keystore.clone();
        let journal = services.journal.clone();
        let evaluator = Arc::new(Evaluator::new(
            services,
            configs.clone(),
            states.clone(),
            notifier,
        ));

        let scheduler = {
            let evaluator = evaluator.clone();
            Scheduler::new(Arc::new(move |id, event, token| {
                let evaluator = evaluator.clone();
                Box::pin(async move { evaluator.evaluate(id, event, token).await })
            }))
        };

        Arc::new(Self {
            repo,
            keystore,
            configs,
            states,
            evaluator,
            scheduler,
            journal,
            observers: Arc::new(Mutex::new(Vec::new())),
            observer_dirty,
            observer_notify,
            network_rx: Mutex::new(Some(network_rx)),
            vpn_rx: Mutex::new(Some(vpn_rx)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Load the configuration, start the listeners and the health loop,
    /// and evaluate every enabled share once.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let configs = self.repo.fetch_all().await?;
        info!(count = configs.len(), "loaded share configuration");
        {
            let mut map = self.configs.lock().unwrap();
            let mut states = self.states.lock().unwrap();
            for config in configs {
                states.entry(config.id).or_insert_with(|| {
                    let mut state = ShareState::default();
                    if !config.is_enabled() {
                        state.status = ShareStatus::Disabled;
                    }
                    state
                });
                map.insert(config.id, config);
            }
        }

        self.spawn_observer_pump();
        self.spawn_network_listener();
        self.spawn_vpn_listener();
        self.spawn_health_loop();

        self.scheduler.schedule_all(self.enabled_share_ids(), EvalEvent::Startup);
        Ok(())
    }

    /// Stop background work. Running evaluations observe their tokens and
    /// wind down on their own.
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.scheduler.cancel_all();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    fn enabled_share_ids(&self) -> Vec<ShareId> {
        self.configs
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.is_enabled())
            .map(|c| c.id)
            .collect()
    }

    fn config(&self, id: ShareId) -> Option<ShareConfig> {
        self.configs.lock().unwrap().get(&id).cloned()
    }

    // --- observers ---

    pub fn observe_states(&self, observer: Observer) {
        observer(&self.snapshot());
        self.observers.lock().unwrap().push(observer);
    }

    pub fn snapshot(&self) -> HashMap<ShareId, ShareSnapshot> {
        let states = self.states.lock().unwrap();
        states.iter().map(|(id, state)| (*id, ShareSnapshot::of(*id, state))).collect()
    }

    pub fn overall_status(&self) -> OverallStatus {
        let configs = self.configs.lock().unwrap();
        let states = self.states.lock().unwrap();

        let mut total = 0usize;
        let mut connected = 0usize;
        let mut any_mounting = false;
        for config in configs.values().filter(|c| c.is_enabled()) {
            total += 1;
            match states.get(&config.id).map(|s| &s.status) {
                Some(ShareStatus::Mounted(MountHealth::Connected)) => connected += 1,
                Some(ShareStatus::Mounting { .. }) => any_mounting = true,
                _ => {}
            }
        }

        if total > 0 && connected == total {
            OverallStatus::AllConnected
        } else if any_mounting {
            OverallStatus::Connecting
        } else if connected > 0 {
            OverallStatus::PartiallyConnected
        } else {
            OverallStatus::Disconnected
        }
    }

    fn spawn_observer_pump(self: &Arc<Self>) {
        let observers = self.observers.clone();
        let dirty = self.observer_dirty.clone();
        let notify = self.observer_notify.clone();
        let states = self.states.clone();
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = shutdown.cancelled() => return,
                }
                tokio::time::sleep(OBSERVER_DEBOUNCE).await;
                dirty.store(false, Ordering::SeqCst);

                let snapshot: HashMap<ShareId, ShareSnapshot> = {
                    let states = states.lock().unwrap();
                    states.iter().map(|(id, s)| (*id, ShareSnapshot::of(*id, s))).collect()
                };
                for observer in observers.lock().unwrap().iter() {
                    observer(&snapshot);
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
    }

    // --- external event listeners ---

    fn spawn_network_listener(self: &Arc<Self>) {
        let Some(mut rx) = self.network_rx.lock().unwrap().take() else { return };
        let coordinator = self.clone();
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let status = *rx.borrow_and_update();
                        coordinator.handle_network_change(status);
                    }
                    _ = shutdown.cancelled() => return,
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
    }

    fn spawn_vpn_listener(self: &Arc<Self>) {
        let Some(mut rx) = self.vpn_rx.lock().unwrap().take() else { return };
        let coordinator = self.clone();
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let connected = *rx.borrow_and_update();
                        coordinator.handle_vpn_change(connected).await;
                    }
                    _ = shutdown.cancelled() => return,
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
    }

    fn spawn_health_loop(self: &Arc<Self>) {
        let coordinator = self.clone();
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            loop {
                let period = if coordinator.evaluator.any_share_unhealthy() {
                    HEALTH_PERIOD_DEGRADED
                } else {
                    HEALTH_PERIOD
                };
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = shutdown.cancelled() => return,
                }

                let scheduler = coordinator.scheduler.clone();
                coordinator
                    .evaluator
                    .health_tick(&move |id| scheduler.schedule(id, EvalEvent::HealthCheck))
                    .await;
            }
        });
        self.tasks.lock().unwrap().push(task);
    }

    /// Topology changed: forget every grudge, wake every share. Caches are
    /// invalidated before any evaluation can run.
    pub fn handle_network_change(&self, status: PathStatus) {
        debug!(?status, "network change");
        self.evaluator.services().inspector.clear();
        self.evaluator.services().routes.invalidate_cache();
        self.evaluator.services().governor.clear_all();

        // shares stuck in Error get a fresh start on a fresh network
        for id in self.enabled_share_ids() {
            let reset = {
                let mut states = self.states.lock().unwrap();
                match states.get_mut(&id) {
                    Some(state) if matches!(state.status, ShareStatus::Error(_)) => {
                        state.apply(id, ShareStatus::Unmounted)
                    }
                    _ => false,
                }
            };
            if reset {
                self.mark_dirty();
            }
        }

        self.scheduler.schedule_all(self.enabled_share_ids(), EvalEvent::NetworkChange);
    }

    pub async fn handle_vpn_change(&self, connected: bool) {
        self.evaluator.services().inspector.clear();
        self.evaluator.services().routes.invalidate_cache();

        if connected {
            info!("VPN connected");
            // Error states whose routes now look good get another chance
            for config in self.vpn_share_configs() {
                let in_error = {
                    let states = self.states.lock().unwrap();
                    matches!(states.get(&config.id).map(|s| &s.status), Some(ShareStatus::Error(_)))
                };
                if !in_error {
                    continue;
                }
                if self
                    .evaluator
                    .services()
                    .routes
                    .server_accessible_via_vpn(&config.server_address)
                    .await
                {
                    let mut states = self.states.lock().unwrap();
                    if let Some(state) = states.get_mut(&config.id) {
                        state.apply(config.id, ShareStatus::Unmounted);
                    }
                    drop(states);
                    self.mark_dirty();
                }
            }
            self.scheduler.schedule_all(self.enabled_share_ids(), EvalEvent::VpnChange);
        } else {
            warn!("VPN disconnected, detaching VPN-bound shares");
            // proactive: do not wait for I/O against a dead tunnel to
            // time out, and do not trust the kernel to still answer
            for config in self.vpn_share_configs() {
                self.serialized_unmount(config.id, false).await;
                self.journal.record(
                    config.id,
                    &config.display_name,
                    JournalLevel::Warning,
                    "VPN disconnected, share detached",
                    None,
                    None,
                );
            }
            self.scheduler.schedule_all(self.enabled_share_ids(), EvalEvent::VpnChange);
        }
    }

    pub fn handle_system_wake(&self) {
        debug!("system wake");
        self.evaluator.services().inspector.clear();
        self.evaluator.services().routes.invalidate_cache();
        self.scheduler.schedule_all(self.enabled_share_ids(), EvalEvent::SystemWake);
    }

    fn vpn_share_configs(&self) -> Vec<ShareConfig> {
        self.configs
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.is_enabled() && c.requires_vpn)
            .cloned()
            .collect()
    }

    fn mark_dirty(&self) {
        if !self.observer_dirty.swap(true, Ordering::SeqCst) {
            self.observer_notify.notify_one();
        }
    }

    // --- user-facing surface ---

    pub async fn add_share(&self, config: ShareConfig) -> Result<()> {
        config.validate().map_err(MountError::MountPathInvalid).map_err(anyhow::Error::from)?;
        self.repo.save(&config).await?;
        {
            let mut configs = self.configs.lock().unwrap();
            let mut states = self.states.lock().unwrap();
            states.entry(config.id).or_default();
            configs.insert(config.id, config.clone());
        }
        self.mark_dirty();
        if config.is_enabled() {
            self.scheduler.schedule(config.id, EvalEvent::Startup);
        }
        Ok(())
    }

    pub async fn update_share(&self, config: ShareConfig) -> Result<()> {
        config.validate().map_err(MountError::MountPathInvalid).map_err(anyhow::Error::from)?;
        self.repo.save(&config).await?;
        self.configs.lock().unwrap().insert(config.id, config.clone());
        self.mark_dirty();
        if config.is_enabled() {
            self.scheduler.schedule(config.id, EvalEvent::HealthCheck);
        }
        Ok(())
    }

    /// Delete a share: best-effort unmount, then the record, then its
    /// credential.
    pub async fn remove_share(&self, id: ShareId) -> Result<()> {
        let config = self.config(id);
        self.serialized_unmount(id, false).await;

        self.repo.delete(id).await?;
        if let Some(config) = config {
            if !config.username.is_empty() {
                if let Err(e) = self
                    .keystore
                    .delete(&config.server_address, &config.username, config.protocol)
                    .await
                {
                    warn!(share = %id, "credential deletion failed: {}", e);
                }
            }
        }

        self.configs.lock().unwrap().remove(&id);
        self.states.lock().unwrap().remove(&id);
        self.scheduler.remove_share(id);
        self.evaluator.services().governor.reset(id);
        self.journal.remove_share(id);
        self.mark_dirty();
        Ok(())
    }

    pub async fn set_management_state(&self, id: ShareId, management: ManagementState) -> Result<()> {
        let Some(mut config) = self.config(id) else { return Ok(()) };
        if config.management_state == management {
            return Ok(());
        }
        config.management_state = management;
        self.repo.save(&config).await?;
        self.configs.lock().unwrap().insert(id, config);

        match management {
            ManagementState::Disabled => {
                self.scheduler.cancel(id);
                self.evaluator.cancel_episode(id);
                let mut states = self.states.lock().unwrap();
                if let Some(state) = states.get_mut(&id) {
                    state.apply(id, ShareStatus::Disabled);
                }
            }
            ManagementState::Enabled => {
                {
                    let mut states = self.states.lock().unwrap();
                    if let Some(state) = states.get_mut(&id) {
                        state.apply(id, ShareStatus::Unmounted);
                        state.suspended_until = None;
                    }
                }
                self.scheduler.schedule(id, EvalEvent::UserInitiated);
            }
        }
        self.mark_dirty();
        Ok(())
    }

    pub async fn toggle_enabled(&self, id: ShareId) -> Result<()> {
        let Some(config) = self.config(id) else { return Ok(()) };
        let next = match config.management_state {
            ManagementState::Enabled => ManagementState::Disabled,
            ManagementState::Disabled => ManagementState::Enabled,
        };
        self.set_management_state(id, next).await
    }

    /// "Stop retrying": disable the share and cancel whatever is in
    /// flight.
    pub async fn stop_retrying(&self, id: ShareId) -> Result<()> {
        self.set_management_state(id, ManagementState::Disabled).await
    }

    /// User asked for a mount now: clear the suspension window and jump
    /// the queue.
    pub fn mount_share(&self, id: ShareId) {
        {
            let mut states = self.states.lock().unwrap();
            if let Some(state) = states.get_mut(&id) {
                state.suspended_until = None;
                // a disabled share mounts when the user says so
                if state.status == ShareStatus::Disabled {
                    state.apply(id, ShareStatus::Unmounted);
                }
            }
        }
        self.scheduler.schedule(id, EvalEvent::UserInitiated);
    }

    pub async fn unmount_share(&self, id: ShareId, user_initiated: bool) {
        self.serialized_unmount(id, user_initiated).await;
    }

    /// Unmount ordered after whatever evaluation is currently running for
    /// this share: cancel pending work and the in-flight episode, then
    /// take the share's serial queue slot. The running evaluation sees
    /// its token at the next checkpoint and releases the lock promptly.
    async fn serialized_unmount(&self, id: ShareId, user_initiated: bool) {
        self.scheduler.cancel(id);
        self.evaluator.cancel_episode(id);
        let lock = self.scheduler.run_lock(id);
        let _guard = lock.lock().await;
        self.evaluator.unmount(id, user_initiated).await;
    }

    pub async fn toggle_mount(&self, id: ShareId) {
        let mounted = {
            let states = self.states.lock().unwrap();
            states.get(&id).map(|s| s.status.is_mounted()).unwrap_or(false)
        };
        if mounted {
            self.unmount_share(id, true).await;
        } else {
            self.mount_share(id);
        }
    }

    pub fn evaluate_all(&self) {
        self.scheduler.schedule_all(self.enabled_share_ids(), EvalEvent::HealthCheck);
    }

    /// Re-read the world for every share; used by the UI's refresh action.
    pub fn refresh_all_states(&self) {
        self.evaluator.services().inspector.clear();
        self.evaluator.services().routes.invalidate_cache();
        self.evaluate_all();
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn share_configs(&self) -> Vec<ShareConfig> {
        self.configs.lock().unwrap().values().cloned().collect()
    }
}
