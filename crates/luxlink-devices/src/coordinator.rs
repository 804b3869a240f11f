/*!
 * Discovery coordinator: the periodic cycle that keeps the registry
 * converged with the network.
 *
 * Each cycle collects candidate addresses from every source plus the manual
 * list, diffs against the previous snapshot, onboards new devices, retires
 * confirmed-absent ones and re-attempts unavailable sessions. A failing
 * source is logged and contributes nothing; it never aborts the cycle.
 * Cycles run strictly one at a time; if a cycle outlasts the interval the
 * next one is deferred until it completes.
 */
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use luxlink_core::config::SharedConfig;

use crate::discovery::{BroadcastDiscoverer, DiscoverySource, SubnetScanner};
use crate::error::{DeviceError, Result};
use crate::registry::SharedDeviceRegistry;
use crate::session::DeviceSession;

/// Counters describing one completed discovery cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Addresses in the merged snapshot
    pub discovered: usize,
    /// Addresses not present in the previous snapshot
    pub appeared: usize,
    /// Addresses from the previous snapshot no longer found
    pub disappeared: usize,
    /// Sessions connected and registered this cycle
    pub onboarded: usize,
    /// Sessions disconnected and removed this cycle
    pub retired: usize,
    /// Unavailable sessions restored by the health sweep
    pub revived: usize,
}

/// Compute set differences between two discovery snapshots
pub fn snapshot_diff(
    previous: &HashSet<IpAddr>,
    current: &HashSet<IpAddr>,
) -> (HashSet<IpAddr>, HashSet<IpAddr>) {
    let appeared = current.difference(previous).copied().collect();
    let disappeared = previous.difference(current).copied().collect();
    (appeared, disappeared)
}

/// Owns the periodic discovery cycle and reconciles the device registry
pub struct DiscoveryCoordinator {
    config: SharedConfig,
    registry: SharedDeviceRegistry,
    /// Sources that run in every cycle (broadcast)
    primary_sources: Vec<Arc<dyn DiscoverySource>>,
    /// Sources whose startup participation is configurable (subnet scans)
    subnet_sources: Vec<Arc<dyn DiscoverySource>>,
    manual: HashSet<IpAddr>,
    previous: Mutex<HashSet<IpAddr>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for DiscoveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryCoordinator")
            .field("manual", &self.manual)
            .field("primary_sources", &self.primary_sources.len())
            .field("subnet_sources", &self.subnet_sources.len())
            .finish_non_exhaustive()
    }
}

impl DiscoveryCoordinator {
    /// Create a coordinator with sources built from the configuration:
    /// one broadcast discoverer plus one scanner per configured subnet.
    pub fn new(config: SharedConfig, registry: SharedDeviceRegistry) -> Self {
        let discovery = &config.get().discovery;
        let broadcast: Arc<dyn DiscoverySource> = Arc::new(BroadcastDiscoverer::new(
            discovery.broadcast_port,
            Duration::from_millis(discovery.broadcast_window_ms),
        ));
        let subnet_sources = config
            .get()
            .subnet_specs()
            .into_iter()
            .map(|spec| {
                Arc::new(SubnetScanner::new(
                    spec,
                    config.get().session.port,
                    Duration::from_millis(discovery.probe_timeout_ms),
                    discovery.probe_concurrency,
                )) as Arc<dyn DiscoverySource>
            })
            .collect();

        Self::with_sources(config.clone(), registry, vec![broadcast], subnet_sources)
    }

    /// Create a coordinator with explicit sources
    pub fn with_sources(
        config: SharedConfig,
        registry: SharedDeviceRegistry,
        primary_sources: Vec<Arc<dyn DiscoverySource>>,
        subnet_sources: Vec<Arc<dyn DiscoverySource>>,
    ) -> Self {
        let manual = config.get().manual_addresses().into_iter().collect();
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            registry,
            primary_sources,
            subnet_sources,
            manual,
            previous: Mutex::new(HashSet::new()),
            shutdown,
        }
    }

    /// Handle to the registry this coordinator reconciles
    pub fn registry(&self) -> &SharedDeviceRegistry {
        &self.registry
    }

    /// Request a graceful stop of [`run`].
    ///
    /// The in-flight cycle finishes its own network timeouts; afterwards
    /// every registered session is disconnected.
    ///
    /// [`run`]: DiscoveryCoordinator::run
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Run the discovery loop until [`shutdown`] is called.
    ///
    /// The startup cycle runs immediately; subnet scanners join it only if
    /// configured, to keep startup latency down. Subsequent cycles run at
    /// the configured interval and include all sources.
    ///
    /// [`shutdown`]: DiscoveryCoordinator::shutdown
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let interval = Duration::from_secs(self.config.get().discovery.scan_interval_secs);
        let startup_subnets = self.config.get().discovery.scan_subnets_on_startup;

        info!(interval_secs = interval.as_secs(), "Discovery loop starting");
        if let Err(e) = self.run_cycle(startup_subnets).await {
            warn!(error = %e, "Startup discovery cycle failed");
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = sleep(interval) => {
                    // The cycle is awaited inline, so cycles never overlap;
                    // a slow cycle defers the next tick.
                    if let Err(e) = self.run_cycle(true).await {
                        warn!(error = %e, "Discovery cycle failed");
                    }
                }
            }
        }

        info!("Discovery loop stopping, disconnecting all sessions");
        self.registry.registry().disconnect_all().await?;
        Ok(())
    }

    /// Run one full discovery cycle: collect, diff, onboard, retire, sweep.
    pub async fn run_cycle(&self, include_subnets: bool) -> Result<CycleStats> {
        let mut stats = CycleStats::default();

        // Collect: all sources concurrently, tolerating per-source failure
        let snapshot = self.collect(include_subnets).await;
        stats.discovered = snapshot.len();

        let mut previous = self.previous.lock().await;
        let (appeared, disappeared) = snapshot_diff(&previous, &snapshot);
        stats.appeared = appeared.len();
        stats.disappeared = disappeared.len();

        if !appeared.is_empty() {
            info!(count = appeared.len(), "New addresses discovered");
        }

        // Onboard: every snapshot address without a registered session.
        // This covers fresh addresses and ones whose earlier onboarding
        // failed but that are still discoverable.
        let registered = self.registry.registry().addresses()?;
        let candidates: Vec<IpAddr> = snapshot
            .iter()
            .filter(|ip| !registered.contains(ip))
            .copied()
            .collect();
        let onboarded = join_all(candidates.into_iter().map(|ip| self.onboard(ip))).await;
        stats.onboarded = onboarded.into_iter().filter(|ok| *ok).count();

        // Retire: sessions whose address disappeared from every source
        for ip in &disappeared {
            if let Some(session) = self.registry.registry().find_by_ip(*ip)? {
                session.disconnect().await;
                if let Some(device_id) = session.device_id() {
                    self.registry.registry().remove(&device_id)?;
                    info!(ip = %ip, device_id = %device_id, "Retired disappeared device");
                    stats.retired += 1;
                }
            }
        }

        // Health sweep: reconnect unavailable sessions. This is the sole
        // retry mechanism for transient network drops.
        for session in self.registry.registry().list()? {
            if !session.is_available() {
                match session.connect().await {
                    Ok(()) => {
                        info!(ip = %session.ip(), "Restored unavailable device");
                        stats.revived += 1;
                    }
                    Err(e) => {
                        debug!(ip = %session.ip(), error = %e, "Reconnection attempt failed");
                    }
                }
            }
        }

        *previous = snapshot;
        debug!(?stats, "Discovery cycle complete");
        Ok(stats)
    }

    /// Gather the current snapshot: sources plus manual addresses
    async fn collect(&self, include_subnets: bool) -> HashSet<IpAddr> {
        let mut sources: Vec<&Arc<dyn DiscoverySource>> = self.primary_sources.iter().collect();
        if include_subnets {
            sources.extend(self.subnet_sources.iter());
        }

        let results = join_all(sources.iter().map(|source| async move {
            (source.name(), source.discover().await)
        }))
        .await;

        let mut snapshot: HashSet<IpAddr> = self.manual.clone();
        for (name, result) in results {
            match result {
                Ok(found) => {
                    debug!(source = name, count = found.len(), "Source finished");
                    snapshot.extend(found);
                }
                Err(e) => {
                    warn!(source = name, error = %e, "Source failed, continuing with partial results");
                }
            }
        }
        snapshot
    }

    /// Connect and register one candidate address.
    ///
    /// Failures are contained: a connect error drops the candidate until the
    /// next cycle, a duplicate identity disconnects the later session.
    async fn onboard(&self, ip: IpAddr) -> bool {
        let session = Arc::new(DeviceSession::new(ip, self.config.get().session.clone()));
        match session.connect().await {
            Ok(()) => {}
            Err(e) => {
                debug!(ip = %ip, error = %e, "Onboarding connect failed");
                return false;
            }
        }

        match self.registry.registry().add(session.clone()) {
            Ok(()) => true,
            Err(DeviceError::DuplicateDevice(device_id)) => {
                warn!(ip = %ip, device_id = %device_id, "Duplicate identity, dropping session");
                session.disconnect().await;
                false
            }
            Err(e) => {
                warn!(ip = %ip, error = %e, "Failed to register device");
                session.disconnect().await;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use crate::registry::RegistryEvent;
    use crate::session::tests::{spawn_mock_device_with_id, MockBehavior};
    use luxlink_core::config::{Config, SessionConfig, SharedConfig};

    /// A discovery source whose result set can be changed between cycles
    #[derive(Debug, Default)]
    struct StubSource {
        addrs: StdMutex<HashSet<IpAddr>>,
    }

    impl StubSource {
        fn set(&self, addrs: &[IpAddr]) {
            *self.addrs.lock().unwrap() = addrs.iter().copied().collect();
        }
    }

    #[async_trait]
    impl DiscoverySource for StubSource {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn discover(&self) -> Result<HashSet<IpAddr>> {
            Ok(self.addrs.lock().unwrap().clone())
        }
    }

    /// A source that always fails, for partial-result cycles
    #[derive(Debug)]
    struct FailingSource;

    #[async_trait]
    impl DiscoverySource for FailingSource {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn discover(&self) -> Result<HashSet<IpAddr>> {
            Err(DeviceError::Timeout(Duration::from_secs(1)))
        }
    }

    fn test_shared_config(port: u16) -> SharedConfig {
        let mut config = Config::default();
        config.session = SessionConfig {
            port,
            connect_timeout_secs: 5,
            read_timeout_secs: 1,
            read_attempts: 3,
            control_await_ack: false,
        };
        SharedConfig::new(config)
    }

    fn coordinator_with_stub(
        port: u16,
    ) -> (Arc<StubSource>, DiscoveryCoordinator, SharedDeviceRegistry) {
        let stub = Arc::new(StubSource::default());
        let registry = SharedDeviceRegistry::new();
        let coordinator = DiscoveryCoordinator::with_sources(
            test_shared_config(port),
            registry.clone(),
            vec![stub.clone() as Arc<dyn DiscoverySource>],
            Vec::new(),
        );
        (stub, coordinator, registry)
    }

    #[test]
    fn test_snapshot_diff() {
        let a = IpAddr::from_str("10.0.0.1").unwrap();
        let b = IpAddr::from_str("10.0.0.2").unwrap();
        let c = IpAddr::from_str("10.0.0.3").unwrap();
        let d = IpAddr::from_str("10.0.0.4").unwrap();

        let previous = HashSet::from([a, b, c]);
        let current = HashSet::from([b, c, d]);
        let (appeared, disappeared) = snapshot_diff(&previous, &current);

        assert_eq!(appeared, HashSet::from([d]));
        assert_eq!(disappeared, HashSet::from([a]));
    }

    #[test_log::test(tokio::test)]
    async fn test_onboard_and_idempotence() {
        let addr = spawn_mock_device_with_id(MockBehavior::Normal, "X", "1").await;
        let (stub, coordinator, registry) = coordinator_with_stub(addr.port());
        stub.set(&[addr.ip()]);

        let stats = coordinator.run_cycle(true).await.unwrap();
        assert_eq!(stats.onboarded, 1);
        assert_eq!(registry.registry().len().unwrap(), 1);

        let session = registry.registry().get("X").unwrap();
        assert!(session.is_available());
        assert_eq!(session.identity().unwrap().device_type_code, 1);

        // Unchanged environment: the second pass changes nothing
        let stats = coordinator.run_cycle(true).await.unwrap();
        assert_eq!(stats.onboarded, 0);
        assert_eq!(stats.retired, 0);
        assert_eq!(stats.appeared, 0);
        assert_eq!(stats.disappeared, 0);
        assert_eq!(registry.registry().len().unwrap(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_retire_disappeared_device() {
        let addr = spawn_mock_device_with_id(MockBehavior::Normal, "gone-1", "2").await;
        let (stub, coordinator, registry) = coordinator_with_stub(addr.port());
        let mut events = registry.registry().subscribe();

        stub.set(&[addr.ip()]);
        coordinator.run_cycle(true).await.unwrap();
        assert_eq!(registry.registry().len().unwrap(), 1);

        stub.set(&[]);
        let stats = coordinator.run_cycle(true).await.unwrap();
        assert_eq!(stats.retired, 1);
        assert!(registry.registry().is_empty().unwrap());

        // Added, then removed
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::DeviceAdded(_)
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::DeviceRemoved(id) if id == "gone-1"
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_health_sweep_restores_availability() {
        // The mock drops each connection after serving the handshake, so the
        // first post-onboard exchange fails; the device then accepts fresh
        // connections again.
        let addr = spawn_mock_device_with_id(MockBehavior::DropAfterHandshake, "flaky", "1").await;
        let (stub, coordinator, registry) = coordinator_with_stub(addr.port());
        stub.set(&[addr.ip()]);

        coordinator.run_cycle(true).await.unwrap();
        let session = registry.registry().get("flaky").unwrap();
        assert!(session.is_available());

        assert!(session.query().await.is_err());
        assert!(!session.is_available());

        let stats = coordinator.run_cycle(true).await.unwrap();
        assert_eq!(stats.revived, 1);
        assert!(session.is_available());
    }

    #[test_log::test(tokio::test)]
    async fn test_failing_source_does_not_abort_cycle() {
        let addr = spawn_mock_device_with_id(MockBehavior::Normal, "partial", "1").await;
        let stub = Arc::new(StubSource::default());
        stub.set(&[addr.ip()]);
        let registry = SharedDeviceRegistry::new();
        let coordinator = DiscoveryCoordinator::with_sources(
            test_shared_config(addr.port()),
            registry.clone(),
            vec![
                Arc::new(FailingSource) as Arc<dyn DiscoverySource>,
                stub as Arc<dyn DiscoverySource>,
            ],
            Vec::new(),
        );

        let stats = coordinator.run_cycle(true).await.unwrap();
        assert_eq!(stats.onboarded, 1);
        assert_eq!(registry.registry().len().unwrap(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_duplicate_identity_across_addresses_rejected() {
        // Two mock devices claim the same device id; only one wins
        let first = spawn_mock_device_with_id(MockBehavior::Normal, "twin", "1").await;
        let second = spawn_mock_device_with_id(MockBehavior::Normal, "twin", "1").await;
        assert_eq!(first.ip(), second.ip());

        // Different ports but the same ip; use manual sessions to exercise
        // the registry path directly.
        let registry = SharedDeviceRegistry::new();
        let s1 = Arc::new(DeviceSession::new(
            first.ip(),
            crate::session::tests::test_config(first.port()),
        ));
        let s2 = Arc::new(DeviceSession::new(
            second.ip(),
            crate::session::tests::test_config(second.port()),
        ));
        s1.connect().await.unwrap();
        s2.connect().await.unwrap();

        registry.registry().add(s1).unwrap();
        let err = registry.registry().add(s2).unwrap_err();
        assert!(matches!(err, DeviceError::DuplicateDevice(_)));
        assert_eq!(registry.registry().len().unwrap(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_run_and_graceful_shutdown() {
        let addr = spawn_mock_device_with_id(MockBehavior::Normal, "loop-dev", "1").await;
        let (stub, coordinator, registry) = coordinator_with_stub(addr.port());
        stub.set(&[addr.ip()]);

        let coordinator = Arc::new(coordinator);
        let runner = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run().await })
        };

        // Give the startup cycle time to onboard, then stop the loop
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(registry.registry().len().unwrap(), 1);
        let session = registry.registry().get("loop-dev").unwrap();
        assert!(session.is_available());

        coordinator.shutdown();
        runner.await.unwrap().unwrap();

        // Sessions stay registered but are disconnected on shutdown
        assert!(!session.is_available());
    }
}
