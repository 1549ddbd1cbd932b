//! Probe cycle driver
//!
//! One cycle parses the config document, probes every peer in document
//! order and applies each result to the liveness store as it arrives.
//! Cycles never overlap: a trigger that finds a cycle in flight waits for
//! that cycle to finish instead of starting a second one.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;

use super::persistence::ProbeStatus;
use super::probe::ReachabilityProbe;
use crate::config::{parse_peers, read_document};
use crate::error::Result;
use crate::registry::Shared;

/// Grace period on top of the probe timeout before the tracker gives up on
/// a probe implementation itself
const PROBE_GRACE: Duration = Duration::from_secs(1);

/// Summary of one completed cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub online: usize,
    pub offline: usize,
    /// Peers removed from the document while the cycle was running
    pub skipped: usize,
}

pub struct LivenessTracker {
    probe: Arc<dyn ReachabilityProbe>,
    probe_timeout: Duration,
    cycle_lock: Mutex<()>,
}

impl LivenessTracker {
    pub fn new(probe: Arc<dyn ReachabilityProbe>, probe_timeout: Duration) -> Self {
        Self {
            probe,
            probe_timeout,
            cycle_lock: Mutex::new(()),
        }
    }

    /// Run a cycle unless one is already in flight, in which case wait for
    /// it to finish. Returns `None` when the trigger was coalesced.
    pub(crate) async fn trigger(&self, shared: &Shared) -> Result<Option<CycleReport>> {
        let _cycle = match self.cycle_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("Probe cycle already running, waiting for it to finish");
                let _in_flight = self.cycle_lock.lock().await;
                return Ok(None);
            }
        };

        self.run_cycle(shared).await.map(Some)
    }

    /// Drive cycles on a fixed interval until `shutdown` flips to true.
    /// The first cycle starts immediately.
    pub(crate) async fn run_periodic(
        &self,
        shared: &Shared,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("Liveness tracker started (interval {:?})", interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.trigger(shared).await {
                        tracing::error!("Probe cycle failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Liveness tracker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn run_cycle(&self, shared: &Shared) -> Result<CycleReport> {
        let settings = &shared.settings;

        let (peers, mut generation) = {
            let state = shared.state.lock().await;
            let content = read_document(&settings.config_path).await?;
            (
                parse_peers(&content, &settings.admin_subnet)?,
                state.generation,
            )
        };

        tracing::info!("Starting probe cycle for {} peers", peers.len());

        let mut report = CycleReport::default();
        // Peers still present after a mid-cycle document change. A freed
        // address may already belong to a new peer, so match on both.
        let mut current: Option<HashSet<(String, String)>> = None;

        for peer in &peers {
            let reachable = self.probe_one(&peer.address).await;
            let now = Utc::now();

            let mut state = shared.state.lock().await;
            if state.generation != generation {
                let content = read_document(&settings.config_path).await?;
                let addresses = parse_peers(&content, &settings.admin_subnet)?
                    .into_iter()
                    .map(|p| (p.name, p.address))
                    .collect();
                current = Some(addresses);
                generation = state.generation;
            }
            if let Some(current) = &current {
                if !current.contains(&(peer.name.clone(), peer.address.clone())) {
                    tracing::debug!("Peer {} removed during cycle, dropping result", peer.name);
                    report.skipped += 1;
                    continue;
                }
            }

            let status = if reachable {
                ProbeStatus::Online
            } else {
                ProbeStatus::Offline
            };
            let previous = state.store.set(&peer.address, status, now);
            let last_seen = state.store.get(&peer.address).last_seen;
            drop(state);

            match status {
                ProbeStatus::Online => {
                    report.online += 1;
                    tracing::info!("Peer {} ({}) is reachable", peer.name, peer.address);
                }
                ProbeStatus::Offline => {
                    report.offline += 1;
                    tracing::info!("Peer {} ({}) is not reachable", peer.name, peer.address);
                }
            }

            if previous != Some(status) {
                shared.publish(
                    "peer_status_changed",
                    serde_json::json!({
                        "name": peer.name,
                        "ip": peer.address,
                        "status": status,
                        "lastSeen": last_seen,
                    }),
                );
            }
        }

        {
            let state = shared.state.lock().await;
            state.store.save(&settings.status_path).await?;
        }

        tracing::info!(
            "Probe cycle finished: {} online, {} offline, {} skipped",
            report.online,
            report.offline,
            report.skipped
        );
        Ok(report)
    }

    async fn probe_one(&self, address: &str) -> bool {
        let limit = self.probe_timeout + PROBE_GRACE;
        match tokio::time::timeout(limit, self.probe.is_reachable(address)).await {
            Ok(reachable) => reachable,
            Err(_) => {
                tracing::warn!("Probe for {} exceeded {:?}, treating as unreachable", address, limit);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::liveness::{LivenessStore, PeerStatus};
    use crate::provision::X25519KeyGenerator;
    use crate::registry::PeerRegistry;
    use crate::Settings;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    const CONFIG: &str = "[Interface]
Address = 10.10.10.1/24
PrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=

# alpha
[Peer]
PublicKey = k-alpha
AllowedIPs = 10.10.10.2/32

# beta
[Peer]
PublicKey = k-beta
AllowedIPs = 10.10.11.2/32

# gamma
[Peer]
PublicKey = k-gamma
AllowedIPs = 10.10.11.3/32
";

    /// Answers from a fixed set and records the order of calls
    struct ScriptedProbe {
        reachable: HashSet<String>,
        calls: StdMutex<Vec<String>>,
        delay: Duration,
    }

    impl ScriptedProbe {
        fn new(reachable: &[&str]) -> Self {
            Self {
                reachable: reachable.iter().map(|s| s.to_string()).collect(),
                calls: StdMutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReachabilityProbe for ScriptedProbe {
        async fn is_reachable(&self, address: &str) -> bool {
            self.calls.lock().unwrap().push(address.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.reachable.contains(address)
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl ReachabilityProbe for HangingProbe {
        async fn is_reachable(&self, _address: &str) -> bool {
            std::future::pending::<bool>().await
        }
    }

    async fn registry_with(
        dir: &std::path::Path,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> PeerRegistry {
        let mut settings = Settings::rooted_at(dir);
        settings.probe_timeout = Duration::from_millis(50);
        std::fs::write(&settings.config_path, CONFIG).unwrap();
        PeerRegistry::open(settings, Arc::new(X25519KeyGenerator), probe)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_cycle_probes_in_document_order() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(ScriptedProbe::new(&["10.10.11.2"]));
        let registry = registry_with(dir.path(), probe.clone()).await;

        let report = registry.run_probe_cycle().await.unwrap().unwrap();
        assert_eq!(
            report,
            CycleReport {
                online: 1,
                offline: 2,
                skipped: 0
            }
        );
        assert_eq!(probe.calls(), vec!["10.10.10.2", "10.10.11.2", "10.10.11.3"]);

        let groups = registry.list_peers().await.unwrap();
        assert_eq!(groups.admin[0].status, PeerStatus::Offline);
        assert_eq!(groups.standard[0].status, PeerStatus::Online);
        assert_eq!(groups.standard[1].status, PeerStatus::Offline);
    }

    #[tokio::test]
    async fn test_cycle_persists_store() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(ScriptedProbe::new(&["10.10.10.2"]));
        let registry = registry_with(dir.path(), probe).await;

        registry.run_probe_cycle().await.unwrap();

        let loaded = LivenessStore::load(&registry.settings().status_path).await;
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.get("10.10.10.2").status, PeerStatus::Online);
    }

    #[tokio::test]
    async fn test_unreachable_keeps_last_seen() {
        let dir = tempfile::tempdir().unwrap();
        let first = Arc::new(ScriptedProbe::new(&["10.10.10.2"]));
        let registry = registry_with(dir.path(), first).await;
        registry.run_probe_cycle().await.unwrap();
        let seen = registry.list_peers().await.unwrap().admin[0].last_seen;
        assert!(seen.is_some());

        // Same settings, now nothing answers
        let settings = registry.settings().clone();
        let registry = PeerRegistry::open(
            settings,
            Arc::new(X25519KeyGenerator),
            Arc::new(ScriptedProbe::new(&[])),
        )
        .await
        .unwrap();
        registry.run_probe_cycle().await.unwrap();

        let alpha = registry.list_peers().await.unwrap().admin[0].clone();
        assert_eq!(alpha.status, PeerStatus::Offline);
        assert_eq!(alpha.last_seen, seen);
    }

    #[tokio::test]
    async fn test_hanging_probe_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::rooted_at(dir.path());
        settings.probe_timeout = Duration::from_millis(10);
        std::fs::write(&settings.config_path, CONFIG).unwrap();
        let registry = PeerRegistry::open(
            settings,
            Arc::new(X25519KeyGenerator),
            Arc::new(HangingProbe),
        )
        .await
        .unwrap();

        let report = registry.run_probe_cycle().await.unwrap().unwrap();
        assert_eq!(report.offline, 3);
    }

    #[tokio::test]
    async fn test_concurrent_trigger_is_coalesced() {
        let dir = tempfile::tempdir().unwrap();
        let mut probe = ScriptedProbe::new(&[]);
        probe.delay = Duration::from_millis(20);
        let probe = Arc::new(probe);
        let registry = registry_with(dir.path(), probe.clone()).await;

        let (a, b) = tokio::join!(registry.run_probe_cycle(), registry.run_probe_cycle());
        let reports = [a.unwrap(), b.unwrap()];

        assert_eq!(reports.iter().filter(|r| r.is_some()).count(), 1);
        assert_eq!(probe.calls().len(), 3);
    }

    fn slow_probe(reachable: &[&str]) -> Arc<ScriptedProbe> {
        let mut probe = ScriptedProbe::new(reachable);
        probe.delay = Duration::from_millis(100);
        Arc::new(probe)
    }

    #[tokio::test]
    async fn test_peer_deleted_mid_cycle_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(dir.path(), slow_probe(&["10.10.10.2"])).await;
        std::fs::create_dir_all(registry.settings().peer_dir("beta", Role::Standard)).unwrap();

        let (report, deleted) = tokio::join!(registry.run_probe_cycle(), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            registry.delete_peer("beta", false).await
        });
        deleted.unwrap();

        let report = report.unwrap().unwrap();
        assert_eq!(
            report,
            CycleReport {
                online: 1,
                offline: 1,
                skipped: 1
            }
        );

        let loaded = LivenessStore::load(&registry.settings().status_path).await;
        assert_eq!(loaded.get("10.10.11.2").status, PeerStatus::Unknown);
        assert_eq!(loaded.get("10.10.11.3").status, PeerStatus::Offline);
    }

    #[tokio::test]
    async fn test_reused_address_keeps_new_peer_seed() {
        let dir = tempfile::tempdir().unwrap();
        // beta's address answers, but beta is replaced before its result lands
        let registry = registry_with(dir.path(), slow_probe(&["10.10.11.2"])).await;
        std::fs::create_dir_all(registry.settings().peer_dir("beta", Role::Standard)).unwrap();

        let (report, created) = tokio::join!(registry.run_probe_cycle(), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            registry.delete_peer("beta", false).await?;
            registry.create_peer("delta", false).await
        });
        let created = created.unwrap();
        assert_eq!(created.ip, "10.10.11.2");
        assert_eq!(report.unwrap().unwrap().skipped, 1);

        let delta = registry.list_peers().await.unwrap().find("delta").cloned().unwrap();
        assert_eq!(delta.status, PeerStatus::Offline);
        assert_eq!(delta.last_seen, created.last_seen);
    }

    #[tokio::test]
    async fn test_missing_document_fails_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(dir.path(), Arc::new(ScriptedProbe::new(&[]))).await;
        std::fs::remove_file(&registry.settings().config_path).unwrap();

        assert!(registry.run_probe_cycle().await.is_err());
    }
}
