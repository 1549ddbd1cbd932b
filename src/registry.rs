//! Peer registry
//!
//! Entry point for everything the HTTP layer needs. The config document is
//! re-read on every call; the liveness store lives in memory behind a single
//! lock that also serialises every write to the document and the store file.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};

use crate::config::{parse_peers, read_document, PeerRecord, Role, Settings};
use crate::error::Result;
use crate::liveness::{CycleReport, Liveness, LivenessStore, LivenessTracker, PeerStatus, ReachabilityProbe};
use crate::provision::{KeyGenerator, Provisioner};

/// Capacity of the event channel; slow SSE subscribers lose old events
const EVENT_CAPACITY: usize = 64;

/// Mutable state guarded by the registry lock
pub(crate) struct RegistryState {
    pub store: LivenessStore,
    /// Bumped on every write to the config document
    pub generation: u64,
}

pub(crate) struct Shared {
    pub settings: Settings,
    pub state: Mutex<RegistryState>,
    events: broadcast::Sender<String>,
}

impl Shared {
    /// Broadcast a JSON-RPC style notification to event subscribers
    pub(crate) fn publish(&self, method: &str, params: serde_json::Value) {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        // No subscribers is not an error
        let _ = self.events.send(notification.to_string());
    }
}

/// A peer joined with its liveness
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerView {
    /// 1-based position in the config document
    pub id: usize,
    pub name: String,
    pub ip: String,
    pub public_key: String,
    pub is_admin: bool,
    pub status: PeerStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

impl PeerView {
    fn new(id: usize, record: PeerRecord, liveness: Liveness) -> Self {
        Self {
            id,
            is_admin: record.role.is_admin(),
            name: record.name,
            ip: record.address,
            public_key: record.public_key,
            status: liveness.status,
            last_seen: liveness.last_seen,
        }
    }
}

/// Peers split by role, each in document order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeerGroups {
    #[serde(rename = "adminClients")]
    pub admin: Vec<PeerView>,
    #[serde(rename = "normalClients")]
    pub standard: Vec<PeerView>,
}

impl PeerGroups {
    fn build(records: Vec<PeerRecord>, store: &LivenessStore) -> Self {
        let mut groups = Self::default();
        for (i, record) in records.into_iter().enumerate() {
            let liveness = store.get(&record.address);
            let view = PeerView::new(i + 1, record, liveness);
            if view.is_admin {
                groups.admin.push(view);
            } else {
                groups.standard.push(view);
            }
        }
        groups
    }

    pub fn len(&self) -> usize {
        self.admin.len() + self.standard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, name: &str) -> Option<&PeerView> {
        self.admin
            .iter()
            .chain(self.standard.iter())
            .find(|p| p.name == name)
    }
}

/// Handle to the registry; cheap to clone
#[derive(Clone)]
pub struct PeerRegistry {
    shared: Arc<Shared>,
    tracker: Arc<LivenessTracker>,
    provisioner: Arc<Provisioner>,
}

impl PeerRegistry {
    /// Validate settings and load the liveness store
    pub async fn open(
        settings: Settings,
        keygen: Arc<dyn KeyGenerator>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Result<Self> {
        settings.validate()?;

        let store = LivenessStore::load(&settings.status_path).await;
        tracing::info!(
            "Loaded {} liveness entries, config document {:?}",
            store.len(),
            settings.config_path
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let tracker = LivenessTracker::new(probe, settings.probe_timeout);

        Ok(Self {
            shared: Arc::new(Shared {
                settings,
                state: Mutex::new(RegistryState {
                    store,
                    generation: 0,
                }),
                events,
            }),
            tracker: Arc::new(tracker),
            provisioner: Arc::new(Provisioner::new(keygen)),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    /// Subscribe to registry events (JSON strings)
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.shared.events.subscribe()
    }

    /// Parse the document and join every peer with its liveness
    pub async fn list_peers(&self) -> Result<PeerGroups> {
        let settings = &self.shared.settings;
        let state = self.shared.state.lock().await;
        let content = read_document(&settings.config_path).await?;
        let records = parse_peers(&content, &settings.admin_subnet)?;

        let groups = PeerGroups::build(records, &state.store);
        tracing::debug!(
            "Listed {} admin and {} standard peers",
            groups.admin.len(),
            groups.standard.len()
        );
        Ok(groups)
    }

    /// Run one probe cycle (or wait for the one in flight) and list
    pub async fn refresh_liveness(&self) -> Result<PeerGroups> {
        self.run_probe_cycle().await?;
        self.list_peers().await
    }

    /// Run one probe cycle. `None` when an in-flight cycle was awaited
    /// instead.
    pub async fn run_probe_cycle(&self) -> Result<Option<CycleReport>> {
        self.tracker.trigger(&self.shared).await
    }

    pub async fn create_peer(&self, name: &str, is_admin: bool) -> Result<PeerView> {
        let role = Role::from_is_admin(is_admin);
        let (record, id) = self.provisioner.create(&self.shared, name, role).await?;

        let liveness = {
            let state = self.shared.state.lock().await;
            state.store.get(&record.address)
        };
        Ok(PeerView::new(id, record, liveness))
    }

    pub async fn delete_peer(&self, name: &str, is_admin: bool) -> Result<()> {
        let role = Role::from_is_admin(is_admin);
        self.provisioner.delete(&self.shared, name, role).await
    }

    pub async fn client_config(&self, name: &str, is_admin: bool) -> Result<String> {
        let role = Role::from_is_admin(is_admin);
        self.provisioner.client_config(&self.shared, name, role).await
    }

    /// Periodic probe loop; returns when `shutdown` becomes true
    pub async fn run_tracker(&self, shutdown: watch::Receiver<bool>) {
        let interval = self.shared.settings.probe_interval;
        self.tracker
            .run_periodic(&self.shared, interval, shutdown)
            .await
    }
}
