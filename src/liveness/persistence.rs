//! Liveness store persistence
//!
//! Maps a peer address to its last probe status and last-seen time. The
//! store is held in memory by the registry and written to a JSON file after
//! every probe cycle and every provisioning mutation.
//!
//! The state file stores:
//! - Schema version
//! - One entry per probed or provisioned address
//!
//! A missing file is a fresh install; a corrupt file is logged and replaced
//! on the next save.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of the most recent probe of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Online,
    Offline,
}

/// Status as reported to callers; `Unknown` means no entry exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Online,
    Offline,
    Unknown,
}

impl From<ProbeStatus> for PeerStatus {
    fn from(status: ProbeStatus) -> Self {
        match status {
            ProbeStatus::Online => Self::Online,
            ProbeStatus::Offline => Self::Offline,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessEntry {
    pub status: ProbeStatus,
    /// Never moves backwards once set
    pub last_seen: DateTime<Utc>,
}

/// What `get` reports for an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Liveness {
    pub status: PeerStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Liveness {
    pub const UNKNOWN: Liveness = Liveness {
        status: PeerStatus::Unknown,
        last_seen: None,
    };
}

/// On-disk form of the store
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreFile {
    /// Schema version for future migrations
    schema_version: u32,
    #[serde(default)]
    entries: BTreeMap<String, LivenessEntry>,
}

const SCHEMA_VERSION: u32 = 1;

/// Address → liveness mapping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LivenessStore {
    entries: BTreeMap<String, LivenessEntry>,
}

impl LivenessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the store from `path`.
    ///
    /// Returns an empty store if:
    /// - the file doesn't exist
    /// - the file is corrupted/unparseable
    pub async fn load(path: &Path) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => match serde_json::from_str::<StoreFile>(&json) {
                Ok(file) => {
                    tracing::debug!(
                        "Loaded {} liveness entries from {:?}",
                        file.entries.len(),
                        path
                    );
                    Self {
                        entries: file.entries,
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to parse liveness file {:?}: {} - starting fresh", path, e);
                    Self::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No liveness file found at {:?}", path);
                Self::new()
            }
            Err(e) => {
                tracing::warn!("Failed to read liveness file {:?}: {} - starting fresh", path, e);
                Self::new()
            }
        }
    }

    /// Write the store to `path` via a temp file and rename
    pub async fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        let file = StoreFile {
            schema_version: SCHEMA_VERSION,
            entries: self.entries.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        write_atomic(path, json.as_bytes()).await?;
        tracing::debug!("Saved {} liveness entries to {:?}", self.entries.len(), path);
        Ok(())
    }

    pub fn get(&self, address: &str) -> Liveness {
        match self.entries.get(address) {
            Some(entry) => Liveness {
                status: entry.status.into(),
                last_seen: Some(entry.last_seen),
            },
            None => Liveness::UNKNOWN,
        }
    }

    /// Record a status for `address`, returning the previous status.
    ///
    /// `Offline` keeps an existing last-seen and only uses `at` as a
    /// first-seen fallback. `Online` never moves last-seen backwards.
    pub fn set(
        &mut self,
        address: &str,
        status: ProbeStatus,
        at: DateTime<Utc>,
    ) -> Option<ProbeStatus> {
        let previous = self.entries.get(address).copied();
        let last_seen = match (status, previous) {
            (ProbeStatus::Online, Some(prev)) => prev.last_seen.max(at),
            (ProbeStatus::Offline, Some(prev)) => prev.last_seen,
            (_, None) => at,
        };

        self.entries
            .insert(address.to_string(), LivenessEntry { status, last_seen });
        previous.map(|p| p.status)
    }

    pub fn remove(&mut self, address: &str) -> Option<LivenessEntry> {
        self.entries.remove(address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Replace `path` atomically: write a sibling temp file, then rename over
/// the target. Existing permissions are carried over on Unix.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let tmp = temp_path(path);
    tokio::fs::write(&tmp, contents).await?;

    #[cfg(unix)]
    {
        if let Ok(meta) = tokio::fs::metadata(path).await {
            tokio::fs::set_permissions(&tmp, meta.permissions()).await?;
        }
    }

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        tokio::fs::remove_file(&tmp).await.ok();
        return Err(e);
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_get_unknown() {
        let store = LivenessStore::new();
        assert_eq!(store.get("10.10.10.2"), Liveness::UNKNOWN);
    }

    #[test]
    fn test_offline_never_rewinds_last_seen() {
        let mut store = LivenessStore::new();
        store.set("10.10.10.2", ProbeStatus::Offline, ts(100));
        store.set("10.10.10.2", ProbeStatus::Offline, ts(200));

        let liveness = store.get("10.10.10.2");
        assert_eq!(liveness.status, PeerStatus::Offline);
        assert_eq!(liveness.last_seen, Some(ts(100)));
    }

    #[test]
    fn test_online_then_offline_keeps_online_time() {
        let mut store = LivenessStore::new();
        store.set("10.10.10.2", ProbeStatus::Online, ts(100));
        let previous = store.set("10.10.10.2", ProbeStatus::Offline, ts(160));

        assert_eq!(previous, Some(ProbeStatus::Online));
        let liveness = store.get("10.10.10.2");
        assert_eq!(liveness.status, PeerStatus::Offline);
        assert_eq!(liveness.last_seen, Some(ts(100)));
    }

    #[test]
    fn test_online_is_monotonic() {
        let mut store = LivenessStore::new();
        store.set("10.10.10.2", ProbeStatus::Online, ts(300));
        store.set("10.10.10.2", ProbeStatus::Online, ts(200));
        assert_eq!(store.get("10.10.10.2").last_seen, Some(ts(300)));

        store.set("10.10.10.2", ProbeStatus::Online, ts(400));
        assert_eq!(store.get("10.10.10.2").last_seen, Some(ts(400)));
    }

    #[test]
    fn test_remove() {
        let mut store = LivenessStore::new();
        store.set("10.10.11.4", ProbeStatus::Online, ts(1));
        assert!(store.remove("10.10.11.4").is_some());
        assert!(store.is_empty());
        assert_eq!(store.get("10.10.11.4").status, PeerStatus::Unknown);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("clients-status.json");

        let mut store = LivenessStore::new();
        store.set("10.10.10.2", ProbeStatus::Online, ts(1_706_600_000));
        store.set("10.10.11.2", ProbeStatus::Offline, ts(1_706_600_100));
        store.save(&path).await.unwrap();

        let json = std::fs::read_to_string(&path).unwrap();
        assert!(json.contains("\"schema_version\": 1"));
        assert!(json.contains("\"status\": \"online\""));

        let loaded = LivenessStore::load(&path).await;
        assert_eq!(loaded, store);

        // No temp files left behind
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LivenessStore::load(&dir.path().join("absent.json")).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_load_corrupted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clients-status.json");
        std::fs::write(&path, "{ invalid json without closing brace").unwrap();

        let store = LivenessStore::load(&path).await;
        assert!(store.is_empty());
    }
}
