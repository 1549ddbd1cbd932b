//! Peer provisioning and deprovisioning
//!
//! Creating a peer touches three places: the credential directory, the
//! server config document and the liveness store. All of it happens under
//! the registry's state lock, and a failed step undoes the earlier ones.

mod document;
mod keys;

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

pub use document::{append_block, find_block, remove_block, render_peer_block, ClientDocument};
pub use keys::{
    derive_public_key, generate_or_placeholder, key_generator, KeyGenerator, KeyTriple,
    WgToolKeyGenerator, X25519KeyGenerator, PLACEHOLDER_PREFIX,
};

use crate::allocator;
use crate::config::{interface_private_key, parse_peers, read_document, PeerRecord, Role, Settings};
use crate::error::{ConfigError, Result, RosterError};
use crate::liveness::persistence::write_atomic;
use crate::liveness::ProbeStatus;
use crate::registry::{RegistryState, Shared};

/// Shown in client documents when the server key is unknown
const PLACEHOLDER_SERVER_KEY: &str = "PLACEHOLDER-SERVER-PUBLIC-KEY";

/// Credential files written for every peer, besides `<name>.conf`
const PRIVATE_KEY_FILE: &str = "private.key";
const PUBLIC_KEY_FILE: &str = "public.key";
const PRESHARED_KEY_FILE: &str = "preshared.key";

/// A completed step that must be reverted if a later one fails
enum Undo {
    RemoveDir(PathBuf),
    RestoreDocument(String),
    ForgetAddress(String),
}

pub struct Provisioner {
    keygen: Arc<dyn KeyGenerator>,
}

impl Provisioner {
    pub fn new(keygen: Arc<dyn KeyGenerator>) -> Self {
        Self { keygen }
    }

    /// Create a peer and return its record and 1-based position in the
    /// document.
    pub(crate) async fn create(
        &self,
        shared: &Shared,
        name: &str,
        role: Role,
    ) -> Result<(PeerRecord, usize)> {
        validate_name(name)?;
        let settings = &shared.settings;
        let dir = settings.peer_dir(name, role);

        let mut state = shared.state.lock().await;

        if tokio::fs::try_exists(&dir).await? {
            return Err(RosterError::DuplicateName {
                name: name.to_string(),
            });
        }

        let subnet = settings.subnet(role);
        let mut address = allocator::allocate(&settings.config_path, subnet).await?;

        let original = read_document(&settings.config_path).await?;
        let existing = parse_peers(&original, &settings.admin_subnet)?;
        if existing.iter().any(|p| p.name == name) || find_block(&original, name).is_some() {
            return Err(RosterError::DuplicateName {
                name: name.to_string(),
            });
        }
        // The allocator may have fallen back to a random host on a read
        // error; re-check against the text being appended to.
        if allocator::used_octets(&original, subnet).contains(&address.octets()[3]) {
            address = allocator::next_free_address(&original, subnet)?;
        }

        let keys = generate_or_placeholder(Arc::clone(&self.keygen)).await;
        let server_public_key = server_public_key(settings, &original);

        let mut undo = Vec::new();
        let result = write_peer(
            settings,
            &mut state,
            &mut undo,
            PeerPlan {
                name,
                dir: &dir,
                address,
                keys: &keys,
                server_public_key: &server_public_key,
                original: &original,
            },
        )
        .await;

        if let Err(e) = result {
            tracing::error!("Creating peer {} failed: {}, rolling back", name, e);
            rollback(settings, &mut state, undo).await;
            return Err(e);
        }
        drop(state);

        tracing::info!(
            "Created peer {} ({}) with role {:?}{}",
            name,
            address,
            role,
            if keys.placeholder { " [placeholder keys]" } else { "" }
        );

        let record = PeerRecord {
            name: name.to_string(),
            address: address.to_string(),
            public_key: keys.public_key.clone(),
            role,
        };
        shared.publish(
            "peer_added",
            serde_json::json!({
                "name": record.name,
                "ip": record.address,
                "isAdmin": role.is_admin(),
                "placeholderKeys": keys.placeholder,
            }),
        );
        Ok((record, existing.len() + 1))
    }

    pub(crate) async fn delete(&self, shared: &Shared, name: &str, role: Role) -> Result<()> {
        validate_name(name)?;
        let settings = &shared.settings;
        let dir = settings.peer_dir(name, role);

        let mut state = shared.state.lock().await;

        if !tokio::fs::try_exists(&dir).await? {
            return Err(RosterError::NotFound {
                name: name.to_string(),
            });
        }

        let original = read_document(&settings.config_path).await?;
        let address = parse_peers(&original, &settings.admin_subnet)?
            .into_iter()
            .find(|p| p.name == name)
            .map(|p| p.address);

        let rewritten = match remove_block(&original, name) {
            Some(updated) => {
                write_atomic(&settings.config_path, updated.as_bytes()).await?;
                state.generation += 1;
                true
            }
            // Listed but not removable: leave the directory and store alone
            None if address.is_some() => {
                return Err(ConfigError::UnmatchedBlock {
                    name: name.to_string(),
                }
                .into());
            }
            None => {
                tracing::warn!("No block for peer {} in {:?}", name, settings.config_path);
                false
            }
        };

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            tracing::error!("Removing {:?} failed: {}, restoring config", dir, e);
            if rewritten {
                rollback(
                    settings,
                    &mut state,
                    vec![Undo::RestoreDocument(original)],
                )
                .await;
            }
            return Err(e.into());
        }

        if let Some(address) = &address {
            if state.store.remove(address).is_some() {
                state.store.save(&settings.status_path).await?;
            }
        }
        drop(state);

        tracing::info!("Deleted peer {} ({})", name, address.as_deref().unwrap_or("no address"));
        shared.publish(
            "peer_removed",
            serde_json::json!({
                "name": name,
                "ip": address,
                "isAdmin": role.is_admin(),
            }),
        );
        Ok(())
    }

    /// Raw text of the peer's client config document
    pub(crate) async fn client_config(
        &self,
        shared: &Shared,
        name: &str,
        role: Role,
    ) -> Result<String> {
        validate_name(name)?;
        let path = client_config_path(&shared.settings.peer_dir(name, role), name);

        let _state = shared.state.lock().await;
        tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RosterError::NotFound {
                    name: name.to_string(),
                }
            } else {
                e.into()
            }
        })
    }
}

struct PeerPlan<'a> {
    name: &'a str,
    dir: &'a Path,
    address: Ipv4Addr,
    keys: &'a KeyTriple,
    server_public_key: &'a str,
    original: &'a str,
}

/// Credential files, config append and store seed, recording undo steps
async fn write_peer(
    settings: &Settings,
    state: &mut RegistryState,
    undo: &mut Vec<Undo>,
    plan: PeerPlan<'_>,
) -> Result<()> {
    tokio::fs::create_dir_all(plan.dir).await?;
    undo.push(Undo::RemoveDir(plan.dir.to_path_buf()));
    restrict_permissions(plan.dir, 0o700).await;

    let client_doc = ClientDocument {
        keys: plan.keys,
        address: plan.address,
        dns: settings.dns.as_deref(),
        server_public_key: plan.server_public_key,
        endpoint: settings.endpoint.as_deref(),
        allowed_ips: &settings.client_allowed_ips(),
        keepalive_secs: settings.keepalive_secs,
    }
    .render();

    let files = [
        (client_config_path(plan.dir, plan.name), client_doc),
        (plan.dir.join(PRIVATE_KEY_FILE), format!("{}\n", plan.keys.private_key)),
        (plan.dir.join(PUBLIC_KEY_FILE), format!("{}\n", plan.keys.public_key)),
        (plan.dir.join(PRESHARED_KEY_FILE), format!("{}\n", plan.keys.preshared_key)),
    ];
    for (path, contents) in &files {
        tokio::fs::write(path, contents).await?;
        restrict_permissions(path, 0o600).await;
    }

    let block = render_peer_block(plan.name, plan.keys, plan.address);
    let updated = append_block(plan.original, &block);
    write_atomic(&settings.config_path, updated.as_bytes()).await?;
    state.generation += 1;
    undo.push(Undo::RestoreDocument(plan.original.to_string()));

    // A stale entry for a reused address must not leak its last-seen
    let address = plan.address.to_string();
    state.store.remove(&address);
    state.store.set(&address, ProbeStatus::Offline, Utc::now());
    undo.push(Undo::ForgetAddress(address));
    state.store.save(&settings.status_path).await?;

    Ok(())
}

/// Revert completed steps, newest first. Failures are logged and skipped.
async fn rollback(settings: &Settings, state: &mut RegistryState, undo: Vec<Undo>) {
    for step in undo.into_iter().rev() {
        match step {
            Undo::RemoveDir(dir) => {
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    tracing::error!("Rollback: failed to remove {:?}: {}", dir, e);
                }
            }
            Undo::RestoreDocument(content) => {
                if let Err(e) = write_atomic(&settings.config_path, content.as_bytes()).await {
                    tracing::error!("Rollback: failed to restore {:?}: {}", settings.config_path, e);
                }
                state.generation += 1;
            }
            Undo::ForgetAddress(address) => {
                state.store.remove(&address);
            }
        }
    }
}

/// Reject names that would escape the credential directory or break the
/// `# <name>` comment line
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name != name.trim()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control);

    if invalid {
        return Err(RosterError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn client_config_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.conf", name))
}

/// Explicit setting, else derived from the `[Interface]` private key
fn server_public_key(settings: &Settings, document: &str) -> String {
    if let Some(key) = &settings.server_public_key {
        return key.clone();
    }
    match interface_private_key(document).and_then(|k| derive_public_key(&k)) {
        Some(key) => key,
        None => {
            tracing::warn!("Server public key unknown, client config gets a placeholder");
            PLACEHOLDER_SERVER_KEY.to_string()
        }
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await {
        tracing::debug!("Could not set permissions on {:?}: {}", path, e);
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path, _mode: u32) {}
