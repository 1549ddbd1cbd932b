//! wg-roster - WireGuard peer roster service
//!
//! Manages the named peers of a single WireGuard server config document.
//!
//! # Features
//!
//! - Peers listed from the config text, split into admin and standard roles
//! - Sequential address allocation per role subnet
//! - Peer provisioning with credential files and client config documents
//! - Periodic ICMP liveness tracking with a persisted status store
//! - REST API with server-sent events
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use wg_roster::{key_generator, PeerRegistry, PingProbe, Settings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), wg_roster::RosterError> {
//!     let settings = Settings::default();
//!     let probe = Arc::new(PingProbe::new(settings.probe_timeout));
//!     let keygen = key_generator(settings.keygen);
//!     let registry = PeerRegistry::open(settings, keygen, probe).await?;
//!
//!     let peer = registry.create_peer("alice-laptop", false).await?;
//!     println!("{} got {}", peer.name, peer.ip);
//!     Ok(())
//! }
//! ```

pub mod allocator;
pub mod config;
pub mod daemon;
pub mod error;
pub mod liveness;
pub mod provision;
pub mod registry;

pub use config::{KeygenBackend, Role, Settings, Subnet};
pub use daemon::DaemonService;
pub use error::RosterError;
pub use liveness::{PeerStatus, PingProbe, ReachabilityProbe};
pub use provision::{key_generator, KeyGenerator};
pub use registry::{PeerGroups, PeerRegistry, PeerView};
