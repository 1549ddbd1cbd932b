//! Configuration handling
//!
//! Parsing of the server WireGuard config document and the roster's own
//! deployment settings.

mod parser;
mod settings;

use std::path::Path;

pub(crate) use parser::block_header;
pub use parser::{interface_private_key, parse_peers, PeerRecord};
pub use settings::{KeygenBackend, Role, Settings, Subnet};

use crate::error::ConfigError;

/// Read the config document, mapping a missing file to `FileNotFound`
pub async fn read_document(path: &Path) -> Result<String, ConfigError> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound {
                path: path.display().to_string(),
            }
        } else {
            ConfigError::Io(e)
        }
    })
}
