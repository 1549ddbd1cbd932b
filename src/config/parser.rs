//! Server config document parser
//!
//! Extracts named peer blocks from a WireGuard server `.conf`. Each peer is
//! introduced by a `# <name>` comment line directly followed by `[Peer]`.
//! Parsing is deliberately permissive: keys and addresses are passed through
//! as the substrings the patterns matched, and incomplete blocks are skipped.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use super::settings::{Role, Subnet};
use crate::error::ConfigError;

const INTERFACE_MARKER: &str = "[Interface]";

/// A peer as described by the config document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerRecord {
    /// Display name from the comment line
    pub name: String,
    /// First IPv4 literal of the AllowedIPs field
    pub address: String,
    pub public_key: String,
    pub role: Role,
}

/// `# <name>` line directly followed by `[Peer]`; the name is capture 1,
/// untrimmed
pub(crate) fn block_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"# (.*?)\r?\n\[Peer\]").expect("valid regex"))
}

fn public_key_field() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"PublicKey\s*=\s*(.*)").expect("valid regex"))
}

fn allowed_ips_field() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"AllowedIPs\s*=\s*(.*)").expect("valid regex"))
}

fn ipv4_literal() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+\.\d+\.\d+\.\d+)").expect("valid regex"))
}

fn private_key_field() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*PrivateKey\s*=\s*(\S+)").expect("valid regex"))
}

/// Parse all named peer blocks, in document order.
///
/// `admin` decides the role of each record; everything outside it is
/// `Standard`.
pub fn parse_peers(content: &str, admin: &Subnet) -> Result<Vec<PeerRecord>, ConfigError> {
    let body = after_interface(content)?;
    let headers = block_header();

    let mut peers = Vec::new();
    let matches: Vec<_> = headers.captures_iter(body).collect();

    for (i, caps) in matches.iter().enumerate() {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let end = matches
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(body.len());
        let block = &body[whole.end()..end];
        let name = name.as_str().trim();

        let Some(public_key) = first_capture(public_key_field(), block) else {
            tracing::debug!("Skipping block {:?}: no PublicKey", name);
            continue;
        };
        let Some(allowed_ips) = first_capture(allowed_ips_field(), block) else {
            tracing::debug!("Skipping block {:?}: no AllowedIPs", name);
            continue;
        };
        let Some(address) = first_capture(ipv4_literal(), &allowed_ips) else {
            tracing::debug!("Skipping block {:?}: no IPv4 in AllowedIPs", name);
            continue;
        };

        let role = if admin.contains(&address) {
            Role::Admin
        } else {
            Role::Standard
        };

        tracing::debug!("Found peer {} ({}), role {:?}", name, address, role);

        peers.push(PeerRecord {
            name: name.to_string(),
            address,
            public_key,
            role,
        });
    }

    Ok(peers)
}

/// `PrivateKey` value of the `[Interface]` section, if present
pub fn interface_private_key(content: &str) -> Option<String> {
    let start = content.find(INTERFACE_MARKER)? + INTERFACE_MARKER.len();
    let section = &content[start..];
    // The interface section ends where the first peer section begins
    let section = match section.find("[Peer]") {
        Some(end) => &section[..end],
        None => section,
    };
    first_capture(private_key_field(), section)
}

/// Text following the first `[Interface]` marker, up to a second one if any
fn after_interface(content: &str) -> Result<&str, ConfigError> {
    let mut parts = content.split(INTERFACE_MARKER);
    parts.next();
    parts.next().ok_or(ConfigError::MissingField {
        field: "[Interface] section".to_string(),
    })
}

fn first_capture(re: &Regex, haystack: &str) -> Option<String> {
    re.captures(haystack)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}
