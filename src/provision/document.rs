//! Text edits on the server config document and rendering of client documents
//!
//! Peer blocks are appended and removed as text so everything else in the
//! document (interface settings, comments, formatting) is left untouched.

use std::net::Ipv4Addr;
use std::ops::Range;
use std::sync::OnceLock;

use regex::Regex;

use super::keys::KeyTriple;
use crate::config::block_header;

const INTERFACE_MARKER: &str = "[Interface]";

fn comment_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^#").expect("valid regex"))
}

/// A peer block as appended to the server document
pub fn render_peer_block(name: &str, keys: &KeyTriple, address: Ipv4Addr) -> String {
    format!(
        "# {}\n[Peer]\nPublicKey = {}\nPresharedKey = {}\nAllowedIPs = {}/32\n",
        name, keys.public_key, keys.preshared_key, address
    )
}

/// Append `block` after a blank separator line
pub fn append_block(content: &str, block: &str) -> String {
    let mut out = String::with_capacity(content.len() + block.len() + 2);
    out.push_str(content);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push('\n');
    out.push_str(block);
    out
}

/// Byte range of the block named `name`: from its comment line up to the
/// next comment line or the end of the document.
///
/// Headers are recognised exactly as the parser recognises them, so every
/// listed peer can be found here.
pub fn find_block(content: &str, name: &str) -> Option<Range<usize>> {
    let offset = content
        .find(INTERFACE_MARKER)
        .map(|i| i + INTERFACE_MARKER.len())
        .unwrap_or(0);

    let found = block_header()
        .captures_iter(&content[offset..])
        .find(|caps| caps.get(1).is_some_and(|m| m.as_str().trim() == name))?
        .get(0)?;
    let header_start = offset + found.start();
    let header_end = offset + found.end();

    // The whole comment line belongs to the block
    let start = content[..header_start]
        .rfind('\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    let end = comment_line()
        .find(&content[header_end..])
        .map(|next| header_end + next.start())
        .unwrap_or(content.len());

    Some(start..end)
}

/// Remove the block named `name`. Returns `None` when no such block exists.
///
/// When the block is the last one, the blank line separating it from the
/// previous content goes with it, so removal undoes `append_block`.
pub fn remove_block(content: &str, name: &str) -> Option<String> {
    let range = find_block(content, name)?;
    let mut start = range.start;
    if range.end == content.len() && content[..start].ends_with("\n\n") {
        start -= 1;
    }

    let mut out = String::with_capacity(content.len() - (range.end - start));
    out.push_str(&content[..start]);
    out.push_str(&content[range.end..]);
    Some(out)
}

/// Inputs for a client-side config document
#[derive(Debug, Clone)]
pub struct ClientDocument<'a> {
    pub keys: &'a KeyTriple,
    pub address: Ipv4Addr,
    pub dns: Option<&'a str>,
    pub server_public_key: &'a str,
    pub endpoint: Option<&'a str>,
    pub allowed_ips: &'a str,
    pub keepalive_secs: u16,
}

impl ClientDocument<'_> {
    pub fn render(&self) -> String {
        let mut doc = String::new();
        if self.keys.placeholder {
            doc.push_str("# WARNING: placeholder keys, this peer cannot connect.\n");
            doc.push_str("# Regenerate its keys and update the server config.\n");
        }

        doc.push_str("[Interface]\n");
        doc.push_str(&format!("PrivateKey = {}\n", self.keys.private_key));
        doc.push_str(&format!("Address = {}/32\n", self.address));
        if let Some(dns) = self.dns {
            doc.push_str(&format!("DNS = {}\n", dns));
        }
        doc.push('\n');

        doc.push_str("[Peer]\n");
        doc.push_str(&format!("PublicKey = {}\n", self.server_public_key));
        doc.push_str(&format!("PresharedKey = {}\n", self.keys.preshared_key));
        if let Some(endpoint) = self.endpoint {
            doc.push_str(&format!("Endpoint = {}\n", endpoint));
        }
        doc.push_str(&format!("AllowedIPs = {}\n", self.allowed_ips));
        doc.push_str(&format!("PersistentKeepalive = {}\n", self.keepalive_secs));
        doc
    }
}
