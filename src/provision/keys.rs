//! Peer key material
//!
//! Provisioning needs a private/public/preshared triple per peer. The
//! generator is a blocking capability so it can shell out to `wg`; it runs
//! on the blocking pool. Any failure is replaced by placeholder keys that
//! are impossible to mistake for real ones.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::config::KeygenBackend;
use crate::error::KeygenError;

/// Key length for X25519 (both private and public keys are 32 bytes)
pub const KEY_LEN: usize = 32;

/// Prefix of every placeholder key
pub const PLACEHOLDER_PREFIX: &str = "PLACEHOLDER-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTriple {
    pub private_key: String,
    pub public_key: String,
    pub preshared_key: String,
    /// Set when generation failed and the keys are stand-ins
    pub placeholder: bool,
}

impl KeyTriple {
    /// Stand-in keys. Each carries a random suffix so the public key stays
    /// unique within the config document.
    pub fn placeholder() -> Self {
        let mut tag = [0u8; 6];
        OsRng.fill_bytes(&mut tag);
        let tag = hex::encode(tag);
        Self {
            private_key: format!("{}PRIVATE-KEY-{}", PLACEHOLDER_PREFIX, tag),
            public_key: format!("{}PUBLIC-KEY-{}", PLACEHOLDER_PREFIX, tag),
            preshared_key: format!("{}PRESHARED-KEY-{}", PLACEHOLDER_PREFIX, tag),
            placeholder: true,
        }
    }
}

/// Source of peer key triples
pub trait KeyGenerator: Send + Sync {
    fn generate(&self) -> Result<KeyTriple, KeygenError>;
}

/// Uses the `wg` command line tool
#[derive(Debug, Clone)]
pub struct WgToolKeyGenerator {
    tool: PathBuf,
}

impl Default for WgToolKeyGenerator {
    fn default() -> Self {
        Self {
            tool: PathBuf::from("wg"),
        }
    }
}

impl WgToolKeyGenerator {
    pub fn new(tool: impl Into<PathBuf>) -> Self {
        Self { tool: tool.into() }
    }

    fn run(&self, subcommand: &str, input: Option<&str>) -> Result<String, KeygenError> {
        let tool = format!("{} {}", self.tool.display(), subcommand);

        let mut child = Command::new(&self.tool)
            .arg(subcommand)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| KeygenError::ToolUnavailable {
                tool: tool.clone(),
                reason: e.to_string(),
            })?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .map_err(|e| KeygenError::ToolUnavailable {
                    tool: tool.clone(),
                    reason: e.to_string(),
                })?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| KeygenError::ToolUnavailable {
                tool: tool.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(KeygenError::ToolFailed {
                tool,
                status: output.status.to_string(),
            });
        }

        let key = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if key.is_empty() {
            return Err(KeygenError::InvalidOutput { tool });
        }
        Ok(key)
    }
}

impl KeyGenerator for WgToolKeyGenerator {
    fn generate(&self) -> Result<KeyTriple, KeygenError> {
        let private_key = self.run("genkey", None)?;
        let public_key = self.run("pubkey", Some(&private_key))?;
        let preshared_key = self.run("genpsk", None)?;
        Ok(KeyTriple {
            private_key,
            public_key,
            preshared_key,
            placeholder: false,
        })
    }
}

/// Generates X25519 keys in-process
#[derive(Debug, Clone, Copy, Default)]
pub struct X25519KeyGenerator;

impl KeyGenerator for X25519KeyGenerator {
    fn generate(&self) -> Result<KeyTriple, KeygenError> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        let mut psk = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut psk);

        Ok(KeyTriple {
            private_key: BASE64.encode(secret.to_bytes()),
            public_key: BASE64.encode(public.as_bytes()),
            preshared_key: BASE64.encode(psk),
            placeholder: false,
        })
    }
}

/// Build the generator for a configured backend
pub fn key_generator(backend: KeygenBackend) -> Arc<dyn KeyGenerator> {
    match backend {
        KeygenBackend::WgTool => Arc::new(WgToolKeyGenerator::default()),
        KeygenBackend::Native => Arc::new(X25519KeyGenerator),
    }
}

/// Generate keys on the blocking pool, falling back to placeholders
pub async fn generate_or_placeholder(generator: Arc<dyn KeyGenerator>) -> KeyTriple {
    match tokio::task::spawn_blocking(move || generator.generate()).await {
        Ok(Ok(keys)) => keys,
        Ok(Err(e)) => {
            tracing::warn!("Key generation failed ({}), using placeholder keys", e);
            KeyTriple::placeholder()
        }
        Err(e) => {
            tracing::warn!("Key generation task failed ({}), using placeholder keys", e);
            KeyTriple::placeholder()
        }
    }
}

/// Public key for a base64 X25519 private key
pub fn derive_public_key(private_key_b64: &str) -> Option<String> {
    let bytes: [u8; KEY_LEN] = BASE64.decode(private_key_b64.trim()).ok()?.try_into().ok()?;
    let secret = StaticSecret::from(bytes);
    Some(BASE64.encode(PublicKey::from(&secret).as_bytes()))
}
