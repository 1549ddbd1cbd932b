//! Deployment settings: file locations, role subnets and probe timing

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Peer role, derived from which reserved subnet the peer's address is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Standard,
}

impl Role {
    pub fn from_is_admin(is_admin: bool) -> Self {
        if is_admin {
            Self::Admin
        } else {
            Self::Standard
        }
    }

    pub fn is_admin(self) -> bool {
        self == Self::Admin
    }

    /// Name of the credential sub-directory for this role
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Standard => "standard",
        }
    }
}

/// A reserved /24 address range. Membership is a plain prefix match on the
/// dotted-quad text, so free-form addresses from the config still classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    net: Ipv4Net,
}

impl Subnet {
    pub fn new(net: Ipv4Net) -> Result<Self, ConfigError> {
        if net.prefix_len() != 24 {
            return Err(ConfigError::InvalidSubnet {
                value: net.to_string(),
            });
        }
        Ok(Self { net: net.trunc() })
    }

    /// Dotted prefix including the trailing dot, e.g. `10.10.10.`
    pub fn prefix(&self) -> String {
        let [a, b, c, _] = self.net.network().octets();
        format!("{}.{}.{}.", a, b, c)
    }

    pub fn contains(&self, address: &str) -> bool {
        address.starts_with(&self.prefix())
    }

    pub fn host(&self, octet: u8) -> Ipv4Addr {
        let [a, b, c, _] = self.net.network().octets();
        Ipv4Addr::new(a, b, c, octet)
    }
}

impl FromStr for Subnet {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let net: Ipv4Net = s.trim().parse().map_err(|_| ConfigError::InvalidSubnet {
            value: s.to_string(),
        })?;
        Self::new(net)
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.net)
    }
}

/// Key generation backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum KeygenBackend {
    /// Shell out to `wg genkey` / `wg pubkey` / `wg genpsk`
    WgTool,
    /// Generate X25519 keys in-process
    Native,
}

/// Runtime settings for the roster
#[derive(Debug, Clone)]
pub struct Settings {
    /// Server WireGuard config document (e.g. /etc/wireguard/wg0.conf)
    pub config_path: PathBuf,
    /// Root of the per-peer credential directories
    pub clients_dir: PathBuf,
    /// Liveness store file
    pub status_path: PathBuf,
    pub admin_subnet: Subnet,
    pub standard_subnet: Subnet,
    /// Server public key for client documents. Derived from the
    /// `[Interface]` private key when unset.
    pub server_public_key: Option<String>,
    /// `host:port` written into client documents
    pub endpoint: Option<String>,
    pub dns: Option<String>,
    /// AllowedIPs written into client documents. Both role subnets when empty.
    pub client_allowed_ips: Vec<String>,
    pub keepalive_secs: u16,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub keygen: KeygenBackend,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/etc/wireguard/wg0.conf"),
            clients_dir: PathBuf::from("/etc/wireguard/clients"),
            status_path: PathBuf::from("/var/lib/wg-roster/clients-status.json"),
            admin_subnet: Subnet {
                net: Ipv4Net::new(Ipv4Addr::new(10, 10, 10, 0), 24).unwrap_or_default(),
            },
            standard_subnet: Subnet {
                net: Ipv4Net::new(Ipv4Addr::new(10, 10, 11, 0), 24).unwrap_or_default(),
            },
            server_public_key: None,
            endpoint: None,
            dns: None,
            client_allowed_ips: Vec::new(),
            keepalive_secs: 25,
            probe_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(1),
            keygen: KeygenBackend::WgTool,
        }
    }
}

impl Settings {
    /// Settings rooted in a scratch directory (used by tests and dry runs)
    pub fn rooted_at(dir: &std::path::Path) -> Self {
        Self {
            config_path: dir.join("wg0.conf"),
            clients_dir: dir.join("clients"),
            status_path: dir.join("clients-status.json"),
            ..Self::default()
        }
    }

    pub fn subnet(&self, role: Role) -> &Subnet {
        match role {
            Role::Admin => &self.admin_subnet,
            Role::Standard => &self.standard_subnet,
        }
    }

    /// Credential directory for a peer
    pub fn peer_dir(&self, name: &str, role: Role) -> PathBuf {
        self.clients_dir.join(role.dir_name()).join(name)
    }

    /// AllowedIPs line for client documents
    pub fn client_allowed_ips(&self) -> String {
        if self.client_allowed_ips.is_empty() {
            format!("{}, {}", self.admin_subnet, self.standard_subnet)
        } else {
            self.client_allowed_ips.join(", ")
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admin_subnet == self.standard_subnet {
            return Err(ConfigError::InvalidSubnet {
                value: format!(
                    "admin and standard subnets are both {}",
                    self.admin_subnet
                ),
            });
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::MissingField {
                field: "probe timeout must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_prefix() {
        let subnet: Subnet = "10.10.10.0/24".parse().unwrap();
        assert_eq!(subnet.prefix(), "10.10.10.");
        assert!(subnet.contains("10.10.10.5"));
        assert!(!subnet.contains("10.10.11.5"));
        assert_eq!(subnet.host(7), Ipv4Addr::new(10, 10, 10, 7));
    }

    #[test]
    fn test_subnet_truncates_host_bits() {
        let subnet: Subnet = "10.10.11.1/24".parse().unwrap();
        assert_eq!(subnet.to_string(), "10.10.11.0/24");
    }

    #[test]
    fn test_subnet_rejects_other_prefix_lengths() {
        assert!("10.10.0.0/16".parse::<Subnet>().is_err());
        assert!("not-a-subnet".parse::<Subnet>().is_err());
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.admin_subnet.prefix(), "10.10.10.");
        assert_eq!(settings.standard_subnet.prefix(), "10.10.11.");
        assert_eq!(settings.keepalive_secs, 25);
        assert_eq!(settings.client_allowed_ips(), "10.10.10.0/24, 10.10.11.0/24");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_same_subnets() {
        let mut settings = Settings::default();
        settings.standard_subnet = settings.admin_subnet;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_peer_dir() {
        let settings = Settings::rooted_at(std::path::Path::new("/tmp/x"));
        assert_eq!(
            settings.peer_dir("laptop", Role::Admin),
            PathBuf::from("/tmp/x/clients/admin/laptop")
        );
    }
}
