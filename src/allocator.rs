//! Host address allocation inside a role subnet
//!
//! An octet is in use when any `AllowedIPs` entry in the document equals
//! `<prefix><octet>/32`. Allocation returns the lowest free octet from 2
//! upwards, so addresses of deleted peers are reused.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::OnceLock;

use rand::Rng;
use regex::Regex;

use crate::config::Subnet;
use crate::error::{Result, RosterError};

/// .0 is the network, .1 the server
pub const FIRST_HOST: u8 = 2;
pub const LAST_HOST: u8 = 254;

fn allowed_ips_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"AllowedIPs[ \t]*=[ \t]*([^\r\n]*)").expect("valid regex"))
}

/// Sorted, de-duplicated host octets allocated in `subnet`
pub fn used_octets(content: &str, subnet: &Subnet) -> Vec<u8> {
    let prefix = subnet.prefix();
    let mut used: Vec<u8> = allowed_ips_line()
        .captures_iter(content)
        .filter_map(|caps| caps.get(1))
        .flat_map(|m| m.as_str().split(','))
        .filter_map(|entry| {
            entry
                .trim()
                .strip_prefix(prefix.as_str())?
                .strip_suffix("/32")?
                .parse::<u8>()
                .ok()
        })
        .collect();
    used.sort_unstable();
    used.dedup();
    used
}

/// Lowest free host address in `subnet` according to `content`
pub fn next_free_address(content: &str, subnet: &Subnet) -> Result<Ipv4Addr> {
    let used = used_octets(content, subnet);

    (FIRST_HOST..=LAST_HOST)
        .find(|octet| used.binary_search(octet).is_err())
        .map(|octet| subnet.host(octet))
        .ok_or_else(|| RosterError::SubnetExhausted {
            subnet: subnet.to_string(),
        })
}

/// Allocate from the document at `path`.
///
/// A document that cannot be read does not block allocation: a random
/// host in [2, 254] is returned instead. Provisioning reads the document
/// again right after this and fails on the same error, so the fallback only
/// matters when the allocator is used on its own.
pub async fn allocate(path: &Path, subnet: &Subnet) -> Result<Ipv4Addr> {
    match crate::config::read_document(path).await {
        Ok(content) => next_free_address(&content, subnet),
        Err(e) => {
            let octet = random_octet();
            tracing::warn!(
                "Could not read {:?} for allocation ({}), using random host {}",
                path,
                e,
                octet
            );
            Ok(subnet.host(octet))
        }
    }
}

fn random_octet() -> u8 {
    rand::thread_rng().gen_range(FIRST_HOST..=LAST_HOST)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin() -> Subnet {
        "10.10.10.0/24".parse().unwrap()
    }

    fn doc(octets: &[u8]) -> String {
        let mut content = String::from("[Interface]\nAddress = 10.10.10.1/24\n");
        for octet in octets {
            content.push_str(&format!(
                "\n# p{0}\n[Peer]\nPublicKey = k{0}\nAllowedIPs = 10.10.10.{0}/32\n",
                octet
            ));
        }
        content
    }

    #[test]
    fn test_empty_subnet_starts_at_two() {
        let addr = next_free_address(&doc(&[]), &admin()).unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 10, 10, 2));
    }

    #[test]
    fn test_next_after_contiguous() {
        let addr = next_free_address(&doc(&[2, 3]), &admin()).unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 10, 10, 4));
    }

    #[test]
    fn test_fills_gap() {
        let addr = next_free_address(&doc(&[2, 4]), &admin()).unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 10, 10, 3));
    }

    #[test]
    fn test_ignores_other_subnet_and_masks() {
        let content = "[Interface]\nAddress = 10.10.10.1/24\n\
                       # s\n[Peer]\nPublicKey = a\nAllowedIPs = 10.10.11.2/32\n\
                       # r\n[Peer]\nPublicKey = b\nAllowedIPs = 10.10.10.2/24\n";
        let addr = next_free_address(content, &admin()).unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 10, 10, 2));
    }

    #[test]
    fn test_counts_every_entry_of_a_field() {
        let content = "[Interface]\n# m\n[Peer]\nPublicKey = a\nAllowedIPs = 10.10.10.2/32, 10.10.10.3/32\n";
        assert_eq!(used_octets(content, &admin()), vec![2, 3]);
        let addr = next_free_address(content, &admin()).unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 10, 10, 4));
    }

    #[test]
    fn test_exhausted_subnet() {
        let all: Vec<u8> = (FIRST_HOST..=LAST_HOST).collect();
        let result = next_free_address(&doc(&all), &admin());
        assert!(matches!(result, Err(RosterError::SubnetExhausted { .. })));
    }

    #[tokio::test]
    async fn test_allocate_reads_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg0.conf");
        std::fs::write(&path, doc(&[2])).unwrap();

        let addr = allocate(&path, &admin()).await.unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 10, 10, 3));
    }

    #[tokio::test]
    async fn test_allocate_unreadable_falls_back_to_random() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.conf");

        let addr = allocate(&path, &admin()).await.unwrap();
        let [a, b, c, d] = addr.octets();
        assert_eq!((a, b, c), (10, 10, 10));
        assert!((FIRST_HOST..=LAST_HOST).contains(&d));
    }
}
