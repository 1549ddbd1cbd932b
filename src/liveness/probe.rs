//! Reachability probes
//!
//! A probe answers one question: did the address respond within the
//! timeout. It is a coarse network-level check, not a WireGuard handshake.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

/// Extra time given to `ping` beyond its own `-W` deadline
const PING_SLACK: Duration = Duration::from_millis(500);

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// `true` if `address` answered in time. Failures are `false`, never errors.
    async fn is_reachable(&self, address: &str) -> bool;
}

/// Single ICMP echo via the system `ping`
#[derive(Debug, Clone)]
pub struct PingProbe {
    timeout: Duration,
}

impl PingProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// `ping -W` takes whole seconds
    fn wait_secs(&self) -> u64 {
        self.timeout.as_secs_f64().ceil().max(1.0) as u64
    }
}

#[async_trait]
impl ReachabilityProbe for PingProbe {
    async fn is_reachable(&self, address: &str) -> bool {
        let mut cmd = Command::new("ping");
        cmd.args(["-c", "1", "-W"])
            .arg(self.wait_secs().to_string())
            .arg(address)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let deadline = Duration::from_secs(self.wait_secs()) + PING_SLACK;
        match tokio::time::timeout(deadline, cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                tracing::warn!("Failed to run ping for {}: {}", address, e);
                false
            }
            Err(_) => {
                tracing::debug!("Ping to {} timed out after {:?}", address, deadline);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_secs_rounds_up() {
        assert_eq!(PingProbe::new(Duration::from_millis(200)).wait_secs(), 1);
        assert_eq!(PingProbe::new(Duration::from_secs(1)).wait_secs(), 1);
        assert_eq!(PingProbe::new(Duration::from_millis(2500)).wait_secs(), 3);
    }
}
