//! wg-roster CLI - WireGuard peer roster daemon
//!
//! Serves the roster REST API over the server's WireGuard config document
//! and keeps peer liveness up to date in the background.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

use wg_roster::error::ConfigError;
use wg_roster::{key_generator, DaemonService, KeygenBackend, PeerRegistry, PingProbe, RosterError, Settings, Subnet};

/// wg-roster - WireGuard peer roster daemon
#[derive(Parser, Debug)]
#[command(name = "wg-roster")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the server WireGuard config document
    #[arg(short, long, env = "WIREGUARD_CONFIG_PATH", default_value = "/etc/wireguard/wg0.conf")]
    config: PathBuf,

    /// Root directory for per-peer credential directories
    #[arg(long, env = "WIREGUARD_CLIENTS_DIR", default_value = "/etc/wireguard/clients")]
    clients_dir: PathBuf,

    /// Liveness store file
    #[arg(long, env = "STATUS_FILE", default_value = "/var/lib/wg-roster/clients-status.json")]
    status_file: PathBuf,

    /// Address to bind the REST API to
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// HTTP port for the REST API
    #[arg(short, long, env = "PORT", default_value_t = wg_roster::daemon::DEFAULT_HTTP_PORT)]
    port: u16,

    /// Subnet reserved for admin peers
    #[arg(long, default_value = "10.10.10.0/24")]
    admin_subnet: Subnet,

    /// Subnet reserved for standard peers
    #[arg(long, default_value = "10.10.11.0/24")]
    standard_subnet: Subnet,

    /// Server endpoint (host:port) written into client configs
    #[arg(long, env = "WIREGUARD_ENDPOINT")]
    endpoint: Option<String>,

    /// DNS server written into client configs
    #[arg(long, env = "WIREGUARD_DNS")]
    dns: Option<String>,

    /// Server public key; derived from the config's PrivateKey when omitted
    #[arg(long, env = "WIREGUARD_SERVER_PUBLIC_KEY")]
    server_public_key: Option<String>,

    /// AllowedIPs for client configs (repeatable; defaults to both subnets)
    #[arg(long = "client-allowed-ips")]
    client_allowed_ips: Vec<String>,

    /// Seconds between background probe cycles
    #[arg(long, default_value_t = 60)]
    probe_interval: u64,

    /// Per-peer probe timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    probe_timeout_ms: u64,

    /// Key generation backend
    #[arg(long, value_enum, default_value_t = KeygenBackend::WgTool)]
    keygen: KeygenBackend,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn settings(&self) -> Settings {
        Settings {
            config_path: self.config.clone(),
            clients_dir: self.clients_dir.clone(),
            status_path: self.status_file.clone(),
            admin_subnet: self.admin_subnet,
            standard_subnet: self.standard_subnet,
            server_public_key: self.server_public_key.clone(),
            endpoint: self.endpoint.clone(),
            dns: self.dns.clone(),
            client_allowed_ips: self.client_allowed_ips.clone(),
            probe_interval: Duration::from_secs(self.probe_interval.max(1)),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            keygen: self.keygen,
            ..Settings::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", user_message(&e));
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> Result<(), RosterError> {
    tracing::info!("wg-roster starting...");
    tracing::info!("Config document: {:?}", args.config);

    let settings = args.settings();
    let probe = Arc::new(PingProbe::new(settings.probe_timeout));
    let keygen = key_generator(settings.keygen);
    let registry = PeerRegistry::open(settings, keygen, probe).await?;

    let daemon = DaemonService::new(registry, SocketAddr::new(args.bind, args.port));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    daemon.run(shutdown_rx).await
}

/// Resolve on Ctrl+C or SIGTERM
async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}

/// Get user-friendly error message
fn user_message(error: &RosterError) -> String {
    match error {
        RosterError::Config(ConfigError::FileNotFound { path }) => {
            format!("Configuration file not found: {}\n  \
                    Check --config or WIREGUARD_CONFIG_PATH.", path)
        }

        RosterError::Config(ConfigError::InvalidSubnet { value }) => {
            format!("Invalid subnet: {}\n  \
                    Admin and standard subnets must be distinct IPv4 /24 networks.", value)
        }

        RosterError::System(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            format!("{}\n  \
                    Another process is using the port. Pick one with --port.", e)
        }

        RosterError::System(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            format!("{}\n  \
                    Run as a user that can read the WireGuard config and bind the port.", e)
        }

        _ => format!("{}", error),
    }
}
