//! Command-line configuration for `tss-node`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use common::{PartyId, PeerEndpoint, TssConfig};

/// TSS node CLI arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "tss-node")]
#[command(author, version, about = "Threshold ECDSA session node")]
pub struct Args {
    /// Port for the keygen/keysign HTTP API.
    #[arg(long, env = "TSS_PORT", default_value = "8080")]
    pub tss_port: u16,

    /// Port for ping, metrics and session inspection.
    #[arg(long, env = "INFO_PORT", default_value = "8081")]
    pub info_port: u16,

    /// Port for peer-to-peer traffic.
    #[arg(long, env = "P2P_PORT", default_value = "5040")]
    pub p2p_port: u16,

    /// Host other nodes use to reach our P2P port.
    #[arg(long, env = "ADVERTISE_HOST", default_value = "127.0.0.1")]
    pub advertise_host: String,

    /// Base64 node private key.
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    pub private_key: String,

    /// Directory for key shares and pre-params.
    #[arg(long, env = "TSS_HOME", default_value = "./tss-data")]
    pub home: PathBuf,

    /// Pre-params file (defaults to <home>/pre-params.json).
    #[arg(long, env = "PRE_PARAMS_FILE")]
    pub pre_params_file: Option<PathBuf>,

    /// Static peer as `<pubkey>@<host:port>`. Repeatable.
    #[arg(long = "peer", value_parser = parse_peer)]
    pub peers: Vec<(PartyId, PeerEndpoint)>,

    /// Keygen running-phase deadline in seconds.
    #[arg(long, env = "KEYGEN_TIMEOUT", default_value = "30")]
    pub keygen_timeout: u64,

    /// Keysign running-phase deadline in seconds.
    #[arg(long, env = "KEYSIGN_TIMEOUT", default_value = "30")]
    pub keysign_timeout: u64,

    /// Deadline for obtaining pre-params in seconds.
    #[arg(long, env = "PRE_PARAM_TIMEOUT", default_value = "5")]
    pub pre_param_timeout: u64,

    /// Deadline for every peer to become ready, in seconds.
    #[arg(long, env = "JOIN_TIMEOUT", default_value = "10")]
    pub join_timeout: u64,

    /// Readiness announcement interval in milliseconds.
    #[arg(long, env = "READY_INTERVAL_MS", default_value = "250")]
    pub ready_interval_ms: u64,

    /// Emit logs as JSON.
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,
}

impl Args {
    pub fn tss_config(&self) -> TssConfig {
        TssConfig {
            keygen_timeout: Duration::from_secs(self.keygen_timeout),
            keysign_timeout: Duration::from_secs(self.keysign_timeout),
            pre_param_timeout: Duration::from_secs(self.pre_param_timeout),
            join_timeout: Duration::from_secs(self.join_timeout),
            ready_interval: Duration::from_millis(self.ready_interval_ms),
            ..TssConfig::default()
        }
    }

    pub fn pre_params_path(&self) -> PathBuf {
        self.pre_params_file
            .clone()
            .unwrap_or_else(|| self.home.join("pre-params.json"))
    }

    pub fn advertised_endpoint(&self) -> PeerEndpoint {
        PeerEndpoint::new(format!("{}:{}", self.advertise_host, self.p2p_port))
    }
}

/// Parse `<pubkey>@<host:port>`.
pub fn parse_peer(s: &str) -> Result<(PartyId, PeerEndpoint), String> {
    let (party, endpoint) = s
        .split_once('@')
        .ok_or_else(|| format!("expected <pubkey>@<host:port>, got '{}'", s))?;
    if party.is_empty() || !party.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("peer public key must be hex, got '{}'", party));
    }
    if endpoint.rsplit_once(':').map_or(true, |(host, port)| {
        host.is_empty() || port.parse::<u16>().is_err()
    }) {
        return Err(format!("peer address must be host:port, got '{}'", endpoint));
    }
    Ok((PartyId::new(party), PeerEndpoint::new(endpoint)))
}
