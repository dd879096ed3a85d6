//! Configuration for Keyhole
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::AuthConfig;
use crate::hsm::RelayConfig;
use crate::scheduler::{ProcessLauncherConfig, SchedulerConfig};

/// Keyhole - scheduler and signer relay for keyless hosted Lightning nodes
#[derive(Parser, Debug, Clone)]
#[command(name = "keyhole")]
#[command(about = "Scheduler and signer relay for keyless hosted Lightning nodes")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// URL node processes use to reach this gateway. Defaults to the
    /// listen address.
    #[arg(long, env = "PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable development mode (ephemeral CA key allowed)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Directory holding the registration snapshot
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// File with the hex ed25519 seed of the device-certificate issuer.
    /// Required outside dev mode.
    #[arg(long, env = "CA_KEY_FILE")]
    pub ca_key_file: Option<PathBuf>,

    /// Lifetime of an issued challenge
    #[arg(long, env = "CHALLENGE_TTL_SECS", default_value = "300")]
    pub challenge_ttl_secs: u64,

    /// Upper bound on a node-info long poll
    #[arg(long, env = "NODE_INFO_MAX_WAIT_SECS", default_value = "60")]
    pub node_info_max_wait_secs: u64,

    /// Upper bound on starting a node process
    #[arg(long, env = "SPAWN_TIMEOUT_SECS", default_value = "30")]
    pub spawn_timeout_secs: u64,

    /// Deadline for the signer to answer an HSM request
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "60000")]
    pub request_timeout_ms: u64,

    /// Interval of the pending-request deadline sweep
    #[arg(long, env = "SWEEP_INTERVAL_MS", default_value = "1000")]
    pub sweep_interval_ms: u64,

    /// Node binary started per identity
    #[arg(long, env = "NODE_BINARY", default_value = "lightningd")]
    pub node_binary: PathBuf,

    /// Comma-separated extra arguments for the node binary
    #[arg(long, env = "NODE_ARGS")]
    pub node_args: Option<String>,

    /// Host node processes bind to
    #[arg(long, env = "NODE_HOST", default_value = "127.0.0.1")]
    pub node_host: String,

    /// Minimum node port
    #[arg(long, env = "NODE_PORT_MIN", default_value = "19000")]
    pub node_port_min: u16,

    /// Maximum node port
    #[arg(long, env = "NODE_PORT_MAX", default_value = "19999")]
    pub node_port_max: u16,
}

impl Args {
    /// Get the list of extra node arguments
    pub fn node_arg_list(&self) -> Vec<String> {
        self.node_args
            .as_deref()
            .map(|args| {
                args.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            challenge_ttl: Duration::from_secs(self.challenge_ttl_secs),
            ..AuthConfig::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            spawn_timeout: Duration::from_secs(self.spawn_timeout_secs),
            max_wait: Duration::from_secs(self.node_info_max_wait_secs),
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
        }
    }

    /// Base URL handed to node processes
    pub fn gateway_url(&self) -> String {
        if let Some(ref url) = self.public_url {
            return url.trim_end_matches('/').to_string();
        }
        let mut addr = self.listen;
        if addr.ip().is_unspecified() {
            addr.set_ip([127, 0, 0, 1].into());
        }
        format!("http://{}", addr)
    }

    pub fn launcher_config(&self) -> ProcessLauncherConfig {
        ProcessLauncherConfig {
            binary: self.node_binary.clone(),
            args: self.node_arg_list(),
            host: self.node_host.clone(),
            gateway_url: self.gateway_url(),
            port_min: self.node_port_min,
            port_max: self.node_port_max,
            ..ProcessLauncherConfig::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode && self.ca_key_file.is_none() {
            return Err("CA_KEY_FILE is required in production mode".to_string());
        }

        if self.node_port_min > self.node_port_max {
            return Err("NODE_PORT_MIN must be less than or equal to NODE_PORT_MAX".to_string());
        }

        let timeouts = [
            ("CHALLENGE_TTL_SECS", self.challenge_ttl_secs),
            ("NODE_INFO_MAX_WAIT_SECS", self.node_info_max_wait_secs),
            ("SPAWN_TIMEOUT_SECS", self.spawn_timeout_secs),
            ("REQUEST_TIMEOUT_MS", self.request_timeout_ms),
            ("SWEEP_INTERVAL_MS", self.sweep_interval_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(format!("{} must be greater than zero", name));
            }
        }

        Ok(())
    }
}
