//! Balancer configuration.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::pool::PoolConfig;

/// Where service updates are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateSource {
    Stdin,
    File(PathBuf),
}

/// Balancer configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// IP forwarders listen on; DNAT rules point here.
    pub bridge_ip: IpAddr,

    /// Packet-filter binary.
    pub iptables: String,

    /// Name of the managed chain in both tables.
    pub chain: String,

    /// Newline-delimited JSON service updates.
    pub updates: UpdateSource,

    /// Instance dial timeout.
    pub connect_timeout: Duration,

    /// Instance pool tuning.
    pub pool: PoolConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bridge_ip: IpAddr = lookup("FERRY_BRIDGE_IP")
            .map(|v| v.parse())
            .transpose()
            .context("FERRY_BRIDGE_IP must be an IP address.")?
            .unwrap_or(IpAddr::from([127, 0, 0, 1]));

        let iptables = lookup("FERRY_IPTABLES").unwrap_or_else(|| "iptables".to_string());

        let chain = lookup("FERRY_CHAIN").unwrap_or_else(|| "FERRY".to_string());
        if chain.is_empty() || chain.len() > 28 || chain.contains(char::is_whitespace) {
            bail!("FERRY_CHAIN must be 1-28 characters without whitespace.");
        }

        let updates = match lookup("FERRY_UPDATES").as_deref() {
            None | Some("-") => UpdateSource::Stdin,
            Some(path) => UpdateSource::File(PathBuf::from(path)),
        };

        let connect_timeout_ms: u64 = lookup("FERRY_CONNECT_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("FERRY_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(2000);
        let connect_timeout = Duration::from_millis(connect_timeout_ms.max(50));

        let retry_base_ms: u64 = lookup("FERRY_RETRY_BASE_MS")
            .map(|v| v.parse())
            .transpose()
            .context("FERRY_RETRY_BASE_MS must be an integer (milliseconds).")?
            .unwrap_or(1000);

        let max_failures: u32 = lookup("FERRY_MAX_FAILURES")
            .map(|v| v.parse())
            .transpose()
            .context("FERRY_MAX_FAILURES must be an integer.")?
            .unwrap_or(8)
            .max(1);

        let pool = PoolConfig {
            base_interval: Duration::from_millis(retry_base_ms.max(10)),
            max_failures,
            ..PoolConfig::default()
        };

        let log_level = lookup("FERRY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            bridge_ip,
            iptables,
            chain,
            updates,
            connect_timeout,
            pool,
            log_level,
        })
    }
}
