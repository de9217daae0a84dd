//! Node configuration loaded from environment variables.
//!
//! Every setting has a default so a node starts with no configuration for
//! local development.

use std::str::FromStr;

use portal_shared::constants::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Portal this node joins.
    /// Env: `PORTAL_ID`
    /// Default: `default`
    pub portal_id: String,

    /// Wallet address identifying the local user. The node refuses to start
    /// without one.
    /// Env: `PORTAL_WALLET`
    /// Default: none
    pub wallet_address: Option<String>,

    /// Chunk size for outgoing transfers that do not pick their own,
    /// clamped to the supported range.
    /// Env: `PORTAL_CHUNK_SIZE`
    /// Default: 64 KiB
    pub chunk_size: usize,

    /// Env: `PORTAL_SESSION_MAX_AGE_HOURS`
    /// Default: `24`
    pub session_max_age_hours: u64,

    /// Env: `PORTAL_CONNECTION_IDLE_SECS`
    /// Default: `300`
    pub connection_idle_secs: u64,

    /// Env: `PORTAL_PRESENCE_STALE_SECS`
    /// Default: `120`
    pub presence_stale_secs: u64,

    /// How long completed, failed or cancelled transfers stay queryable.
    /// Env: `PORTAL_TRANSFER_RETENTION_SECS`
    /// Default: `3600`
    pub transfer_retention_secs: u64,

    /// How often the sweeper runs.
    /// Env: `PORTAL_SWEEP_INTERVAL_SECS`
    /// Default: `60`
    pub sweep_interval_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            portal_id: "default".to_string(),
            wallet_address: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            session_max_age_hours: 24,
            connection_idle_secs: 300,
            presence_stale_secs: 120,
            transfer_retention_secs: 3600,
            sweep_interval_secs: 60,
        }
    }
}

impl NodeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Invalid values are logged and
    /// replaced by the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(id) = lookup("PORTAL_ID").filter(|s| !s.trim().is_empty()) {
            config.portal_id = id;
        }
        config.wallet_address = lookup("PORTAL_WALLET").filter(|s| !s.trim().is_empty());

        if let Some(size) = parsed::<usize>(&lookup, "PORTAL_CHUNK_SIZE") {
            let clamped = size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
            if clamped != size {
                tracing::warn!(value = size, clamped, "PORTAL_CHUNK_SIZE out of range");
            }
            config.chunk_size = clamped;
        }

        if let Some(v) = parsed(&lookup, "PORTAL_SESSION_MAX_AGE_HOURS") {
            config.session_max_age_hours = v;
        }
        if let Some(v) = parsed(&lookup, "PORTAL_CONNECTION_IDLE_SECS") {
            config.connection_idle_secs = v;
        }
        if let Some(v) = parsed(&lookup, "PORTAL_PRESENCE_STALE_SECS") {
            config.presence_stale_secs = v;
        }
        if let Some(v) = parsed(&lookup, "PORTAL_TRANSFER_RETENTION_SECS") {
            config.transfer_retention_secs = v;
        }
        match parsed::<u64>(&lookup, "PORTAL_SWEEP_INTERVAL_SECS") {
            Some(0) => tracing::warn!("PORTAL_SWEEP_INTERVAL_SECS must be positive, using default"),
            Some(v) => config.sweep_interval_secs = v,
            None => {}
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
