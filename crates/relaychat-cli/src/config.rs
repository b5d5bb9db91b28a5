//! Configuration for the relaychat binaries.

use anyhow::Context;
use relaychat_core::PeerId;
use relaychat_relay::{AdmissionPolicy, DEFAULT_RELAY_PORT, RelayLimits};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// relaychat configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Chat configuration
    #[serde(default)]
    pub chat: ChatConfig,
    /// Peer configuration
    #[serde(default)]
    pub peer: PeerConfig,
    /// Relay node configuration
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Chat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Highlight incoming lines
    #[serde(default = "default_true")]
    pub color: bool,
}

/// Peer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// TCP port relays listen on
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,
}

/// Relay node configuration
///
/// Every limit is optional here; command-line flags fill the gaps and the
/// relay refuses to start while any limit is still unset.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    /// Listen addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listen: Vec<String>,
    /// Maximum concurrent reservations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reservations: Option<usize>,
    /// Maximum concurrent circuits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_circuits: Option<usize>,
    /// Reservation lifetime in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_duration_secs: Option<u64>,
    /// Bytes forwarded per reservation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_data_per_reservation: Option<u64>,
    /// Admit every peer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_all: Option<bool>,
    /// Peers admitted when `allow_all` is off (hex peer IDs)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    /// Identity key file; a fresh identity is used per run when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

// Default values

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_relay_port() -> u16 {
    DEFAULT_RELAY_PORT
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self { color: true }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            relay_port: default_relay_port(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("relaychat/config.toml")
    }

    /// Load `path` if given, otherwise the default path if it exists,
    /// otherwise built-in defaults
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit `path` is missing, or if the chosen
    /// file cannot be read or parsed.
    pub fn resolve(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.peer.relay_port == 0 {
            anyhow::bail!("Relay port must be non-zero");
        }

        if self.relay.reservation_duration_secs == Some(0) {
            anyhow::bail!("Reservation duration must be at least one second");
        }

        if self.relay.allow_all == Some(true) && !self.relay.allow.is_empty() {
            anyhow::bail!("Relay allow list given together with allow_all");
        }

        for peer in &self.relay.allow {
            peer.parse::<PeerId>()
                .map_err(|e| anyhow::anyhow!("Relay allow list entry '{peer}': {e}"))?;
        }

        for addr in &self.relay.listen {
            addr.parse::<relaychat_core::Multiaddr>()
                .map_err(|e| anyhow::anyhow!("Relay listen address '{addr}': {e}"))?;
        }

        Ok(())
    }
}

/// Relay limits given on the command line; each one overrides the file
#[derive(Debug, Clone, Default)]
pub struct LimitOverrides {
    /// Maximum concurrent reservations
    pub max_reservations: Option<usize>,
    /// Maximum concurrent circuits
    pub max_circuits: Option<usize>,
    /// Reservation lifetime in seconds
    pub reservation_duration_secs: Option<u64>,
    /// Bytes forwarded per reservation
    pub max_data_per_reservation: Option<u64>,
    /// Admit every peer
    pub allow_all: bool,
    /// Admitted peers; replaces the file's list when non-empty
    pub allow: Vec<String>,
}

impl RelayConfig {
    /// Merge `overrides` over this section into complete relay limits
    ///
    /// # Errors
    ///
    /// Returns an error naming the first limit that is still unset, or if
    /// an allow list entry is not a peer ID.
    pub fn to_limits(&self, overrides: &LimitOverrides) -> anyhow::Result<RelayLimits> {
        let max_reservations = overrides
            .max_reservations
            .or(self.max_reservations)
            .context("relay limit missing: max reservations (--reservations)")?;
        let max_circuits = overrides
            .max_circuits
            .or(self.max_circuits)
            .context("relay limit missing: max circuits (--circuits)")?;
        let duration = overrides
            .reservation_duration_secs
            .or(self.reservation_duration_secs)
            .context("relay limit missing: reservation duration (--duration)")?;
        let max_data = overrides
            .max_data_per_reservation
            .or(self.max_data_per_reservation)
            .context("relay limit missing: data per reservation (--data)")?;

        // A list on the command line replaces both the file's list and its allow_all
        let (allow_all, allow) = if overrides.allow.is_empty() {
            (overrides.allow_all || self.allow_all == Some(true), &self.allow)
        } else {
            (overrides.allow_all, &overrides.allow)
        };
        let admission = if allow_all {
            AdmissionPolicy::AllowAll
        } else if !allow.is_empty() {
            let peers = allow
                .iter()
                .map(|p| {
                    p.parse::<PeerId>()
                        .map_err(|e| anyhow::anyhow!("allow list entry '{p}': {e}"))
                })
                .collect::<anyhow::Result<_>>()?;
            AdmissionPolicy::AllowList(peers)
        } else {
            anyhow::bail!("relay admission missing: --allow-all or --allow <peer id>");
        };

        Ok(RelayLimits {
            max_reservations,
            max_circuits,
            reservation_duration: Duration::from_secs(duration),
            max_data_per_reservation: max_data,
            admission,
        })
    }
}
