//! Configuration module
//!
//! Handles loading and saving peerweave configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::{self, CryptoError, PeerKeys};
use crate::network::{NetworkConfig, PeerInfo};
use crate::protocol::DEFAULT_PORT;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0:?}")]
    NotFound(PathBuf),

    #[error("Key error in {0:?}: {1}")]
    Key(PathBuf, CryptoError),

    #[error("Public key {0:?} does not match the private key")]
    KeyMismatch(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Socket and timer settings
    #[serde(default)]
    pub network: TransportConfig,

    /// Key files
    #[serde(default)]
    pub keys: KeysConfig,

    /// Statically known peers
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Peer identifier (random per run if not set)
    pub peer_id: Option<Uuid>,
    /// Human-readable name for this peer
    pub name: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// UDP port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to (default: all)
    pub bind_address: Option<IpAddr>,
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_ms: u64,
    #[serde(default = "default_inventory_interval")]
    pub inventory_interval_ms: u64,
    /// How long Get/Set/BeginTx/Commit wait for a reply
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// How long a seen message id is remembered
    #[serde(default = "default_dedup_ttl")]
    pub dedup_ttl_ms: u64,
    /// Minimum gap between history pulls for one object
    #[serde(default = "default_history_throttle")]
    pub history_throttle_ms: u64,
    #[serde(default = "default_kill_delay")]
    pub kill_delay_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_discovery_interval() -> u64 {
    10_000
}

fn default_inventory_interval() -> u64 {
    30_000
}

fn default_request_timeout() -> u64 {
    5000
}

fn default_dedup_ttl() -> u64 {
    60_000
}

fn default_history_throttle() -> u64 {
    2000
}

fn default_kill_delay() -> u64 {
    500
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: None,
            discovery_interval_ms: default_discovery_interval(),
            inventory_interval_ms: default_inventory_interval(),
            request_timeout_ms: default_request_timeout(),
            dedup_ttl_ms: default_dedup_ttl(),
            history_throttle_ms: default_history_throttle(),
            kill_delay_ms: default_kill_delay(),
        }
    }
}

/// Key configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysConfig {
    /// PKCS#8 PEM private key; without one inbound packets cannot be read
    pub private_key: Option<PathBuf>,
    /// PKCS#8 PEM public key handed to other peers
    pub public_key: Option<PathBuf>,
}

/// A statically configured peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: Uuid,
    pub address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// PEM public key used to encrypt traffic to this peer
    pub public_key: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("peerweave/config.toml")),
            Some(PathBuf::from("./peerweave.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Get the peer ID, generating one if not set
    pub fn peer_id(&self) -> Uuid {
        self.general.peer_id.unwrap_or_else(Uuid::new_v4)
    }

    /// Runtime node settings
    pub fn network_config(&self) -> NetworkConfig {
        let net = &self.network;
        NetworkConfig {
            port: net.port,
            bind_address: net
                .bind_address
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            // Periodic timers need a non-zero period
            discovery_interval: Duration::from_millis(net.discovery_interval_ms.max(1)),
            inventory_interval: Duration::from_millis(net.inventory_interval_ms.max(1)),
            request_timeout: Duration::from_millis(net.request_timeout_ms),
            dedup_ttl: Duration::from_millis(net.dedup_ttl_ms),
            history_throttle: Duration::from_millis(net.history_throttle_ms),
            kill_delay: Duration::from_millis(net.kill_delay_ms),
        }
    }

    /// Load the local keypair, if one is configured
    ///
    /// A configured public key must belong to the private key, since it is
    /// the file handed to other peers.
    pub fn load_keys(&self) -> ConfigResult<Option<PeerKeys>> {
        let Some(path) = &self.keys.private_key else {
            return Ok(None);
        };
        let keys = PeerKeys::load(path).map_err(|e| ConfigError::Key(path.clone(), e))?;

        if let Some(public_path) = &self.keys.public_key {
            let public_key = crypto::load_public_key(public_path)
                .map_err(|e| ConfigError::Key(public_path.clone(), e))?;
            if &public_key != keys.public_key() {
                return Err(ConfigError::KeyMismatch(public_path.clone()));
            }
        }

        Ok(Some(keys))
    }

    /// Build directory entries for the configured peers
    pub fn load_peers(&self) -> ConfigResult<Vec<PeerInfo>> {
        self.peers
            .iter()
            .map(|entry| {
                let public_key = match &entry.public_key {
                    Some(path) => Some(
                        crypto::load_public_key(path)
                            .map_err(|e| ConfigError::Key(path.clone(), e))?,
                    ),
                    None => None,
                };
                let addr = SocketAddr::new(entry.address, entry.port);
                Ok(PeerInfo::new(entry.id, addr, public_key))
            })
            .collect()
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            peer_id: Some(Uuid::from_u128(0x1d2c_3b4a_5968_4776_8596_a4b3_c2d1_e0f0)),
            name: "workstation".to_string(),
        },
        keys: KeysConfig {
            private_key: Some(PathBuf::from("keys/private.pem")),
            public_key: Some(PathBuf::from("keys/public.pem")),
        },
        peers: vec![PeerEntry {
            id: Uuid::from_u128(0x0f1e_2d3c_4b5a_4968_8776_8594_a3b2_c1d0),
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            port: DEFAULT_PORT,
            public_key: Some(PathBuf::from("keys/laptop.pem")),
        }],
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, DEFAULT_PORT);
        assert!(config.peers.is_empty());

        let runtime = config.network_config();
        assert_eq!(runtime.request_timeout, Duration::from_secs(5));
        assert_eq!(runtime.kill_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.general.peer_id = Some(Uuid::new_v4());
        config.network.port = 25000;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.port, 25000);
        assert_eq!(loaded.peer_id(), config.peer_id());
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = Config::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [network]
            port = 30000

            [[peers]]
            id = "6f1c1f8e-8d0a-4a44-9a0b-2f6c0d1e2a3b"
            address = "10.0.0.7"
            "#,
        )
        .unwrap();
        assert_eq!(config.network.port, 30000);
        assert_eq!(config.network.history_throttle_ms, 2000);
        assert_eq!(config.peers[0].port, DEFAULT_PORT);

        let peers = config.load_peers().unwrap();
        assert_eq!(peers[0].socket_addr(), "10.0.0.7:24900".parse().unwrap());
        assert!(peers[0].public_key.is_none());
    }

    #[test]
    fn test_load_keys_and_peers() {
        let dir = TempDir::new().unwrap();
        crypto::test_keys::alice().save(dir.path()).unwrap();

        let mut config = Config::default();
        config.keys.private_key = Some(dir.path().join("private.pem"));
        config.peers.push(PeerEntry {
            id: Uuid::new_v4(),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 25001,
            public_key: Some(dir.path().join("public.pem")),
        });

        let keys = config.load_keys().unwrap().unwrap();
        assert_eq!(keys.public_key(), crypto::test_keys::alice().public_key());

        let peers = config.load_peers().unwrap();
        assert_eq!(peers[0].public_key.as_ref(), Some(keys.public_key()));
    }

    #[test]
    fn test_public_key_must_match() {
        let (ours, theirs) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        crypto::test_keys::alice().save(ours.path()).unwrap();
        crypto::test_keys::bob().save(theirs.path()).unwrap();

        let mut config = Config::default();
        config.keys.private_key = Some(ours.path().join("private.pem"));
        config.keys.public_key = Some(ours.path().join("public.pem"));
        assert!(config.load_keys().unwrap().is_some());

        config.keys.public_key = Some(theirs.path().join("public.pem"));
        assert!(matches!(config.load_keys(), Err(ConfigError::KeyMismatch(_))));

        config.keys.public_key = Some(ours.path().join("absent.pem"));
        assert!(matches!(config.load_keys(), Err(ConfigError::Key(..))));
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config: Config = toml::from_str(
            r#"
            [network]
            discovery_interval_ms = 0
            inventory_interval_ms = 0
            "#,
        )
        .unwrap();
        let runtime = config.network_config();
        assert_eq!(runtime.discovery_interval, Duration::from_millis(1));
        assert_eq!(runtime.inventory_interval, Duration::from_millis(1));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.general.name, "workstation");
        assert_eq!(parsed.peers.len(), 1);
    }
}
