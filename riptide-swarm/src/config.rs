//! Centralized configuration for Riptide.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::RiptideError;
use crate::torrent::block::DEFAULT_BLOCK_SIZE;

/// Largest block size peers are expected to serve (128 KiB).
pub const MAX_BLOCK_SIZE: u32 = 128 * 1024;

/// Central configuration for all Riptide components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct RiptideConfig {
    pub exchange: ExchangeConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
}

/// What a session does with its storage once nobody is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReclaimPolicy {
    /// Storage stays open until `Session::close`
    #[default]
    KeepOpen,
    /// Storage is closed when the last connection goes away and every piece is held
    CloseStorageWhenIdle,
}

/// Piece exchange configuration.
///
/// Controls request pipelining, channel capacities and what the client
/// advertises in its extension handshake.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Blocks kept requested from a single peer
    pub max_outstanding_requests: usize,
    /// Size of each requested block
    pub block_size: u32,
    /// Buffered messages in the session-wide broadcast stream
    pub broadcast_capacity: usize,
    /// Decoded messages buffered between a connection's reader and its actor
    pub incoming_queue_capacity: usize,
    /// Client name sent in the extension handshake
    pub client_version: String,
    /// Storage reclamation once the session goes idle
    pub reclaim_policy: ReclaimPolicy,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            max_outstanding_requests: 5,
            block_size: DEFAULT_BLOCK_SIZE,
            broadcast_capacity: 256,
            incoming_queue_capacity: 64,
            client_version: concat!("riptide/", env!("CARGO_PKG_VERSION")).to_string(),
            reclaim_policy: ReclaimPolicy::KeepOpen,
        }
    }
}

/// Peer connection configuration.
///
/// Controls dial and handshake deadlines and the default listen address.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Deadline for establishing an outbound TCP connection
    pub connect_timeout: Duration,
    /// Deadline for completing the BitTorrent handshake
    pub handshake_timeout: Duration,
    /// Address inbound peers connect to
    pub listen_address: SocketAddr,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(10),
            listen_address: SocketAddr::from(([0, 0, 0, 0], 6881)),
        }
    }
}

/// File storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding one subdirectory of piece files per torrent
    pub download_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
        }
    }
}

impl RiptideConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(depth) = std::env::var("RIPTIDE_MAX_OUTSTANDING_REQUESTS")
            && let Ok(depth) = depth.parse::<usize>()
        {
            config.exchange.max_outstanding_requests = depth;
        }

        if let Ok(timeout) = std::env::var("RIPTIDE_CONNECT_TIMEOUT")
            && let Ok(seconds) = timeout.parse::<u64>()
        {
            config.network.connect_timeout = Duration::from_secs(seconds);
        }

        if let Ok(dir) = std::env::var("RIPTIDE_DOWNLOAD_DIR") {
            config.storage.download_dir = PathBuf::from(dir);
        }

        config
    }

    /// Creates a configuration for tests: short deadlines, small channels.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.network.connect_timeout = Duration::from_millis(500);
        config.network.handshake_timeout = Duration::from_secs(2);
        config.network.listen_address = SocketAddr::from(([127, 0, 0, 1], 0));
        config.exchange.broadcast_capacity = 64;
        config
    }

    /// Rejects settings the exchange cannot work with.
    ///
    /// # Errors
    ///
    /// - `RiptideError::Configuration` - Zero request depth, zero block size,
    ///   or block size above 128 KiB
    pub fn validate(&self) -> Result<(), RiptideError> {
        if self.exchange.max_outstanding_requests == 0 {
            return Err(RiptideError::Configuration {
                reason: "max_outstanding_requests must be at least 1".to_string(),
            });
        }
        if self.exchange.block_size == 0 || self.exchange.block_size > MAX_BLOCK_SIZE {
            return Err(RiptideError::Configuration {
                reason: format!(
                    "block_size must be between 1 and {MAX_BLOCK_SIZE}, got {}",
                    self.exchange.block_size
                ),
            });
        }
        if self.exchange.broadcast_capacity == 0 || self.exchange.incoming_queue_capacity == 0 {
            return Err(RiptideError::Configuration {
                reason: "channel capacities must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = RiptideConfig::default();

        assert_eq!(config.exchange.max_outstanding_requests, 5);
        assert_eq!(config.exchange.block_size, 16 * 1024);
        assert_eq!(config.exchange.reclaim_policy, ReclaimPolicy::KeepOpen);
        assert_eq!(config.network.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.network.handshake_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_request_depth_rejected() {
        let mut config = RiptideConfig::default();
        config.exchange.max_outstanding_requests = 0;
        assert!(matches!(
            config.validate(),
            Err(RiptideError::Configuration { .. })
        ));
    }

    #[test]
    fn test_validate_oversized_block_rejected() {
        let mut config = RiptideConfig::default();
        config.exchange.block_size = MAX_BLOCK_SIZE + 1;
        assert!(config.validate().is_err());

        config.exchange.block_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("RIPTIDE_MAX_OUTSTANDING_REQUESTS", "12");
            std::env::set_var("RIPTIDE_DOWNLOAD_DIR", "/tmp/riptide-env-test");
        }

        let config = RiptideConfig::from_env();

        assert_eq!(config.exchange.max_outstanding_requests, 12);
        assert_eq!(
            config.storage.download_dir,
            PathBuf::from("/tmp/riptide-env-test")
        );

        unsafe {
            std::env::remove_var("RIPTIDE_MAX_OUTSTANDING_REQUESTS");
            std::env::remove_var("RIPTIDE_DOWNLOAD_DIR");
        }
    }
}
