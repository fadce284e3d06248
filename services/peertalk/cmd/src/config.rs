//! Configuration handling for the peertalk node.
//!
//! This module reads the node configuration from a YAML file and
//! environment variables, providing a unified configuration interface.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use peertalk_engine::EngineConfig;

/// Peertalk node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeertalkConfig {
    /// Display name announced to peers
    pub name: String,
    /// UDP port for discovery broadcasts
    pub discovery_port: u16,
    /// TCP port for reliable transport
    pub tcp_port: u16,
    /// UDP port for unreliable datagrams
    pub udp_port: u16,
    /// Maximum peer slots
    pub max_peers: usize,
    /// Queue slots per peer per direction (power of two)
    pub queue_capacity: usize,
    /// Direct buffer capacity per peer per direction
    pub direct_buffer_size: usize,
    /// Whether oversized payloads are fragmented automatically
    pub fragmentation: bool,
    /// Advertised maximum message size
    pub max_message_size: u16,
    /// Preferred streaming chunk size
    pub preferred_chunk: u16,
    /// Seconds between discovery announcements
    pub discovery_interval_secs: u32,
    /// Seconds of silence before a peer is evicted
    pub peer_timeout_secs: u32,
}

impl Default for PeertalkConfig {
    fn default() -> Self {
        Self {
            name: "peertalk-node".to_string(),
            discovery_port: 7353,
            tcp_port: 7354,
            udp_port: 7355,
            max_peers: 16,
            queue_capacity: 32,
            direct_buffer_size: 4096,
            fragmentation: true,
            max_message_size: 8192,
            preferred_chunk: 1024,
            discovery_interval_secs: 5,
            peer_timeout_secs: 15,
        }
    }
}

impl PeertalkConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<PeertalkConfig>(&content) {
                Ok(parsed) => {
                    config = parsed;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(err) => {
                    warn!(
                        "Failed to parse config file {:?} ({}), using defaults",
                        config_path.as_ref(),
                        err
                    );
                }
            }
        } else {
            warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            );
        }

        config.apply_environment_overrides();

        info!(
            "Final node configuration: name={}, discovery_port={}, tcp_port={}, udp_port={}",
            config.name, config.discovery_port, config.tcp_port, config.udp_port
        );

        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(name) = std::env::var("PEERTALK_NAME") {
            self.name = name;
            info!("Node name overridden by environment: {}", self.name);
        }

        if let Ok(port) = std::env::var("PEERTALK_DISCOVERY_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.discovery_port = port;
                info!("Discovery port overridden by environment: {}", port);
            }
        }

        if let Ok(port) = std::env::var("PEERTALK_TCP_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.tcp_port = port;
                info!("TCP port overridden by environment: {}", port);
            }
        }

        if let Ok(port) = std::env::var("PEERTALK_UDP_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.udp_port = port;
                info!("UDP port overridden by environment: {}", port);
            }
        }

        if let Ok(max_peers) = std::env::var("PEERTALK_MAX_PEERS") {
            if let Ok(max_peers) = max_peers.parse::<usize>() {
                self.max_peers = max_peers;
                info!("Max peers overridden by environment: {}", max_peers);
            }
        }
    }

    /// Translate the node configuration into engine terms
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            name: self.name.clone(),
            local_port: self.tcp_port,
            max_peers: self.max_peers,
            queue_capacity: self.queue_capacity,
            direct_buffer_size: self.direct_buffer_size,
            discovery_interval_ms: self.discovery_interval_secs.saturating_mul(1_000),
            peer_timeout_ms: self.peer_timeout_secs.saturating_mul(1_000),
            enable_fragmentation: self.fragmentation,
            max_message_size: self.max_message_size,
            preferred_chunk: self.preferred_chunk,
            ..EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = PeertalkConfig::default();
        assert_eq!(config.discovery_port, 7353);
        assert_eq!(config.tcp_port, 7354);
        assert_eq!(config.udp_port, 7355);
        assert_eq!(config.max_peers, 16);
        assert!(config.fragmentation);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
name: "lab-node"
tcp_port: 9354
udp_port: 9355
max_peers: 8
fragmentation: false
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = PeertalkConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.name, "lab-node");
        assert_eq!(config.tcp_port, 9354);
        assert_eq!(config.udp_port, 9355);
        assert_eq!(config.max_peers, 8);
        assert!(!config.fragmentation);
        // unset fields fall back to defaults
        assert_eq!(config.discovery_port, 7353);
        assert_eq!(config.queue_capacity, 32);
    }

    #[test]
    fn test_engine_config_translation() {
        let config = PeertalkConfig {
            peer_timeout_secs: 30,
            ..Default::default()
        };
        let engine = config.engine_config();
        assert_eq!(engine.local_port, 7354);
        assert_eq!(engine.peer_timeout_ms, 30_000);
        assert!(engine.validate().is_ok());
    }
}
