//! Configuration management

use crate::channel::ChannelOptions;
use crate::chunk::{ChunkFormat, ChunkOptions};
use crate::crypto::{derive_chunk_keys, SequenceCounter};
use crate::udp::{
    TransmitterOptions, UdpChannelTransmitter, DEFAULT_MAX_DATAGRAM_SIZE, UDP_HEADER_LEN,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub channel: ChannelConfig,
    pub chunk: ChunkConfig,
    pub udp: UdpConfig,
    pub logging: LoggingConfig,
}

impl TunnelConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;
        Self::parse(&content)
    }

    /// Parse and validate TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        let config: Self = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        let invalid = |msg: &str| Err(crate::Error::Config(msg.to_string()));

        if self.channel.buffer_size == 0 {
            return invalid("channel.buffer_size must be positive");
        }
        if self.channel.graceful_timeout_ms == 0 {
            return invalid("channel.graceful_timeout_ms must be positive");
        }
        if self.channel.expiry_check_interval_ms == 0 {
            return invalid("channel.expiry_check_interval_ms must be positive");
        }
        if self.chunk.max_chunk_size == 0 {
            return invalid("chunk.max_chunk_size must be positive");
        }
        if self.chunk.max_chunk_size < self.channel.buffer_size {
            return invalid("chunk.max_chunk_size must hold a full channel buffer");
        }
        if self.chunk.format == ChunkFormatKind::Http && self.chunk.host.is_empty() {
            return invalid("chunk.host is required for the http format");
        }
        if self.udp.max_datagram_size <= UDP_HEADER_LEN {
            return invalid("udp.max_datagram_size must exceed the datagram header");
        }
        self.log_level()?;
        Ok(())
    }

    pub fn log_level(&self) -> Result<tracing::Level, crate::Error> {
        self.logging
            .level
            .parse()
            .map_err(|_| crate::Error::Config(format!("Unknown log level: {}", self.logging.level)))
    }

    pub fn channel_options(&self) -> ChannelOptions {
        let channel = &self.channel;
        ChannelOptions {
            lifespan: (channel.lifespan_secs > 0).then(|| Duration::from_secs(channel.lifespan_secs)),
            graceful_timeout: Duration::from_millis(channel.graceful_timeout_ms),
            expiry_check_interval: Duration::from_millis(channel.expiry_check_interval_ms),
            buffer_size: channel.buffer_size,
        }
    }

    pub fn chunk_options(&self) -> ChunkOptions {
        ChunkOptions {
            graceful_timeout: Duration::from_millis(self.channel.graceful_timeout_ms),
            reuse_timeout: Duration::from_millis(self.chunk.reuse_timeout_ms),
            max_chunk_size: self.chunk.max_chunk_size,
        }
    }

    /// Wire variant; `secret` keys the sealed binary headers
    pub fn chunk_format(&self, secret: Option<&[u8]>) -> Result<ChunkFormat, crate::Error> {
        match self.chunk.format {
            ChunkFormatKind::Http => Ok(ChunkFormat::Http {
                host: self.chunk.host.clone(),
            }),
            ChunkFormatKind::Binary if !self.chunk.encrypt_headers => Ok(ChunkFormat::Binary),
            ChunkFormatKind::Binary => {
                let secret = secret.ok_or_else(|| {
                    crate::Error::Config("chunk.encrypt_headers requires a shared secret".to_string())
                })?;
                Ok(ChunkFormat::EncryptedBinary {
                    keys: derive_chunk_keys(secret)?,
                    encrypt_payload: self.chunk.encrypt_payload,
                })
            }
        }
    }

    pub fn transmitter_options(&self) -> TransmitterOptions {
        TransmitterOptions {
            max_datagram_size: self.udp.max_datagram_size,
        }
    }

    /// Bind the shared UDP socket on `udp.listen`
    pub async fn bind_transmitter(
        &self,
        sequence: Arc<SequenceCounter>,
    ) -> Result<UdpChannelTransmitter, crate::Error> {
        Ok(UdpChannelTransmitter::bind(
            self.udp.listen.as_str(),
            sequence,
            self.transmitter_options(),
        )
        .await?)
    }
}

/// Packet channel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Seconds until a channel closes itself, 0 for never
    pub lifespan_secs: u64,
    /// Bound on the close handshake and on draining a chunk stream
    pub graceful_timeout_ms: u64,
    /// Period of the lifespan check
    pub expiry_check_interval_ms: u64,
    /// Stream send buffer, the ceiling for one batched write
    pub buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            lifespan_secs: 0,
            graceful_timeout_ms: 5000,
            expiry_check_interval_ms: 1000,
            buffer_size: crate::channel::DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Chunk stream wire variant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkFormatKind {
    #[default]
    Binary,
    Http,
}

/// Chunk stream configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    pub format: ChunkFormatKind,
    /// HTTP `Host` header sent by clients
    pub host: String,
    /// Seal binary chunk headers
    pub encrypt_headers: bool,
    /// Seal binary chunk payloads as well
    pub encrypt_payload: bool,
    pub reuse_timeout_ms: u64,
    pub max_chunk_size: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            format: ChunkFormatKind::Binary,
            host: "www.example.com".to_string(),
            encrypt_headers: false,
            encrypt_payload: false,
            reuse_timeout_ms: 5000,
            max_chunk_size: crate::chunk::DEFAULT_MAX_CHUNK_SIZE,
        }
    }
}

/// UDP transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Listen address of the shared socket
    pub listen: String,
    /// Ceiling for a whole datagram, header included
    pub max_datagram_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:0".to_string(),
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TunnelConfig::default();
        config.validate().unwrap();
        assert_eq!(config.channel_options().lifespan, None);
        assert!(matches!(config.chunk_format(None).unwrap(), ChunkFormat::Binary));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = TunnelConfig::parse(
            r#"
            [channel]
            lifespan_secs = 30

            [chunk]
            format = "http"
            host = "cdn.example.net"

            [udp]
            max_datagram_size = 1400
            "#,
        )
        .unwrap();

        assert_eq!(config.channel_options().lifespan, Some(Duration::from_secs(30)));
        assert_eq!(config.channel.graceful_timeout_ms, 5000);
        assert_eq!(config.transmitter_options().max_datagram_size, 1400);
        match config.chunk_format(None).unwrap() {
            ChunkFormat::Http { host } => assert_eq!(host, "cdn.example.net"),
            other => panic!("unexpected format {:?}", other),
        }
    }

    #[test]
    fn test_validation_errors() {
        let mut config = TunnelConfig::default();
        config.udp.max_datagram_size = UDP_HEADER_LEN;
        assert!(config.validate().is_err());

        let mut config = TunnelConfig::default();
        config.channel.graceful_timeout_ms = 0;
        assert!(config.validate().is_err());

        assert!(TunnelConfig::parse("[chunk]\nformat = \"quic\"").is_err());
        assert!(TunnelConfig::parse("[logging]\nlevel = \"loud\"").is_err());
    }

    #[tokio::test]
    async fn test_bind_transmitter_from_config() {
        let config = TunnelConfig::parse(
            r#"
            [udp]
            listen = "127.0.0.1:0"
            max_datagram_size = 1200

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level().unwrap(), tracing::Level::DEBUG);

        let transmitter = config
            .bind_transmitter(Arc::new(SequenceCounter::starting_at(1)))
            .await
            .unwrap();
        assert!(transmitter.local_addr().unwrap().ip().is_loopback());
        assert_eq!(transmitter.max_payload(), 1200 - UDP_HEADER_LEN);
    }

    #[test]
    fn test_encrypted_headers_need_secret() {
        let mut config = TunnelConfig::default();
        config.chunk.encrypt_headers = true;
        assert!(config.chunk_format(None).is_err());
        assert!(matches!(
            config.chunk_format(Some(b"shared secret")).unwrap(),
            ChunkFormat::EncryptedBinary { encrypt_payload: false, .. }
        ));
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("vpn-channel-{}.toml", std::process::id()));
        let mut config = TunnelConfig::default();
        config.channel.lifespan_secs = 90;
        config.save(&path).unwrap();

        let loaded = TunnelConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }
}
