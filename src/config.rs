//! Layered configuration using Figment
//!
//! Configuration is loaded from:
//! 1. A TOML file (base configuration)
//! 2. Environment variables prefixed with `RTDP_INGEST_`, using `__` between nested keys
//!    (e.g. `RTDP_INGEST_INGEST__MERGE_POLICY=concatenate`)
//!
//! # Example
//! ```no_run
//! use rtdp_ingest::config::IngestConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = IngestConfig::load_from("ingest.toml")?;
//! config.validate()?;
//! println!("{} source(s)", config.sources.len());
//! # Ok(())
//! # }
//! ```
//!
//! A minimal file:
//!
//! ```toml
//! [ingest]
//! merge_policy = "round_robin"
//! payload_format = "sampa"
//!
//! [[sources]]
//! host = "daq01"
//! port = 5000
//! byte_order = "big"
//! ```

use crate::aggregator::MergePolicy;
use crate::codec::ByteOrder;
use crate::error::{AppResult, IngestError};
use crate::pipeline::PayloadFormat;
use crate::ring::MAX_CAPACITY;
use crate::source::RetryPolicy;
use crate::tracing_setup::OutputFormat;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "RTDP_INGEST_";

/// Largest frame a source may be configured to accept.
pub const MAX_FRAME_BYTES_LIMIT: u32 = 16 * 1024 * 1024;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Consumer-side settings shared by all sources
    #[serde(default)]
    pub ingest: IngestSettings,
    /// Retry policy for the initial connect of each source
    #[serde(default = "RetryPolicy::connect_default")]
    pub connect: RetryPolicy,
    /// Retry policy after an established connection drops
    #[serde(default)]
    pub reconnect: RetryPolicy,
    /// Ordered list of network sources
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: OutputFormat,
}

/// Consumer-side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSettings {
    /// How events from several sources are merged
    #[serde(default)]
    pub merge_policy: MergePolicy,
    /// How each frame payload is decoded
    #[serde(default)]
    pub payload_format: PayloadFormat,
    /// Keep only packets with this IP protocol number (6 = TCP, 17 = UDP)
    #[serde(default)]
    pub protocol_filter: Option<u8>,
    /// How long a consumer waits for an event before reporting idle
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// How long a producer waits for ring space before declaring a stall
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,
    /// Interval between throughput monitor updates
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,
}

/// Connection parameters for one network source.
///
/// Immutable once the source's handler has started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Host name or address
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Timeout for a single connect attempt
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Socket read timeout; expiry is not an error
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Ring slots (rounded up to a power of two)
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    /// Byte order of the 4-byte frame length prefix
    #[serde(default)]
    pub byte_order: ByteOrder,
    /// Largest accepted frame; larger prefixes desynchronize the stream
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u32,
    /// Identifier stamped on every event; defaults to the source's list index
    #[serde(default)]
    pub source_id: Option<u32>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> u64 {
    100
}

fn default_publish_timeout() -> u64 {
    5000
}

fn default_monitor_interval() -> u64 {
    1000
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_read_timeout() -> u64 {
    10000
}

fn default_ring_capacity() -> usize {
    1024
}

fn default_max_frame_bytes() -> u32 {
    64 * 1024
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: OutputFormat::default(),
        }
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            merge_policy: MergePolicy::default(),
            payload_format: PayloadFormat::default(),
            protocol_filter: None,
            poll_interval_ms: default_poll_interval(),
            publish_timeout_ms: default_publish_timeout(),
            monitor_interval_ms: default_monitor_interval(),
        }
    }
}

impl IngestSettings {
    /// Consumer poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Producer publish timeout as a `Duration`.
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Monitor update interval as a `Duration`.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            ring_capacity: default_ring_capacity(),
            byte_order: ByteOrder::default(),
            max_frame_bytes: default_max_frame_bytes(),
            source_id: None,
        }
    }
}

impl SourceConfig {
    /// Source parameters for `host:port` with every other field at its default.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// `host:port` string used in logs and status output.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Read timeout as a `Duration`.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    fn validate(&self, index: usize) -> AppResult<()> {
        let fail = |msg: String| Err(IngestError::Configuration(format!("sources[{index}]: {msg}")));
        if self.host.trim().is_empty() {
            return fail("host must not be empty".into());
        }
        if self.port == 0 {
            return fail("port must be in 1..=65535".into());
        }
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 {
            return fail("connect_timeout_ms and read_timeout_ms must be greater than 0".into());
        }
        if self.ring_capacity == 0 || self.ring_capacity > MAX_CAPACITY {
            return fail(format!(
                "ring_capacity {} must be in 1..={}",
                self.ring_capacity, MAX_CAPACITY
            ));
        }
        if self.max_frame_bytes == 0 || self.max_frame_bytes > MAX_FRAME_BYTES_LIMIT {
            return fail(format!(
                "max_frame_bytes {} must be in 1..={}",
                self.max_frame_bytes, MAX_FRAME_BYTES_LIMIT
            ));
        }
        Ok(())
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            ingest: IngestSettings::default(),
            connect: RetryPolicy::connect_default(),
            reconnect: RetryPolicy::default(),
            sources: Vec::new(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from a TOML file merged with `RTDP_INGEST_` environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Ok(Figment::new().merge(Toml::string(toml)).extract()?)
    }

    /// Sample configuration with one local source, printed by `rtdp-ingest default-config`.
    pub fn example() -> Self {
        Self {
            sources: vec![SourceConfig::default()],
            ..Default::default()
        }
    }

    /// Resolved identifier of the source at `index`.
    pub fn source_id(&self, index: usize) -> u32 {
        self.sources[index].source_id.unwrap_or(index as u32)
    }

    /// Validate semantic constraints that parsing cannot express.
    pub fn validate(&self) -> AppResult<()> {
        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(IngestError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.sources.is_empty() {
            return Err(IngestError::Configuration(
                "at least one [[sources]] entry is required".into(),
            ));
        }

        if self.ingest.poll_interval_ms == 0
            || self.ingest.publish_timeout_ms == 0
            || self.ingest.monitor_interval_ms == 0
        {
            return Err(IngestError::Configuration(
                "ingest intervals and timeouts must be greater than 0".into(),
            ));
        }

        let mut seen = HashSet::new();
        for (index, source) in self.sources.iter().enumerate() {
            source.validate(index)?;
            let id = self.source_id(index);
            if !seen.insert(id) {
                return Err(IngestError::Configuration(format!("Duplicate source id: {id}")));
            }
        }

        self.connect.validate("connect")?;
        self.reconnect.validate("reconnect")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_defaults() {
        let source = SourceConfig::default();
        assert_eq!(source.host, "localhost");
        assert_eq!(source.port, 5000);
        assert_eq!(source.connect_timeout_ms, 5000);
        assert_eq!(source.read_timeout_ms, 10000);
        assert_eq!(source.ring_capacity, 1024);
        assert_eq!(source.byte_order, ByteOrder::Big);
        assert_eq!(source.endpoint(), "localhost:5000");
    }

    #[test]
    fn test_parse_toml() {
        let config = IngestConfig::from_toml_str(
            r#"
            [logging]
            level = "debug"
            format = "json"

            [ingest]
            merge_policy = "concatenate"
            payload_format = "sampa"
            protocol_filter = 17

            [reconnect]
            max_attempts = 5

            [[sources]]
            host = "daq01"
            port = 6000
            byte_order = "little"

            [[sources]]
            port = 6001
            source_id = 42
            "#,
        )
        .unwrap();

        assert_eq!(config.logging.format, OutputFormat::Json);
        assert_eq!(config.ingest.merge_policy, MergePolicy::Concatenate);
        assert_eq!(config.ingest.payload_format, PayloadFormat::Sampa);
        assert_eq!(config.ingest.protocol_filter, Some(17));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].byte_order, ByteOrder::Little);
        assert_eq!(config.sources[1].host, "localhost");
        assert_eq!(config.source_id(0), 0);
        assert_eq!(config.source_id(1), 42);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_empty_sources() {
        let err = IngestConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("[[sources]]"));
    }

    #[test]
    fn test_validate_rejects_port_zero() {
        let mut config = IngestConfig::example();
        config.sources[0].port = 0;
        assert!(config.validate().unwrap_err().to_string().contains("port"));
    }

    #[test]
    fn test_validate_rejects_oversized_frames() {
        let mut config = IngestConfig::example();
        config.sources[0].max_frame_bytes = MAX_FRAME_BYTES_LIMIT + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_ring_capacity_out_of_range() {
        let mut config = IngestConfig::example();
        config.sources[0].ring_capacity = usize::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ring_capacity"));

        config.sources[0].ring_capacity = 1 << 40;
        assert!(config.validate().is_err());

        config.sources[0].ring_capacity = MAX_CAPACITY;
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unknown_log_level() {
        let mut config = IngestConfig::example();
        config.logging.level = "verbose".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log level 'verbose'"));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let mut config = IngestConfig::example();
        let mut second = SourceConfig::new("localhost", 5001);
        second.source_id = Some(0);
        config.sources.push(second);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate source id: 0"));
    }

    #[test]
    fn test_example_round_trips_through_toml() {
        let text = toml::to_string_pretty(&IngestConfig::example()).unwrap();
        let parsed = IngestConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.sources, IngestConfig::example().sources);
    }
}
