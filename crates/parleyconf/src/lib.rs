//! Minimal configuration loading for Parley.
//!
//! This crate provides configuration loading with minimal dependencies so
//! every Parley crate can import it without dependency cycles.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/parley/config.toml` (system)
//! 2. `~/.config/parley/config.toml` (user)
//! 3. `./parley.toml` (local override, replaced by `--config` when given)
//! 4. Environment variables (`PARLEY_*`)
//!
//! # Example Config
//!
//! ```toml
//! [bind]
//! host = "0.0.0.0"
//! port = 8750
//!
//! [limits]
//! max_message_bytes = 1048576
//! compression = "gzip"
//!
//! [auth]
//! mode = "both"
//! jwt_secret = "change-me"
//! allow_loopback = true
//!
//! [[auth.api_keys]]
//! key = "pk-local-dev"
//! client_id = "local-dev"
//! scopes = ["*"]
//!
//! [rate]
//! max_tokens = 100
//! refill_per_second = 20
//!
//! [health]
//! interval_ms = 5000
//!
//! [telemetry]
//! otlp_endpoint = "127.0.0.1:4317"
//! log_level = "info"
//! ```

pub mod loader;

pub use loader::ConfigSources;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Complete Parley configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub bind: BindConfig,
    pub limits: LimitsConfig,
    pub auth: AuthConfig,
    pub rate: RateConfig,
    pub trace: TraceConfig,
    pub health: HealthConfig,
    pub telemetry: TelemetryConfig,
}

impl ParleyConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report where values came from.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config: ParleyConfig =
            toml::Table::try_into(merged).map_err(|e| ConfigError::Parse {
                path: PathBuf::from("<merged>"),
                message: e.to_string(),
            })?;

        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        Ok((config, sources))
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.trace.sample_rate) {
            return Err(ConfigError::Invalid(format!(
                "trace.sample_rate must be in [0, 1], got {}",
                self.trace.sample_rate
            )));
        }
        if self.rate.refill_per_second <= 0.0 {
            return Err(ConfigError::Invalid(
                "rate.refill_per_second must be positive".to_string(),
            ));
        }
        if self.auth.mode.requires_jwt() && self.auth.jwt_secret.is_none() {
            return Err(ConfigError::Invalid(format!(
                "auth.mode = {:?} requires auth.jwt_secret",
                self.auth.mode
            )));
        }
        Ok(())
    }
}

/// Where the daemon listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BindConfig {
    pub host: String,
    pub port: u16,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8750,
        }
    }
}

/// Wire-level caps and the compression path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Cap on one transport message (uncompressed serialized size).
    pub max_message_bytes: usize,
    /// Cap on frames per batch.
    pub max_batch: usize,
    /// Outbound buffered bytes per connection before it is dropped.
    pub max_buffered_bytes: usize,
    /// "none", "gzip", or "deflate".
    pub compression: String,
    /// Serialized size at which compression kicks in.
    pub compression_threshold: usize,
    /// Attach the original error text to INTERNAL_ERROR responses.
    pub expose_internal_errors: bool,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 1024 * 1024,
            max_batch: 50,
            max_buffered_bytes: 4 * 1024 * 1024,
            compression: "none".to_string(),
            compression_threshold: 4096,
            expose_internal_errors: true,
        }
    }
}

/// How clients authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    JwtOnly,
    ApiKeyOnly,
    #[default]
    Both,
    LoopbackBypass,
}

impl AuthMode {
    pub fn requires_jwt(self) -> bool {
        matches!(self, AuthMode::JwtOnly | AuthMode::Both)
    }
}

/// One configured API key and the identity it maps to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub key: String,
    pub client_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    pub allow_loopback: bool,
    pub loopback_scopes: Vec<String>,
    pub api_keys: Vec<ApiKeyEntry>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::Both,
            jwt_secret: None,
            allow_loopback: true,
            loopback_scopes: vec!["*".to_string()],
            api_keys: Vec::new(),
        }
    }
}

/// Per-connection token bucket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    pub max_tokens: f64,
    pub refill_per_second: f64,
    /// Per-method cost overrides; unlisted methods cost 1.
    pub method_costs: HashMap<String, f64>,
}

impl Default for RateConfig {
    fn default() -> Self {
        let mut method_costs = HashMap::new();
        method_costs.insert("prompt.submit".to_string(), 5.0);
        method_costs.insert("session.create".to_string(), 3.0);
        method_costs.insert("memory.query".to_string(), 2.0);
        Self {
            max_tokens: 100.0,
            refill_per_second: 20.0,
            method_costs,
        }
    }
}

/// Distributed tracing core settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub enabled: bool,
    /// Probability a new root trace is sampled, in [0, 1].
    pub sample_rate: f64,
    /// Active spans older than this are force-ended by the sweep.
    pub span_ttl_ms: u64,
    pub sweep_interval_ms: u64,
    /// Completed spans retained per trace (oldest evicted).
    pub max_spans_per_trace: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 1.0,
            span_ttl_ms: 300_000,
            sweep_interval_ms: 30_000,
            max_spans_per_trace: 1000,
        }
    }
}

/// Cluster health monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Consecutive failing checks before a node flips unhealthy.
    pub failure_threshold: u32,
    /// Consecutive passing checks before a node flips healthy again.
    pub success_threshold: u32,
    /// Peer daemons to monitor, `node_id = "http://host:port"`.
    pub nodes: HashMap<String, String>,
    pub probes: ProbesConfig,
    pub circuit: CircuitConfig,
    pub failover: FailoverConfig,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            probe_timeout_ms: 3000,
            failure_threshold: 3,
            success_threshold: 2,
            nodes: HashMap::new(),
            probes: ProbesConfig::default(),
            circuit: CircuitConfig::default(),
            failover: FailoverConfig::default(),
        }
    }
}

/// Which probes run against each node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbesConfig {
    pub liveness: bool,
    pub readiness: bool,
    /// Startup probes gate a node only until they first pass.
    pub startup: bool,
}

impl Default for ProbesConfig {
    fn default() -> Self {
        Self {
            liveness: true,
            readiness: true,
            startup: false,
        }
    }
}

/// Per-node circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub enabled: bool,
    /// Rolling window over which the error rate is computed.
    pub window_ms: u64,
    /// Error rate at which the breaker opens.
    pub error_threshold: f64,
    /// Outcomes required in the window before the rate is meaningful.
    pub min_samples: usize,
    /// Time the breaker stays open before probing.
    pub reset_timeout_ms: u64,
    /// Trial calls admitted while half-open.
    pub half_open_requests: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 60_000,
            error_threshold: 0.5,
            min_samples: 5,
            reset_timeout_ms: 30_000,
            half_open_requests: 3,
        }
    }
}

/// Session migration off dead nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub enabled: bool,
    pub migration_timeout_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            migration_timeout_ms: 120_000,
        }
    }
}

/// Logging and export endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint; unset disables the export pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otlp_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}
