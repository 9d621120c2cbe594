//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, ParleyConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/parley/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("parley/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    // CLI override takes precedence over local
    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("parley.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load a TOML file as a raw table for merging.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents
        .parse::<toml::Table>()
        .map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Deep-merge `overlay` into `base`: tables merge recursively, every other
/// value (including arrays) is replaced wholesale.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut ParleyConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("PARLEY_HOST") {
        config.bind.host = v;
        sources.env_overrides.push("PARLEY_HOST".to_string());
    }
    if let Ok(v) = env::var("PARLEY_PORT") {
        if let Ok(port) = v.parse() {
            config.bind.port = port;
            sources.env_overrides.push("PARLEY_PORT".to_string());
        }
    }

    if let Ok(v) = env::var("PARLEY_JWT_SECRET") {
        config.auth.jwt_secret = Some(v);
        sources.env_overrides.push("PARLEY_JWT_SECRET".to_string());
    }
    if let Ok(v) = env::var("PARLEY_ALLOW_LOOPBACK") {
        config.auth.allow_loopback = matches!(v.as_str(), "1" | "true" | "yes");
        sources
            .env_overrides
            .push("PARLEY_ALLOW_LOOPBACK".to_string());
    }

    if let Ok(v) = env::var("PARLEY_SAMPLE_RATE") {
        if let Ok(rate) = v.parse() {
            config.trace.sample_rate = rate;
            sources.env_overrides.push("PARLEY_SAMPLE_RATE".to_string());
        }
    }

    if let Ok(v) = env::var("PARLEY_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(v);
        sources
            .env_overrides
            .push("PARLEY_OTLP_ENDPOINT".to_string());
    }
    // Also support standard OTEL env var
    if let Ok(v) = env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(v);
        sources
            .env_overrides
            .push("OTEL_EXPORTER_OTLP_ENDPOINT".to_string());
    }

    if let Ok(v) = env::var("PARLEY_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("PARLEY_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    // Production deployments get sanitized internal errors unless a config
    // file explicitly asked otherwise.
    if let Ok(v) = env::var("PARLEY_ENV") {
        if v == "production" {
            config.limits.expose_internal_errors = false;
        }
        sources.env_overrides.push("PARLEY_ENV".to_string());
    }
}
