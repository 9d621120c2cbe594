//! Config and health handlers.

use crate::api::schema::*;
use crate::daemon::Daemon;
use chrono::Utc;
use parleyproto::{ErrorCode, RpcError};
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn health_ping(daemon: &Arc<Daemon>) -> Result<Value, RpcError> {
    Ok(json!({
        "pong": true,
        "uptime_secs": daemon.uptime_secs(),
        "server_time": Utc::now(),
    }))
}

pub async fn health_status(daemon: &Arc<Daemon>) -> Result<Value, RpcError> {
    Ok(json!({
        "uptime_secs": daemon.uptime_secs(),
        "connections": daemon.connections.count(),
        "sessions": daemon.sessions.session_count(),
        "subscriptions": daemon.subscriptions.subscription_count(),
        "active_spans": daemon.tracer.active_span_count(),
        "nodes": daemon.health.snapshot(),
    }))
}

pub async fn config_get(daemon: &Arc<Daemon>, params: ConfigGetParams) -> Result<Value, RpcError> {
    let config = daemon
        .config
        .read()
        .map_err(|_| RpcError::internal("config lock poisoned"))?;
    let mut value =
        serde_json::to_value(&*config).map_err(|e| RpcError::internal(e.to_string()))?;
    drop(config);

    sanitize(&mut value);

    match params.section {
        None => Ok(value),
        Some(section) => value
            .get(&section)
            .cloned()
            .ok_or_else(|| {
                RpcError::new(
                    ErrorCode::InvalidParams,
                    format!("unknown config section: {}", section),
                )
            })
            .map(|section_value| json!({ section: section_value })),
    }
}

pub async fn config_set(daemon: &Arc<Daemon>, params: ConfigSetParams) -> Result<Value, RpcError> {
    if params.key.starts_with("auth.") {
        return Err(RpcError::new(
            ErrorCode::PermissionDenied,
            "auth settings cannot be changed over the wire",
        ));
    }

    let updated = {
        let config = daemon
            .config
            .read()
            .map_err(|_| RpcError::internal("config lock poisoned"))?;
        let mut value =
            serde_json::to_value(&*config).map_err(|e| RpcError::internal(e.to_string()))?;
        drop(config);

        set_path(&mut value, &params.key, params.value.clone()).ok_or_else(|| {
            RpcError::new(
                ErrorCode::InvalidParams,
                format!("unknown config key: {}", params.key),
            )
        })?;

        let updated: parleyconf::ParleyConfig = serde_json::from_value(value)
            .map_err(|e| RpcError::invalid_params(vec![e.to_string()]))?;
        updated
            .validate()
            .map_err(|e| RpcError::invalid_params(vec![e.to_string()]))?;
        updated
    };

    *daemon
        .config
        .write()
        .map_err(|_| RpcError::internal("config lock poisoned"))? = updated;

    daemon.bus.publish(
        "config.changed",
        json!({ "key": params.key, "value": params.value }),
    );
    Ok(json!({ "key": params.key, "applied": true }))
}

/// Strip secrets before config leaves the daemon.
fn sanitize(value: &mut Value) {
    if let Some(auth) = value.get_mut("auth") {
        if let Some(secret) = auth.get_mut("jwt_secret") {
            if !secret.is_null() {
                *secret = json!("***");
            }
        }
        if let Some(keys) = auth.get_mut("api_keys").and_then(Value::as_array_mut) {
            for entry in keys {
                if let Some(key) = entry.get_mut("key") {
                    *key = json!("***");
                }
            }
        }
    }
}

/// Set a dot-path inside a JSON object tree. Returns None when the path
/// does not name an existing field.
fn set_path(value: &mut Value, path: &str, next: Value) -> Option<()> {
    let mut cursor = value;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let map = cursor.as_object_mut()?;
        if segments.peek().is_none() {
            let slot = map.get_mut(segment)?;
            *slot = next;
            return Some(());
        }
        cursor = map.get_mut(segment)?;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use parleyconf::ParleyConfig;

    fn daemon() -> Arc<Daemon> {
        let mut config = ParleyConfig::default();
        config.auth.jwt_secret = Some("very-secret".to_string());
        Daemon::new(config).unwrap()
    }

    #[tokio::test]
    async fn ping_pongs() {
        let daemon = daemon();
        let payload = health_ping(&daemon).await.unwrap();
        assert_eq!(payload["pong"], true);
    }

    #[tokio::test]
    async fn config_get_redacts_secrets() {
        let daemon = daemon();
        let value = config_get(&daemon, ConfigGetParams { section: None })
            .await
            .unwrap();
        assert_eq!(value["auth"]["jwt_secret"], "***");
        assert!(value["rate"]["max_tokens"].is_number());
    }

    #[tokio::test]
    async fn config_get_unknown_section_fails() {
        let daemon = daemon();
        let err = config_get(
            &daemon,
            ConfigGetParams {
                section: Some("nope".into()),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams);
    }

    #[tokio::test]
    async fn config_set_updates_value() {
        let daemon = daemon();
        config_set(
            &daemon,
            ConfigSetParams {
                key: "rate.max_tokens".into(),
                value: json!(42.0),
            },
        )
        .await
        .unwrap();
        assert_eq!(daemon.config.read().unwrap().rate.max_tokens, 42.0);
    }

    #[tokio::test]
    async fn config_set_rejects_bad_values() {
        let daemon = daemon();
        let err = config_set(
            &daemon,
            ConfigSetParams {
                key: "trace.sample_rate".into(),
                value: json!(7.5),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams);

        let err = config_set(
            &daemon,
            ConfigSetParams {
                key: "no.such.key".into(),
                value: json!(1),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams);
    }

    #[tokio::test]
    async fn config_set_refuses_auth_paths() {
        let daemon = daemon();
        let err = config_set(
            &daemon,
            ConfigSetParams {
                key: "auth.jwt_secret".into(),
                value: json!("pwned"),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::PermissionDenied);
    }
}
