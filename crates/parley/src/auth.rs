//! Connection and per-message authentication.
//!
//! Credentials arrive two ways: at connect time from the transport handshake
//! (Authorization header, `x-api-key` header, or `token` / `api_key` query
//! params) and per-message as an inline `{token, apiKey}` object. Both paths
//! produce an immutable [`Identity`].
//!
//! Precedence when mode is `both` and both credentials are present: JWT
//! wins. Loopback bypass applies only when enabled and the peer really is a
//! loopback address.

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use parleyconf::{AuthConfig, AuthMode};
use parleyproto::InlineCredentials;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use subtle::ConstantTimeEq;

/// How an identity was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    Jwt,
    ApiKey,
    Loopback,
}

/// The authenticated principal of a connection or a single message.
///
/// Immutable after issue; `auth.refresh` replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub client_id: String,
    pub method: AuthMethod,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Identity {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| exp <= Utc::now())
    }
}

/// Transport-level handshake inputs for connect-time auth.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    /// Bearer token from the Authorization header or `?token=`.
    pub token: Option<String>,
    /// API key from the `x-api-key` header or `?api_key=`.
    pub api_key: Option<String>,
    pub remote_addr: Option<IpAddr>,
}

/// Why authentication failed.
///
/// The router maps `CredentialsMissing` / `MessageCredentialsMissing` to
/// `AUTH_REQUIRED` and the rest to `AUTH_INVALID`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("No credentials provided")]
    CredentialsMissing,
    #[error("JWT has expired")]
    JwtExpired,
    #[error("JWT signature is invalid")]
    JwtSignatureInvalid,
    #[error("API key not recognized")]
    ApiKeyInvalid,
    #[error("Message carried no usable credentials")]
    MessageCredentialsMissing,
}

impl AuthError {
    /// True for the "nothing was presented" failures.
    pub fn is_missing(&self) -> bool {
        matches!(
            self,
            AuthError::CredentialsMissing | AuthError::MessageCredentialsMissing
        )
    }
}

/// Claims Parley reads from a JWT.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    scp: Vec<String>,
    exp: i64,
}

/// Validates credentials and produces identities.
pub struct Authenticator {
    config: AuthConfig,
    decoding_key: Option<DecodingKey>,
}

impl Authenticator {
    pub fn new(config: AuthConfig) -> Self {
        let decoding_key = config
            .jwt_secret
            .as_ref()
            .map(|secret| DecodingKey::from_secret(secret.as_bytes()));
        Self {
            config,
            decoding_key,
        }
    }

    /// Authenticate a new connection from its transport handshake.
    pub fn authenticate_connect(&self, handshake: &Handshake) -> Result<Identity, AuthError> {
        if let Some(identity) = self.try_loopback(handshake.remote_addr) {
            return Ok(identity);
        }

        self.authenticate_credentials(
            handshake.token.as_deref(),
            handshake.api_key.as_deref(),
            AuthError::CredentialsMissing,
        )
    }

    /// Authenticate inline credentials carried on a single message.
    pub fn authenticate_message(
        &self,
        credentials: &InlineCredentials,
    ) -> Result<Identity, AuthError> {
        self.authenticate_credentials(
            credentials.token.as_deref(),
            credentials.api_key.as_deref(),
            AuthError::MessageCredentialsMissing,
        )
    }

    fn authenticate_credentials(
        &self,
        token: Option<&str>,
        api_key: Option<&str>,
        missing: AuthError,
    ) -> Result<Identity, AuthError> {
        match self.config.mode {
            AuthMode::JwtOnly => token.map_or(Err(missing), |t| self.verify_jwt(t)),
            AuthMode::ApiKeyOnly => api_key.map_or(Err(missing), |k| self.verify_api_key(k)),
            // JWT wins when both are present.
            AuthMode::Both => match (token, api_key) {
                (Some(t), _) => self.verify_jwt(t),
                (None, Some(k)) => self.verify_api_key(k),
                (None, None) => Err(missing),
            },
            // Loopback-only deployments still accept explicit credentials;
            // the bypass itself is handled at connect time.
            AuthMode::LoopbackBypass => match (token, api_key) {
                (Some(t), _) if self.decoding_key.is_some() => self.verify_jwt(t),
                (_, Some(k)) => self.verify_api_key(k),
                _ => Err(missing),
            },
        }
    }

    fn try_loopback(&self, remote_addr: Option<IpAddr>) -> Option<Identity> {
        if !self.config.allow_loopback {
            return None;
        }
        let addr = remote_addr?;
        if !is_loopback(addr) {
            return None;
        }
        Some(Identity {
            client_id: "loopback".to_string(),
            method: AuthMethod::Loopback,
            scopes: self.config.loopback_scopes.clone(),
            expires_at: None,
        })
    }

    fn verify_jwt(&self, token: &str) -> Result<Identity, AuthError> {
        let key = self
            .decoding_key
            .as_ref()
            .ok_or(AuthError::JwtSignatureInvalid)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        let data = jsonwebtoken::decode::<Claims>(token, key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::JwtExpired,
                _ => AuthError::JwtSignatureInvalid,
            }
        })?;

        let expires_at = Utc
            .timestamp_opt(data.claims.exp, 0)
            .single()
            .unwrap_or_else(Utc::now);

        Ok(Identity {
            client_id: data.claims.sub,
            method: AuthMethod::Jwt,
            scopes: data.claims.scp,
            expires_at: Some(expires_at),
        })
    }

    fn verify_api_key(&self, presented: &str) -> Result<Identity, AuthError> {
        // Constant-time compare against every configured key; no early exit
        // on the first match.
        let mut matched: Option<&parleyconf::ApiKeyEntry> = None;
        for entry in &self.config.api_keys {
            if entry.key.as_bytes().ct_eq(presented.as_bytes()).into() {
                matched = Some(entry);
            }
        }

        let entry = matched.ok_or(AuthError::ApiKeyInvalid)?;
        Ok(Identity {
            client_id: entry.client_id.clone(),
            method: AuthMethod::ApiKey,
            scopes: entry.scopes.clone(),
            expires_at: None,
        })
    }
}

/// Loopback means 127.0.0.1, ::1, or the v4-mapped ::ffff:127.0.0.1.
fn is_loopback(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
    }
}
