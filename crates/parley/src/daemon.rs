//! Daemon state: every component, constructed once at startup and passed by
//! parameter. No ambient globals.

use crate::api::registry::MethodRegistry;
use crate::auth::Authenticator;
use crate::federation::FederationClient;
use crate::health::HealthMonitor;
use crate::memory::MemoryStore;
use crate::ratelimit::RateLimiter;
use crate::router::ConnectionRegistry;
use crate::sessions::{AgentBackend, LocalBackend, SessionManager};
use crate::subscriptions::{EventBus, SubscriptionManager};
use crate::trace::Tracer;
use anyhow::{Context, Result};
use parleyconf::ParleyConfig;
use parleyproto::codec::CodecConfig;
use parleyproto::{Compression, TextCodec};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The assembled daemon.
pub struct Daemon {
    pub config: RwLock<ParleyConfig>,
    pub codec: TextCodec,
    pub authenticator: Authenticator,
    pub rate_limiter: RateLimiter,
    pub connections: Arc<ConnectionRegistry>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub bus: EventBus,
    pub sessions: Arc<SessionManager>,
    pub memory: MemoryStore,
    pub health: Arc<HealthMonitor>,
    pub tracer: Arc<Tracer>,
    pub federation: FederationClient,
    pub methods: MethodRegistry,
    pub started_at: Instant,
}

impl Daemon {
    /// Build the daemon with the default local agent backend.
    pub fn new(config: ParleyConfig) -> Result<Arc<Self>> {
        Self::with_backend(config, Arc::new(LocalBackend))
    }

    /// Build the daemon with a specific agent backend (provider adapters,
    /// scripted test backends).
    pub fn with_backend(config: ParleyConfig, backend: Arc<dyn AgentBackend>) -> Result<Arc<Self>> {
        let compression: Compression = config
            .limits
            .compression
            .parse()
            .with_context(|| format!("limits.compression = {:?}", config.limits.compression))?;

        let codec = TextCodec::new(CodecConfig {
            max_message_bytes: config.limits.max_message_bytes,
            max_batch: config.limits.max_batch,
            compression,
            compression_threshold: config.limits.compression_threshold,
        });

        let connections = Arc::new(ConnectionRegistry::new());
        let subscriptions = Arc::new(SubscriptionManager::new());
        let bus = EventBus::new(subscriptions.clone(), connections.clone());

        let health = Arc::new(HealthMonitor::new(config.health.clone()));
        for (node_id, base_url) in &config.health.nodes {
            health.register_node(node_id, base_url);
        }
        let tracer = Arc::new(Tracer::new(config.trace.clone()));
        let federation = FederationClient::new(
            health.clone(),
            tracer.clone(),
            std::time::Duration::from_millis(config.health.probe_timeout_ms),
        );

        Ok(Arc::new(Self {
            codec,
            authenticator: Authenticator::new(config.auth.clone()),
            rate_limiter: RateLimiter::new(config.rate.clone()),
            connections,
            subscriptions: subscriptions.clone(),
            bus: bus.clone(),
            sessions: Arc::new(SessionManager::new(backend, bus)),
            memory: MemoryStore::new(),
            health,
            tracer,
            federation,
            methods: MethodRegistry::new(),
            started_at: Instant::now(),
            config: RwLock::new(config),
        }))
    }

    /// Whether INTERNAL_ERROR responses may carry the original error text.
    pub fn expose_internal_errors(&self) -> bool {
        self.config
            .read()
            .map(|config| config.limits.expose_internal_errors)
            .unwrap_or(false)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
