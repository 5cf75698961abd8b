// ============================
// crowdpulse-backend-lib/src/lib.rs
// ============================
//! Core backend-lib functionality for the `CrowdPulse` live session server.

pub mod code_gen;
pub mod config;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod rate_limit;
pub mod session;
pub mod storage;
pub mod validation;
pub mod websocket;
pub mod ws_router;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::code_gen::CodeGenerator;
use crate::config::Settings;
use crate::rate_limit::RateLimiter;
use crate::session::SessionRegistry;
use crate::storage::{FlatFileStorage, Storage};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Live sessions
    pub registry: Arc<SessionRegistry>,
    /// Rate limiter
    pub rate_limiter: Arc<RateLimiter>,
    /// Settings
    pub settings: Arc<Settings>,
    /// Storage backend
    pub storage: Arc<dyn Storage>,
}

impl AppState {
    /// Create a new application state
    pub fn new(storage: Arc<dyn Storage>, settings: Settings) -> Self {
        let generator = CodeGenerator::new(
            settings.session.code_length,
            settings.session.max_code_attempts,
        );
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&storage), generator));
        let rate_limiter = Arc::new(RateLimiter::from_settings(&settings.rate_limit));

        Self {
            registry,
            rate_limiter,
            settings: Arc::new(settings),
            storage,
        }
    }

    /// Create a new application state backed by flat files under `data_dir`
    pub fn with_flat_files(settings: Settings) -> anyhow::Result<Self> {
        let storage = FlatFileStorage::new(&settings.data_dir)?;
        Ok(Self::new(Arc::new(storage), settings))
    }
}

/// Spawn the idle sweep and rate-limiter cleanup loops
pub fn spawn_background_tasks(state: &AppState) -> Vec<JoinHandle<()>> {
    let registry = Arc::clone(&state.registry);
    let session_settings = state.settings.session.clone();
    let sweep = tokio::spawn(async move {
        let mut ticker = interval(session_settings.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = registry.sweep(session_settings.idle_timeout()).await;
            let purged = registry.purge_archive(session_settings.archive_retention());
            debug!(evicted, purged, "session maintenance tick");
        }
    });

    let limiter = Arc::clone(&state.rate_limiter);
    let cleanup_every =
        Duration::from_secs(state.settings.rate_limit.cleanup_interval_secs.max(1));
    let cleanup = tokio::spawn(async move {
        let mut ticker = interval(cleanup_every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            limiter.cleanup();
        }
    });

    info!("background maintenance tasks started");
    vec![sweep, cleanup]
}
