pub mod admission;
pub mod api;
pub mod auth;
pub mod budget;
pub mod cache;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod limits;
pub mod providers;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use tokio::task::JoinHandle;

use crate::admission::Admission;
use crate::auth::keys::hash_token;
use crate::auth::projects::{ProjectDefaults, ProjectRegistry};
use crate::budget::BudgetGuard;
use crate::cache::ResponseCache;
use crate::config::{Config, StoreBackend};
use crate::db::Database;
use crate::dispatch::{Dispatcher, Executor, spawn_dispatcher};
use crate::ledger::Ledger;
use crate::limits::RateLimiter;
use crate::providers::AdapterSet;
use crate::providers::cost::CostCalculator;
use crate::providers::retry::RetryPolicy;
use crate::providers::rotation::KeyRotation;
use crate::providers::router::ProviderRouter;
use crate::store::{Counters, KvStore, MemoryKvStore, SqliteKvStore};

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub store: Arc<dyn KvStore>,
    pub admission: Arc<Admission>,
    pub projects: ProjectRegistry,
    pub rotation: Arc<KeyRotation>,
    pub ledger: Ledger,
    pub cache: Arc<ResponseCache>,
    pub budget: Arc<BudgetGuard>,
    /// SHA-256 of the configured admin token; `None` disables `/admin`.
    pub admin_token_hash: Option<String>,
}

impl AppState {
    /// Wire every component from configuration and spawn the dispatcher.
    ///
    /// Must be called inside a Tokio runtime. The returned handle completes
    /// once every clone of the state has been dropped and the dispatch queue
    /// has drained.
    pub fn build(config: Config, db: Database) -> anyhow::Result<(Self, JoinHandle<()>)> {
        let store: Arc<dyn KvStore> = match config.store.backend {
            StoreBackend::Sqlite => Arc::new(SqliteKvStore::new(db.clone())),
            StoreBackend::Memory => Arc::new(MemoryKvStore::new()),
        };
        let counters = Counters::new(store.clone(), config.store.counter_policy);

        let projects = ProjectRegistry::new(db.clone(), ProjectDefaults::from_config(&config));
        let rotation = Arc::new(KeyRotation::new(
            db.clone(),
            counters.clone(),
            config.rotation.strategy,
        ));
        let ledger = Ledger::new(db.clone());
        let cache = Arc::new(ResponseCache::new(store.clone(), &config.cache));
        let budget = Arc::new(BudgetGuard::new(db.clone(), &config.budget));

        let executor = Arc::new(Executor {
            router: ProviderRouter::from_config(&config.providers.routing)?,
            rotation: rotation.clone(),
            adapters: AdapterSet::from_config(&config.providers)?,
            costs: CostCalculator::from_config(
                &config.pricing,
                config.providers.audio.price_per_minute,
            ),
            ledger: ledger.clone(),
            cache: cache.clone(),
            budget: budget.clone(),
            retry: RetryPolicy::from_config(&config.retry),
            log_content: config.logging.log_content,
        });

        let (dispatcher, rx) = Dispatcher::channel(config.dispatch.queue_capacity);
        let dispatch_handle = spawn_dispatcher(executor.clone(), rx, config.dispatch.concurrency);

        let admission = Arc::new(Admission {
            projects: projects.clone(),
            limiter: RateLimiter::new(counters),
            budget: budget.clone(),
            cache: cache.clone(),
            ledger: ledger.clone(),
            rotation: rotation.clone(),
            dispatcher,
            executor,
            per_project_rotation: config.rotation.per_project,
            audio_model: config.providers.audio.model.clone(),
            audio_model_patterns: config.providers.audio.model_patterns.clone(),
        });

        let admin_token_hash = config
            .auth
            .admin_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(hash_token);

        let state = Self {
            config: Arc::new(config),
            db,
            store,
            admission,
            projects,
            rotation,
            ledger,
            cache,
            budget,
            admin_token_hash,
        };
        Ok((state, dispatch_handle))
    }

    /// Purge loop for expired cache entries and rate-limit buckets.
    pub fn spawn_purge_task(&self) -> JoinHandle<()> {
        store::spawn_purge_task(
            self.store.clone(),
            Duration::from_secs(self.config.cache.purge_interval_secs),
        )
    }
}

/// The API router with body limits applied and state attached. Outer layers
/// (tracing, request ids, CORS) are added by the binary.
pub fn build_router(state: AppState) -> Router {
    let max_body = state.config.server.max_body_bytes;
    api::build_api_router(&state)
        .layer(DefaultBodyLimit::max(max_body))
        .with_state(state)
}
