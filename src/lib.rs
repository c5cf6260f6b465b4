use std::sync::Arc;

use tracing::info;

pub mod binder;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod globals;
pub mod lifecycle;
pub mod logging;
pub mod model;
pub mod repository;
pub mod sandbox;
pub mod scheduler;
pub mod security;
pub mod server;
pub mod syntax;

pub use cache::{CacheInvalidation, ScriptCache};
pub use config::Config;
pub use dispatch::{Dispatcher, PermissionQuery};
pub use error::{AppError, AppResult};
pub use lifecycle::{SaveReport, ScriptLifecycle};
pub use model::{DocEvent, Document, EventFrequency, ScheduledJobBinding, ScriptRecord, ScriptType};
pub use repository::{DocumentStore, DocumentStoreExt, MemoryStore};
pub use sandbox::{ExecutionLimits, ExecutionOutput, Sandbox};
pub use security::UserContext;

/// Everything a host needs, wired over one document store.
pub struct ScriptService {
    pub config: Config,
    pub store: Arc<dyn DocumentStore>,
    pub cache: Arc<ScriptCache>,
    pub lifecycle: ScriptLifecycle,
    pub dispatcher: Arc<Dispatcher>,
}

impl ScriptService {
    pub fn new(config: Config, store: Arc<dyn DocumentStore>) -> Self {
        let cache = Arc::new(ScriptCache::new(Arc::clone(&store)));
        let validator = syntax::SyntaxValidator::new(config.javascript.max_script_size_bytes);
        let lifecycle = ScriptLifecycle::new(Arc::clone(&store), validator, cache.clone());

        let globals = globals::SafeGlobals::new(config.sandbox.clone(), Arc::clone(&store));
        let sandbox = Sandbox::new(config.javascript.clone().into(), globals);
        let dispatcher = Arc::new(Dispatcher::new(sandbox, Arc::clone(&store), cache.clone()));

        Self {
            config,
            store,
            cache,
            lifecycle,
            dispatcher,
        }
    }

    pub fn in_memory(config: Config) -> Self {
        Self::new(config, Arc::new(MemoryStore::new()))
    }

    pub fn scheduler(&self) -> scheduler::Scheduler {
        scheduler::Scheduler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.dispatcher),
            self.config.scheduler.clone(),
        )
    }
}

/// Serve the HTTP host (and the scheduler worker, when enabled) until
/// `shutdown_rx` fires.
pub async fn start_server_with_config(
    config: Config,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let service = Arc::new(ScriptService::in_memory(config));
    start_server_with_service(service, shutdown_rx).await
}

pub async fn start_server_with_service(
    service: Arc<ScriptService>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = service.config.server_addr();

    let scheduler = if service.config.scheduler.enabled {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = scheduler::spawn_worker(Arc::new(service.scheduler()), rx);
        Some((tx, handle))
    } else {
        info!("Scheduler disabled");
        None
    };

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, server::router(service))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
            info!("shutdown signal received");
        })
        .await?;

    if let Some((tx, handle)) = scheduler {
        let _ = tx.send(());
        handle.await?;
    }
    Ok(())
}
