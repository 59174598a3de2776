pub mod api;
pub mod assembler;
pub mod bundles;
pub mod chunks;
pub mod config;
pub mod metrics_defs;
pub mod releases;
pub mod status;
pub mod task;
pub mod types;

use api::AppState;
use assembler::Assembler;
use bundles::{BundleStore, FilesystemBundleStore, MemoryBundleStore};
use chunks::{ChunkStore, FilesystemChunkStore, MemoryChunkStore};
use config::{Config, StatusBackend, StatusConfig, StoreConfig, ValidationError};
use releases::{StaticReleaseStore, TokenStore};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use status::{AssembleStatusStore, CacheStatusStore, RedisStatusStore, StatusStoreError};
use std::io;
use std::sync::Arc;
use task::TaskQueue;

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid config: {0}")]
    Config(#[from] ValidationError),

    #[error("status store error: {0}")]
    StatusStore(#[from] StatusStoreError),

    #[error("assemble workers stopped unexpectedly: {0}")]
    Workers(#[from] tokio::task::JoinError),
}

fn chunk_store(config: &StoreConfig) -> Arc<dyn ChunkStore> {
    match config {
        StoreConfig::Filesystem { path } => Arc::new(FilesystemChunkStore::new(path)),
        StoreConfig::Memory => Arc::new(MemoryChunkStore::new()),
    }
}

fn bundle_store(config: &StoreConfig) -> Arc<dyn BundleStore> {
    match config {
        StoreConfig::Filesystem { path } => Arc::new(FilesystemBundleStore::new(path)),
        StoreConfig::Memory => Arc::new(MemoryBundleStore::new()),
    }
}

async fn status_store(config: &StatusConfig) -> Result<Arc<dyn AssembleStatusStore>, ServiceError> {
    Ok(match &config.backend {
        StatusBackend::Memory => {
            tracing::info!("using in-process status store");
            Arc::new(CacheStatusStore::new(config.ttl(), config.max_capacity))
        }
        StatusBackend::Redis { url } => {
            Arc::new(RedisStatusStore::connect(url, config.ttl()).await?)
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

/// Serves the assemble API and the admin endpoints until the process is
/// interrupted, then waits for running assemblies to finish.
pub async fn run(config: Config) -> Result<(), ServiceError> {
    config.validate()?;
    shared::metrics_defs::describe_metrics(metrics_defs::ALL_METRICS);

    let statuses = status_store(&config.status).await?;
    let chunks = chunk_store(&config.chunk_store);
    let bundles = bundle_store(&config.bundle_store);

    let assembler = Arc::new(Assembler::new(
        statuses.clone(),
        chunks.clone(),
        bundles,
        config.limits.max_assemble_size,
    ));

    let (queue, rx) = TaskQueue::channel(config.worker.queue_size);
    let workers = tokio::spawn(task::run_workers(
        assembler,
        rx,
        config.worker.concurrency,
    ));

    // Ready while the worker pool still accepts tasks
    let ready_queue = queue.clone();
    let admin = AdminService::<_, ServiceError>::new(move || !ready_queue.is_closed());

    let state = AppState::new(
        Arc::new(StaticReleaseStore::new(&config.organizations)),
        TokenStore::new(&config.tokens),
        statuses,
        chunks,
        queue,
        config.limits.clone(),
    );

    let api_task = api::serve(&config.listener, state, shutdown_signal());
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin,
    );

    // Both listeners hold a queue sender. Once they are dropped the workers
    // drain the remaining tasks and exit.
    tokio::select! {
        result = api_task => result?,
        result = admin_task => result?,
    }

    tracing::info!("waiting for queued assemble tasks");
    workers.await?;
    Ok(())
}
