//! Flowline worker runtime: the composition root that wires stores,
//! migrations, the queue engine, the worker loop, and the health HTTP
//! adapter, then runs until a stop signal drains it.

#![forbid(unsafe_code)]

mod http;
mod worker_config;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use flowline_application::{
    Event, EventComponent, EventLevel, EventSink, HealthService, QueueEngine, RecordHandler,
    WorkerLoop, WorkerMetrics,
};
use flowline_core::{CoreError, CoreResult, InstanceId};
use flowline_infrastructure::{
    MigrationRunner, PostgresQueueRepository, StderrEventSink, StoreAccess, StoreName,
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::worker_config::WorkerAppConfig;

/// Process-level failures outside the core taxonomy, such as a busy
/// listen address.
#[derive(Debug, thiserror::Error)]
enum WorkerError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("{0}")]
    Startup(String),
}

impl WorkerError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Core(error) => error.exit_code(),
            Self::Startup(_) => 1,
        }
    }
}

/// Reference handler: completes records with their payload unchanged.
/// A worker family embeds the flowline crates and passes its own
/// [`RecordHandler`] in place of this one.
struct PassthroughHandler;

#[async_trait::async_trait]
impl RecordHandler for PassthroughHandler {
    async fn handle(&self, _payload: Value) -> CoreResult<Option<Value>> {
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    worker_config::init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            StderrEventSink::new().emit(
                Event::new(EventComponent::Worker, "fatal_error")
                    .level(EventLevel::Error)
                    .field("error", failure.to_string()),
            );
            error!(error = %failure, "flowline-worker terminated");
            ExitCode::from(failure.exit_code())
        }
    }
}

async fn run() -> Result<(), WorkerError> {
    let command = std::env::args().nth(1);
    let config = WorkerAppConfig::load()?;

    let events: Arc<dyn EventSink> = Arc::new(StderrEventSink::new());
    let stores = Arc::new(StoreAccess::connect(&config.core).await?);

    MigrationRunner::new(stores.clone(), events.clone())
        .migrate(StoreName::Queue)
        .await?;
    if command.as_deref() == Some("migrate") {
        info!("database migrations applied successfully");
        return Ok(());
    }

    stores.verify_claim_support().await?;

    let repository = Arc::new(PostgresQueueRepository::new(stores.clone()));
    let engine = QueueEngine::new(repository.clone(), events.clone());
    let metrics = Arc::new(WorkerMetrics::new());
    let health = Arc::new(HealthService::new(
        repository,
        stores,
        metrics.clone(),
        config.core.health.clone(),
        config.core.worker.orphan_timeout,
    ));

    let instance_id = InstanceId::generate(host_token().as_str())?;
    info!(
        flow = %config.core.worker.flow_name,
        instance_id = %instance_id,
        "flowline-worker starting"
    );

    let (worker, shutdown) = WorkerLoop::new(
        engine,
        events,
        metrics.clone(),
        config.core.worker.clone(),
        instance_id,
    );

    let address = config.socket_address()?;
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .map_err(|bind_error| {
            WorkerError::Startup(format!("failed to bind {address}: {bind_error}"))
        })?;
    info!(%address, "health endpoints listening");

    let router = http::build_router(http::HttpState {
        health,
        metrics,
        started_at: Instant::now(),
    });
    tokio::spawn(async move {
        if let Err(serve_error) = axum::serve(listener, router).await {
            warn!(error = %serve_error, "health endpoint server stopped");
        }
    });

    let worker = Arc::new(worker);
    let mut worker_task: JoinHandle<CoreResult<()>> = tokio::spawn({
        let worker = worker.clone();
        async move {
            let handler: Arc<dyn RecordHandler> = Arc::new(PassthroughHandler);
            worker.run(handler).await
        }
    });

    tokio::select! {
        _ = shutdown_signal() => {
            info!("stop signal received; draining worker");
            shutdown.shutdown();
            log_worker_exit(worker_task.await);
        }
        joined = &mut worker_task => {
            log_worker_exit(joined);
        }
    }

    Ok(())
}

fn log_worker_exit(joined: Result<CoreResult<()>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => info!("worker loop drained"),
        Ok(Err(loop_error)) => error!(error = %loop_error, "worker loop returned an error"),
        Err(join_error) => error!(error = %join_error, "worker loop task failed"),
    }
}

fn host_token() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| format!("worker-{}", std::process::id()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(signal_error) = tokio::signal::ctrl_c().await {
            warn!(error = %signal_error, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(signal_error) => {
                warn!(error = %signal_error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
