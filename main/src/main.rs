use std::sync::Arc;
use std::time::Duration;

use api_router::{api_routes, api_state::ApiState};
use common::{
    storage::{cache::CacheStore, db::SurrealDbClient, indexes::ensure_runtime_indexes},
    utils::{
        config::{get_config, AppConfig, EmbeddingBackend},
        embedding::EmbeddingClient,
        rerank::HttpReranker,
        triage::{HeuristicTriage, LlmTriage, TriageClassifier},
    },
};
use enrichment_pipeline::{
    run_maintenance_loop, run_worker_pool, DefaultEnrichmentServices, EnrichmentPipeline,
    WorkerPoolConfig,
};
use memory_router::{DefaultRouterServices, MemoryRouter};
use resilience::{
    BudgetLimits, DlqProcessor, DlqProcessorConfig, RetryAnalyzer, RetryBudgetManager,
    RetryExecutor,
};
use task_state::{ReconcileStrategy, StateReconciler, TaskManager};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const TRIAGE_MODEL: &str = "gpt-4o-mini";
const ENRICHMENT_MODEL: &str = "gpt-4o-mini";
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(300);
const REPAIR_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
const REPAIR_SWEEP_MIN_AGE_SECS: i64 = 300;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = match get_config() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration is invalid");
            std::process::exit(1);
        }
    };

    if matches!(config.embedding_backend, EmbeddingBackend::Openai)
        && config.openai_api_key.trim().is_empty()
    {
        error!("openai embedding backend requires OPENAI_API_KEY");
        std::process::exit(1);
    }

    if let Err(err) = run(config).await {
        error!(error = %err, "fatal initialization failure");
        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    // Stores first: a missing critical store is a startup failure.
    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized().await?;
    ensure_runtime_indexes(&db, config.embedding_dimension).await?;

    let cache = CacheStore::new((*db).clone());

    let openai_client = Arc::new(async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    ));

    let embedder = Arc::new(EmbeddingClient::from_config(
        &config,
        Some(Arc::clone(&openai_client)),
    )?);
    info!(
        embedding_backend = ?config.embedding_backend,
        embedding_dimension = embedder.dimension(),
        "embedding client initialized"
    );

    let reranker = HttpReranker::maybe_from_config(&config)?;
    if reranker.is_some() {
        info!("rerank capability enabled");
    }

    let triage: Arc<dyn TriageClassifier> = match config.embedding_backend {
        EmbeddingBackend::Openai => Arc::new(LlmTriage::new(
            Arc::clone(&openai_client),
            TRIAGE_MODEL.to_string(),
        )),
        EmbeddingBackend::Hashed => Arc::new(HeuristicTriage),
    };

    // Retry subsystem in dependency order: analyzer, budget, executor.
    let analyzer = Arc::new(RetryAnalyzer::new(Arc::clone(&db)));
    let budget = Arc::new(RetryBudgetManager::new(
        Arc::clone(&db),
        cache.clone(),
        BudgetLimits {
            max_attempts: config.retry_max_attempts,
            max_duration: Duration::from_secs(config.retry_max_duration_secs),
        },
    ));
    let retry = Arc::new(RetryExecutor::new(
        Arc::clone(&analyzer),
        Arc::clone(&budget),
        cache.clone(),
    ));

    let tasks = Arc::new(TaskManager::new(Arc::clone(&db), cache.clone()));
    let reconciler = Arc::new(StateReconciler::new(match config.reconcile_strategy {
        common::utils::config::ReconcileStrategyKind::RepositoryFirst => {
            ReconcileStrategy::RepositoryFirst
        }
        common::utils::config::ReconcileStrategyKind::MemoryFirst => {
            ReconcileStrategy::MemoryFirst
        }
        common::utils::config::ReconcileStrategyKind::VersionBased => {
            ReconcileStrategy::VersionBased
        }
        common::utils::config::ReconcileStrategyKind::StatusBased => {
            ReconcileStrategy::StatusBased
        }
    }));

    let dlq = Arc::new(DlqProcessor::new(
        Arc::clone(&db),
        cache.clone(),
        Arc::clone(&tasks),
        DlqProcessorConfig {
            poll_interval: Duration::from_secs(config.dlq_poll_secs),
            batch_size: config.dlq_batch_size,
            transient_patterns: config.dlq_transient_patterns.clone(),
            auto_retry: config.dlq_auto_retry,
            archive_after_days: config.dlq_archive_after_days,
        },
    ));

    let router_services = Arc::new(DefaultRouterServices::new(
        Arc::clone(&db),
        cache.clone(),
        Arc::clone(&embedder),
        Arc::clone(&triage),
        config.queue_pressure_threshold,
    ));
    let memory_router = Arc::new(MemoryRouter::new(router_services));

    let enrichment_services = Arc::new(DefaultEnrichmentServices::new(
        Arc::clone(&openai_client),
        ENRICHMENT_MODEL.to_string(),
        Arc::clone(&embedder),
    ));
    let enrichment = Arc::new(EnrichmentPipeline::new(
        Arc::clone(&db),
        cache.clone(),
        enrichment_services,
        enrichment_pipeline::pipeline::EnrichmentTuning {
            max_attempts: config.job_max_attempts,
            retry_base_delay_secs: config.job_backoff_base_secs,
            ..Default::default()
        },
    ));

    let shutdown = CancellationToken::new();

    // Background loops: worker pool, queue maintenance, repair sweeper, DLQ
    // processor.
    let worker_handle = tokio::spawn(run_worker_pool(
        Arc::clone(&db),
        cache.clone(),
        enrichment,
        WorkerPoolConfig {
            concurrency: config.worker_concurrency,
            rate_per_sec: config.worker_rate_per_sec,
            lease: Duration::from_secs(config.job_lease_secs),
            ..WorkerPoolConfig::default()
        },
        shutdown.clone(),
    ));

    let maintenance_handle = tokio::spawn(run_maintenance_loop(
        Arc::clone(&db),
        cache.clone(),
        config.completed_retention_secs,
        config.failed_retention_secs,
        MAINTENANCE_INTERVAL,
        shutdown.clone(),
    ));

    let repair_db = Arc::clone(&db);
    let repair_shutdown = shutdown.clone();
    let repair_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = repair_shutdown.cancelled() => break,
                () = tokio::time::sleep(REPAIR_SWEEP_INTERVAL) => {}
            }
            if let Err(err) =
                memory_router::repair_pending_enrichment(&repair_db, REPAIR_SWEEP_MIN_AGE_SECS)
                    .await
            {
                error!(error = %err, "enrichment repair sweep failed");
            }
        }
    });

    let dlq_runner = Arc::clone(&dlq);
    let dlq_shutdown = shutdown.clone();
    let dlq_handle = tokio::spawn(async move {
        dlq_runner.run(dlq_shutdown).await;
    });

    let state = ApiState {
        db,
        cache,
        config: config.clone(),
        memory_router,
        embedder,
        reranker,
        tasks,
        reconciler,
        dlq,
        retry,
    };
    let app = api_routes(state);

    let serve_address = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&serve_address).await?;
    info!("listening on {serve_address}");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_termination().await;
            info!("termination signal received; draining");
            server_shutdown.cancel();
        })
        .await?;

    // Drain the background loops before reporting a clean exit.
    shutdown.cancel();
    let _ = worker_handle.await;
    let _ = maintenance_handle.await;
    let _ = repair_handle.await;
    let _ = dlq_handle.await;

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_termination() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
