// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Worker host for the care-plan pipeline: wires configuration, Postgres,
//! Redis, the orchestrator, both worker pools, and the background sweepers,
//! then runs until a shutdown signal drains the pools.
//!
//! The ML client factory wired here is the offline stand-in; hosts that
//! integrate real services embed this crate as a library and supply their
//! own factory to the orchestrator builder.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use careplan_pipeline::application::services::{
    GenerationJobHandler, OrchestratorSettings, PipelineOrchestrator,
};
use careplan_pipeline::application::services::job_handlers::PdfImportJobHandler;
use careplan_pipeline::application::use_cases::RetryDeadLetter;
use careplan_pipeline::infrastructure::adapters::{
    AeadEncryption, OfflineMlClients, RedisCancellationFlags, RedisFlagStore, RedisJobQueue, RedisLock,
    RedisProgressBus,
};
use careplan_pipeline::infrastructure::config::PipelineConfig;
use careplan_pipeline::infrastructure::logging::TracingAuditService;
use careplan_pipeline::infrastructure::metrics::MetricsService;
use careplan_pipeline::infrastructure::repositories::{
    schema, PostgresDeadLetterQueue, PostgresIdempotencyStore, PostgresRequestTracker,
};
use careplan_pipeline::infrastructure::runtime::stage_executor::StagePolicy;
use careplan_pipeline::infrastructure::runtime::worker::{RedisTokenBucket, WorkerPool};
use careplan_pipeline::infrastructure::services::{CacheSettings, DegradationManager, RedisPipelineCache};
use careplan_pipeline_bootstrap::logger::init_tracing;
use careplan_pipeline_bootstrap::shutdown::ShutdownCoordinator;
use careplan_pipeline_bootstrap::{signals, ExitCode};
use careplan_pipeline_domain::repositories::{
    DeadLetterRepository, IdempotencyRepository, RequestRepository,
};
use careplan_pipeline_domain::services::{
    AuditService, EncryptionService, JobQueueService, MlClientFactory, QueueName,
};

#[derive(Parser)]
#[command(name = "careplan_pipeline", about = "Care-plan pipeline worker host", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker pools and background sweepers (default).
    Serve,
    /// Print 24-hour request stats and queue depths.
    Stats,
    /// Re-enqueue a dead-letter entry by id.
    RetryDlq { entry_id: uuid::Uuid },
    /// Sweep expired idempotency keys and stale requests once.
    Sweep,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let exit = match run(cli).await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "fatal");
            ExitCode::Error
        }
    };
    exit.exit();
}

/// Everything the commands need, wired once.
struct Host {
    config: PipelineConfig,
    requests: Arc<dyn RequestRepository>,
    idempotency: Arc<dyn IdempotencyRepository>,
    dead_letters: Arc<dyn DeadLetterRepository>,
    queue: Arc<RedisJobQueue>,
    encryption: Arc<dyn EncryptionService>,
    redis_client: redis::Client,
    redis_conn: redis::aio::ConnectionManager,
    metrics: Arc<MetricsService>,
}

async fn wire(config: PipelineConfig) -> Result<Host> {
    let pool = schema::initialize_database(&config.database_url, config.database_max_connections)
        .await
        .context("database initialization failed")?;

    let redis_client = redis::Client::open(config.redis_url.clone()).context("invalid redis url")?;
    let redis_conn = redis_client
        .get_connection_manager()
        .await
        .context("redis connection failed")?;

    let encryption: Arc<dyn EncryptionService> = Arc::new(AeadEncryption::new(
        config.encryption_key()?,
        config.encryption_algorithm,
    ));

    let requests: Arc<dyn RequestRepository> =
        Arc::new(PostgresRequestTracker::new(pool.clone(), Arc::clone(&encryption)));
    let idempotency: Arc<dyn IdempotencyRepository> = Arc::new(PostgresIdempotencyStore::new(
        pool.clone(),
        config.idempotency_expiration_hours,
    ));
    let dead_letters: Arc<dyn DeadLetterRepository> = Arc::new(PostgresDeadLetterQueue::new(pool));
    let queue = Arc::new(RedisJobQueue::new(redis_conn.clone(), Arc::clone(&encryption)));
    queue.ensure_group(QueueName::Generation).await?;
    queue.ensure_group(QueueName::PdfImport).await?;

    Ok(Host {
        metrics: Arc::new(MetricsService::new()?),
        config,
        requests,
        idempotency,
        dead_letters,
        queue,
        encryption,
        redis_client,
        redis_conn,
    })
}

async fn run(cli: Cli) -> Result<()> {
    let config = PipelineConfig::load(cli.config.as_deref()).context("configuration error")?;
    let host = wire(config).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(host).await,
        Command::Stats => stats(host).await,
        Command::RetryDlq { entry_id } => retry_dlq(host, entry_id).await,
        Command::Sweep => sweep(host).await,
    }
}

async fn serve(host: Host) -> Result<()> {
    let coordinator = ShutdownCoordinator::default();
    let shutdown = coordinator.token();
    tokio::spawn(signals::wait_for_shutdown_signal(coordinator.token()));

    let config = &host.config;
    let flag_store = Arc::new(RedisFlagStore::new(host.redis_conn.clone()));
    let degradation = Arc::new(DegradationManager::new(flag_store));
    degradation.refresh_from_store().await.ok();
    degradation.spawn_refresher(config.flag_refresh_interval(), shutdown.clone());

    let cache = Arc::new(RedisPipelineCache::new(
        host.redis_conn.clone(),
        Arc::clone(&host.encryption),
        CacheSettings {
            default_ttl_secs: config.cache_default_ttl_secs,
            phi_ttl_secs: config.cache_phi_max_ttl_secs,
            refresh_beta: config.cache_refresh_beta,
        },
    ));
    let locks = Arc::new(RedisLock::new(host.redis_conn.clone()));
    let progress = Arc::new(RedisProgressBus::new(
        host.redis_client.clone(),
        host.redis_conn.clone(),
        config.subscription_idle_timeout(),
    ));
    let cancellations = Arc::new(RedisCancellationFlags::new(host.redis_conn.clone()));
    let audit: Arc<dyn AuditService> = Arc::new(TracingAuditService);
    let clients = Arc::new(OfflineMlClients);

    let orchestrator = Arc::new(
        PipelineOrchestrator::builder()
            .settings(OrchestratorSettings {
                stage_policy: StagePolicy {
                    timeout: config.stage_timeout(),
                    max_retries: config.max_retries,
                    backoff_base: config.backoff_base(),
                    backoff_cap: config.backoff_cap(),
                },
                lock_ttl: config.lock_ttl(),
                lock_wait_interval: Duration::from_millis(250),
                lock_wait_budget: 240,
                enable_idempotency: config.enable_idempotency,
                enable_caching: config.enable_caching,
            })
            .clients(clients.clone())
            .cache(cache)
            .idempotency(Arc::clone(&host.idempotency))
            .requests(Arc::clone(&host.requests))
            .locks(locks)
            .progress(progress)
            .audit(audit.clone())
            .degradation(Arc::clone(&degradation))
            .encryption(Arc::clone(&host.encryption))
            .metrics(Arc::clone(&host.metrics))
            .cancellations(cancellations)
            .shutdown(shutdown.clone())
            .build()?,
    );

    let generation_pool = Arc::new(WorkerPool {
        queue_name: QueueName::Generation,
        concurrency: config.worker_generation_concurrency,
        queue: host.queue.clone() as Arc<dyn JobQueueService>,
        handler: Arc::new(GenerationJobHandler::new(Arc::clone(&orchestrator))),
        requests: Arc::clone(&host.requests),
        dead_letters: Arc::clone(&host.dead_letters),
        audit: audit.clone(),
        encryption: Arc::clone(&host.encryption),
        rate_limiter: Some(Arc::new(RedisTokenBucket::new(
            host.redis_conn.clone(),
            "generation",
            config.rate_limit_per_sec,
        ))),
        backoff_base: config.backoff_base(),
        backoff_cap: config.backoff_cap(),
        shutdown: shutdown.clone(),
    });

    let pdf_pool = Arc::new(WorkerPool {
        queue_name: QueueName::PdfImport,
        concurrency: config.worker_pdf_concurrency,
        queue: host.queue.clone() as Arc<dyn JobQueueService>,
        handler: Arc::new(PdfImportJobHandler::new(
            clients.pdf_parser(),
            Arc::clone(&host.requests),
            Arc::clone(&host.encryption),
        )),
        requests: Arc::clone(&host.requests),
        dead_letters: Arc::clone(&host.dead_letters),
        audit,
        encryption: Arc::clone(&host.encryption),
        rate_limiter: None,
        backoff_base: config.backoff_base(),
        backoff_cap: config.backoff_cap(),
        shutdown: shutdown.clone(),
    });

    let mut handles = generation_pool.spawn();
    handles.extend(pdf_pool.spawn());

    spawn_sweepers(&host, shutdown.clone());
    spawn_health_probe(clients, degradation, shutdown.clone());

    info!(
        generation = host.config.worker_generation_concurrency,
        pdf = host.config.worker_pdf_concurrency,
        "worker host running"
    );

    for handle in handles {
        let _ = handle.await;
    }
    info!("worker host stopped");
    Ok(())
}

/// Feeds the degradation manager from the factory's aggregated health
/// checks so circuit state converges even when no requests are flowing.
fn spawn_health_probe(
    clients: Arc<OfflineMlClients>,
    degradation: Arc<DegradationManager>,
    shutdown: careplan_pipeline_bootstrap::CancellationToken,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let report = clients.check_all_services().await;
                    for status in &report.services {
                        let degraded = report.degraded_services.contains(&status.service);
                        degradation.record_call_outcome(status.service, !degraded);
                    }
                }
            }
        }
    });
}

/// Periodic maintenance: request expiry, idempotency sweep, depth gauges.
fn spawn_sweepers(host: &Host, shutdown: careplan_pipeline_bootstrap::CancellationToken) {
    let requests = Arc::clone(&host.requests);
    let idempotency = Arc::clone(&host.idempotency);
    let dead_letters = Arc::clone(&host.dead_letters);
    let queue = host.queue.clone();
    let metrics = Arc::clone(&host.metrics);

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(300));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    match requests.expire_stale(Duration::from_secs(60 * 60)).await {
                        Ok(n) if n > 0 => info!(expired = n, "stale requests expired"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "request expiry sweep failed"),
                    }
                    match requests.clean_old(Duration::from_secs(30 * 24 * 60 * 60)).await {
                        Ok(n) if n > 0 => info!(deleted = n, "old requests cleaned"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "request cleanup failed"),
                    }
                    match idempotency.sweep_expired().await {
                        Ok(n) if n > 0 => info!(swept = n, "expired idempotency keys removed"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "idempotency sweep failed"),
                    }
                    match idempotency.find_stale_pending(Duration::from_secs(15 * 60)).await {
                        Ok(stale) if !stale.is_empty() => {
                            warn!(count = stale.len(), "stale PENDING idempotency keys need operator attention");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "stale pending scan failed"),
                    }
                    if let Ok(depth) = queue.depth(QueueName::Generation).await {
                        metrics.set_queue_depth("generation", depth);
                    }
                    if let Ok(depth) = queue.depth(QueueName::PdfImport).await {
                        metrics.set_queue_depth("pdf-import", depth);
                    }
                    if let Ok(depth) = dead_letters.depth().await {
                        metrics.set_dlq_depth(depth);
                    }
                }
            }
        }
    });
}

async fn stats(host: Host) -> Result<()> {
    let stats = host.requests.stats().await?;
    let generation_depth = host.queue.depth(QueueName::Generation).await?;
    let pdf_depth = host.queue.depth(QueueName::PdfImport).await?;
    let dlq_depth = host.dead_letters.depth().await?;

    println!("requests (24h): {}", stats.total);
    println!("  pending:      {}", stats.pending);
    println!("  in progress:  {}", stats.in_progress);
    println!("  completed:    {}", stats.completed);
    println!("  failed:       {}", stats.failed);
    println!("  expired:      {}", stats.expired);
    if let Some(avg) = stats.avg_completed_duration_ms {
        println!("  avg duration: {:.0} ms", avg);
    }
    println!("queue depth (generation): {}", generation_depth);
    println!("queue depth (pdf-import): {}", pdf_depth);
    println!("dead letters (unresolved): {}", dlq_depth);
    Ok(())
}

async fn retry_dlq(host: Host, entry_id: uuid::Uuid) -> Result<()> {
    let retry = RetryDeadLetter::new(
        Arc::clone(&host.dead_letters),
        host.queue.clone() as Arc<dyn JobQueueService>,
        Arc::clone(&host.encryption),
    );
    if retry.execute(entry_id).await? {
        println!("re-enqueued dead letter {}", entry_id);
    } else {
        println!("dead letter {} not found or already resolved", entry_id);
    }
    Ok(())
}

async fn sweep(host: Host) -> Result<()> {
    let expired = host.requests.expire_stale(Duration::from_secs(60 * 60)).await?;
    let swept = host.idempotency.sweep_expired().await?;
    println!("expired {} stale requests, removed {} idempotency keys", expired, swept);
    Ok(())
}
