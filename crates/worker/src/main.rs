use std::sync::Arc;

use scanflow::config::Config;
use scanflow::db;
use scanflow::dispatcher::Dispatcher;
use scanflow::lock::LockManager;
use scanflow::metrics_fetcher::MetricsFetcher;
use scanflow::queue::RedisQueue;
use scanflow::reconciler::Reconciler;
use scanflow::repo_cache::RepoCache;
use scanflow::store::{FailedCommitsRepo, ProjectsRepo, ScanJobsRepo, ScanResultsRepo};
use scanflow::webhook::{self, Notifiers, WebhookState};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Arc::new(Config::from_env()?);

    info!(
        worker_id = %config.worker_id,
        instances = config.instances.len(),
        lease_ttl_seconds = config.lease_ttl_seconds,
        reconciler_interval_seconds = config.reconciler_interval_seconds,
        migrate_on_startup = config.migrate_on_startup,
        admin_addr = config.admin_addr.as_deref().unwrap_or("disabled"),
        "scanflow worker starting"
    );

    let pool = db::make_pool(&config.database_url).await?;
    if config.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let scan_jobs = ScanJobsRepo::new(pool.clone());
    let scan_results = ScanResultsRepo::new(pool.clone());
    let failed_commits = FailedCommitsRepo::new(pool.clone());
    let projects = ProjectsRepo::new(pool.clone());

    let lock = LockManager::new(pool.clone(), config.instances.clone());
    lock.sync_slots().await?;

    let queue = RedisQueue::connect(&config.redis_url).await?;
    let repo_cache = RepoCache::new(config.repo_cache_dir.clone());
    let metrics_fetcher = MetricsFetcher::new(
        std::time::Duration::from_millis(config.metrics_http_timeout_ms),
        config.metrics_chunk_size,
        config.metrics_retry_max,
    )?;

    let notifiers = Notifiers::new();

    let dispatcher = Dispatcher::new(
        scan_jobs.clone(),
        scan_results.clone(),
        failed_commits.clone(),
        projects.clone(),
        queue.clone(),
        lock.clone(),
        repo_cache,
        metrics_fetcher,
        notifiers.clone(),
        config.clone(),
    );

    let reconciler = Reconciler::new(
        scan_jobs.clone(),
        failed_commits.clone(),
        lock.clone(),
        queue.clone(),
        config.clone(),
    );

    let dispatcher_handle = tokio::spawn(dispatcher.run_forever());
    let reconciler_handle = tokio::spawn(reconciler.run_forever());

    let webhook_state = WebhookState {
        scan_jobs,
        webhook_events: scanflow::store::WebhookEventsRepo::new(pool.clone()),
        secret: config.webhook_secret.clone(),
        signature_headers: config.webhook_signature_headers.clone(),
        notifiers,
    };
    let webhook_router = webhook::router(webhook_state);

    let webhook_addr = config.admin_addr.clone().unwrap_or_else(|| "0.0.0.0:8080".to_string());
    let webhook_handle = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&webhook_addr).await?;
        info!(addr = %webhook_addr, "webhook intake listening");
        axum::serve(listener, webhook_router).await?;
        Ok::<(), anyhow::Error>(())
    });

    tokio::select! {
        res = dispatcher_handle => { res?; }
        res = reconciler_handle => { res?; }
        res = webhook_handle => { res??; }
    }

    Ok(())
}
