mod common;

use std::sync::Arc;

use common::{insert_project, insert_scan_job, setup_db};
use serial_test::serial;

use scanflow::config::Config;
use scanflow::lock::LockManager;
use scanflow::queue::RedisQueue;
use scanflow::reconciler::Reconciler;
use scanflow::store::{FailedCommitsRepo, ScanJobsRepo};

fn test_config() -> Config {
    Config {
        database_url: String::new(),
        redis_url: String::new(),
        worker_id: "test-worker".to_string(),
        instances: vec![],
        metrics: vec![],
        metrics_chunk_size: 20,
        metrics_http_timeout_ms: 10_000,
        metrics_retry_max: 5,
        lease_ttl_seconds: 120,
        reconciler_interval_seconds: 30,
        wait_for_webhook_timeout_seconds: 1800,
        scan_timeout_seconds: 600,
        stale_queue_threshold_seconds: 600,
        max_retries: 3,
        retry_backoff_base_ms: 5,
        retry_backoff_cap_ms: 50,
        retry_jitter_ratio: 0.1,
        no_slot_requeue_delay_ms: 50,
        csv_encoding: "utf-8".to_string(),
        ingestion_chunk_size: 500,
        webhook_secret: "test-secret".to_string(),
        webhook_signature_headers: vec!["X-Hub-Signature-256".to_string()],
        admin_addr: None,
        migrate_on_startup: false,
        repo_cache_dir: "./repo-cache-test".to_string(),
        vcs_clone_url_template: "https://example.test/{slug}.git".to_string(),
    }
}

async fn test_queue() -> RedisQueue {
    let url = std::env::var("TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/1".to_string());
    RedisQueue::connect(&url).await.expect("failed to connect to TEST_REDIS_URL")
}

#[tokio::test]
#[serial]
async fn expired_lease_under_budget_requeues_instead_of_going_permanent() {
    let pool = setup_db().await;
    let jobs = ScanJobsRepo::new(pool.clone());
    let failed_commits = FailedCommitsRepo::new(pool.clone());
    let lock = LockManager::new(pool.clone(), vec![]);
    let queue = test_queue().await;
    let reconciler = Reconciler::new(jobs.clone(), failed_commits, lock, queue, Arc::new(test_config()));

    let project_id = insert_project(&pool, "acme/lib").await;
    let job_id = insert_scan_job(&pool, project_id, "acme/lib", "c1", 3).await;
    jobs.mark_queued(job_id).await.unwrap();
    jobs.start_running(job_id, 0, "primary", 120).await.unwrap();

    sqlx::query("UPDATE scan_jobs SET lease_expires_at = now() - interval '1 second' WHERE id = $1")
        .bind(job_id)
        .execute(&pool)
        .await
        .unwrap();

    reconciler.run_once().await.unwrap();

    let job = jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, "queued", "attempts(1) <= max_retries(3) should requeue, not escalate");
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
#[serial]
async fn expired_lease_past_budget_escalates_to_permanent_with_failed_commit() {
    let pool = setup_db().await;
    let jobs = ScanJobsRepo::new(pool.clone());
    let failed_commits = FailedCommitsRepo::new(pool.clone());
    let lock = LockManager::new(pool.clone(), vec![]);
    let queue = test_queue().await;
    let reconciler = Reconciler::new(jobs.clone(), failed_commits, lock, queue, Arc::new(test_config()));

    let project_id = insert_project(&pool, "acme/lib").await;
    let job_id = insert_scan_job(&pool, project_id, "acme/lib", "c1", 0).await;
    jobs.mark_queued(job_id).await.unwrap();
    jobs.start_running(job_id, 0, "primary", 120).await.unwrap();

    sqlx::query("UPDATE scan_jobs SET lease_expires_at = now() - interval '1 second' WHERE id = $1")
        .bind(job_id)
        .execute(&pool)
        .await
        .unwrap();

    reconciler.run_once().await.unwrap();

    let job = jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, "failed_permanent");

    let failed_commit_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM failed_commits WHERE scan_job_id = $1")
            .bind(job_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(failed_commit_count, 1);
}

#[tokio::test]
#[serial]
async fn stale_queued_job_is_re_enqueued_without_changing_state() {
    let pool = setup_db().await;
    let jobs = ScanJobsRepo::new(pool.clone());
    let failed_commits = FailedCommitsRepo::new(pool.clone());
    let lock = LockManager::new(pool.clone(), vec![]);
    let queue = test_queue().await;
    let reconciler = Reconciler::new(jobs.clone(), failed_commits, lock, queue, Arc::new(test_config()));

    let project_id = insert_project(&pool, "acme/lib").await;
    let job_id = insert_scan_job(&pool, project_id, "acme/lib", "c1", 3).await;
    jobs.mark_queued(job_id).await.unwrap();

    sqlx::query("UPDATE scan_jobs SET updated_at = now() - interval '1 hour' WHERE id = $1")
        .bind(job_id)
        .execute(&pool)
        .await
        .unwrap();

    reconciler.run_once().await.unwrap();

    let job = jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, "queued", "re-enqueue must not itself change ScanJob state");
}

#[tokio::test]
#[serial]
async fn backfill_creates_missing_failed_commit_for_permanent_job() {
    let pool = setup_db().await;
    let jobs = ScanJobsRepo::new(pool.clone());
    let failed_commits = FailedCommitsRepo::new(pool.clone());
    let lock = LockManager::new(pool.clone(), vec![]);
    let queue = test_queue().await;
    let reconciler = Reconciler::new(jobs.clone(), failed_commits, lock, queue, Arc::new(test_config()));

    let project_id = insert_project(&pool, "acme/lib").await;
    let job_id = insert_scan_job(&pool, project_id, "acme/lib", "c1", 0).await;
    jobs.mark_queued(job_id).await.unwrap();
    jobs.start_running(job_id, 0, "primary", 120).await.unwrap();

    let mut tx = jobs.begin().await.unwrap();
    jobs.mark_failed_permanent(&mut tx, job_id, "COMMIT_MISSING", "no such commit")
        .await
        .unwrap();
    tx.commit().await.unwrap();

    // Simulate the crash window: ScanJob went permanent but the FailedCommit
    // insert never landed.
    sqlx::query("DELETE FROM failed_commits WHERE scan_job_id = $1")
        .bind(job_id)
        .execute(&pool)
        .await
        .unwrap();

    reconciler.run_once().await.unwrap();

    let failed_commit_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM failed_commits WHERE scan_job_id = $1")
            .bind(job_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(failed_commit_count, 1);

    // Running it again must not duplicate the backfilled row.
    reconciler.run_once().await.unwrap();
    let failed_commit_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM failed_commits WHERE scan_job_id = $1")
            .bind(job_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(failed_commit_count, 1);
}
