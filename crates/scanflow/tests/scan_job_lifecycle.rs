mod common;

use serial_test::serial;

use common::{insert_project, insert_scan_job, setup_db};

use scanflow::store::scan_jobs::WriteOutcome;
use scanflow::store::ScanJobsRepo;

#[tokio::test]
#[serial]
async fn pending_to_queued_to_running_happy_path() {
    let pool = setup_db().await;
    let jobs = ScanJobsRepo::new(pool.clone());

    let project_id = insert_project(&pool, "acme/lib").await;
    let job_id = insert_scan_job(&pool, project_id, "acme/lib", "c1", 3).await;

    let job = jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, "pending");
    assert_eq!(job.attempts, 0);

    assert_eq!(jobs.mark_queued(job_id).await.unwrap(), WriteOutcome::Applied);

    let job = jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, "queued");

    assert_eq!(
        jobs.start_running(job_id, 0, "primary", 120).await.unwrap(),
        WriteOutcome::Applied
    );

    let job = jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, "running");
    assert_eq!(job.attempts, 1);
    assert_eq!(job.lease_instance.as_deref(), Some("primary"));
    assert!(job.lease_expires_at.is_some());

    jobs.record_submission_id(job_id, "analysis-42").await.unwrap();
    let job = jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.lease_analysis_id.as_deref(), Some("analysis-42"));

    assert_eq!(jobs.mark_succeeded(job_id).await.unwrap(), WriteOutcome::Applied);

    let job = jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, "succeeded");
    assert!(job.lease_instance.is_none());
    assert!(job.lease_expires_at.is_none());
}

#[tokio::test]
#[serial]
async fn duplicate_dispatch_of_same_message_is_a_conflict_not_a_double_start() {
    // Two concurrent consumers pick up the same redelivered message and
    // both try QUEUED -> RUNNING for the same expected attempts count;
    // only the first should move the row.
    let pool = setup_db().await;
    let jobs = ScanJobsRepo::new(pool.clone());

    let project_id = insert_project(&pool, "acme/lib").await;
    let job_id = insert_scan_job(&pool, project_id, "acme/lib", "c1", 3).await;
    jobs.mark_queued(job_id).await.unwrap();

    let first = jobs.start_running(job_id, 0, "primary", 120).await.unwrap();
    let second = jobs.start_running(job_id, 0, "secondary", 120).await.unwrap();

    assert_eq!(first, WriteOutcome::Applied);
    assert_eq!(second, WriteOutcome::Conflict);

    let job = jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1, "attempts must not double-increment");
    assert_eq!(job.lease_instance.as_deref(), Some("primary"));
}

#[tokio::test]
#[serial]
async fn failed_temp_requeues_until_max_retries_then_goes_permanent() {
    let pool = setup_db().await;
    let jobs = ScanJobsRepo::new(pool.clone());

    let project_id = insert_project(&pool, "acme/lib").await;
    let job_id = insert_scan_job(&pool, project_id, "acme/lib", "c1", 1).await;
    jobs.mark_queued(job_id).await.unwrap();
    jobs.start_running(job_id, 0, "primary", 120).await.unwrap();

    // Attempt 1 fails transiently: attempts(1) <= max_retries(1), so it
    // should requeue rather than going permanent.
    assert_eq!(
        jobs.mark_failed_temp(job_id, "CHECKOUT_IO", "network blip").await.unwrap(),
        WriteOutcome::Applied
    );
    let job = jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, "failed_temp");
    assert_eq!(job.attempts, 1);

    assert_eq!(jobs.requeue_after_failure(job_id).await.unwrap(), WriteOutcome::Applied);
    jobs.start_running(job_id, 1, "primary", 120).await.unwrap();

    // Attempt 2 fails transiently again: attempts(2) > max_retries(1), so
    // the caller (Dispatcher/Reconciler) must escalate to permanent.
    jobs.mark_failed_temp(job_id, "CHECKOUT_IO", "network blip again").await.unwrap();
    let job = jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    assert!(job.attempts > job.max_retries);

    let mut tx = jobs.begin().await.unwrap();
    let outcome = jobs
        .mark_failed_permanent(&mut tx, job_id, "CHECKOUT_IO", "retries exhausted")
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(outcome, WriteOutcome::Applied);
    let job = jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, "failed_permanent");
}

#[tokio::test]
#[serial]
async fn operator_retry_resets_attempts_and_requeues() {
    let pool = setup_db().await;
    let jobs = ScanJobsRepo::new(pool.clone());

    let project_id = insert_project(&pool, "acme/lib").await;
    let job_id = insert_scan_job(&pool, project_id, "acme/lib", "c1", 0).await;
    jobs.mark_queued(job_id).await.unwrap();
    jobs.start_running(job_id, 0, "primary", 120).await.unwrap();

    let mut tx = jobs.begin().await.unwrap();
    jobs.mark_failed_permanent(&mut tx, job_id, "COMMIT_MISSING", "no such commit")
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let override_cfg = serde_json::json!({"profile": "strict"});
    let outcome = jobs.operator_retry(job_id, Some(override_cfg.clone())).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Applied);

    let job = jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, "queued");
    assert_eq!(job.attempts, 0);
    assert_eq!(job.config_override, Some(override_cfg));
    assert!(job.last_error.is_none());
}

#[tokio::test]
#[serial]
async fn duplicate_project_commit_pair_is_rejected_by_the_uniqueness_constraint() {
    let pool = setup_db().await;
    let jobs = ScanJobsRepo::new(pool.clone());

    let project_id = insert_project(&pool, "acme/lib").await;
    insert_scan_job(&pool, project_id, "acme/lib", "c1", 3).await;

    let result = jobs
        .create(scanflow::model::NewScanJob {
            project_id,
            repo_slug: "acme/lib".to_string(),
            commit_sha: "c1".to_string(),
            branch: None,
            priority: "normal".to_string(),
            max_retries: 3,
            config_override: None,
        })
        .await;

    assert!(result.is_err(), "duplicate (project, commit) must violate the unique constraint");
}
