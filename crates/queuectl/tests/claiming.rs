mod common;

use chrono::{Duration, Utc};
use common::{insert_job, make_due, manager, setup_db, test_settings};
use queuectl::db;
use queuectl::jobs::{
    AttemptReport, FailureReason, JobManager, JobState, JobSubmission, JobsRepo, Outcome,
};
use std::collections::HashSet;

fn failed_report() -> AttemptReport {
    AttemptReport {
        outcome: Outcome::Failed(FailureReason::ExitStatus(1)),
        output: String::new(),
        duration_ms: 1,
    }
}

#[tokio::test]
async fn claim_sets_owner_and_empty_queue_is_none() {
    let db = setup_db().await;
    let manager = manager(&db);

    assert!(manager.claim_next("worker-a").await.unwrap().is_none());

    insert_job(&manager, "only", "true").await;
    let job = manager.claim_next("worker-a").await.unwrap().expect("should claim");
    assert_eq!(job.id, "only");
    assert_eq!(job.state, JobState::Processing);
    assert_eq!(job.worker_id.as_deref(), Some("worker-a"));
    assert_eq!(job.attempts, 0);

    assert!(manager.claim_next("worker-b").await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_claimers_on_separate_pools_never_share_a_job() {
    let db = setup_db().await;
    let seed = manager(&db);
    for i in 0..40 {
        insert_job(&seed, &format!("job-{i:02}"), "true").await;
    }

    // one pool per claimer, as separate worker processes would have
    let mut handles = Vec::new();
    for w in 0..4 {
        let pool = db::open(&db.path()).await.unwrap();
        let manager = JobManager::new(JobsRepo::new(pool), test_settings());
        handles.push(tokio::spawn(async move {
            let worker_id = format!("worker-{w}");
            let mut claimed = Vec::new();
            while let Some(job) = manager.claim_next(&worker_id).await.unwrap() {
                assert_eq!(job.worker_id.as_deref(), Some(worker_id.as_str()));
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap());
    }

    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 40, "every job claimed exactly once");
    assert_eq!(unique.len(), 40);
    assert_eq!(seed.stats().await.unwrap().processing, 40);
}

#[tokio::test]
async fn higher_priority_first_then_oldest() {
    let db = setup_db().await;
    let manager = manager(&db);

    insert_job(&manager, "low-old", "true").await;
    manager
        .enqueue(JobSubmission::new("high", "true").priority(10))
        .await
        .unwrap();
    insert_job(&manager, "low-new", "true").await;

    let order: Vec<String> = [
        manager.claim_next("w").await.unwrap(),
        manager.claim_next("w").await.unwrap(),
        manager.claim_next("w").await.unwrap(),
    ]
    .into_iter()
    .map(|j| j.expect("claim").id)
    .collect();

    assert_eq!(order, ["high", "low-old", "low-new"]);
}

#[tokio::test]
async fn run_at_in_the_future_is_not_claimable() {
    let db = setup_db().await;
    let manager = manager(&db);

    manager
        .enqueue(JobSubmission::new("later", "true").run_at(Utc::now() + Duration::hours(1)))
        .await
        .unwrap();
    manager
        .enqueue(JobSubmission::new("past", "true").run_at(Utc::now() - Duration::seconds(5)))
        .await
        .unwrap();

    let job = manager.claim_next("w").await.unwrap().expect("past job is due");
    assert_eq!(job.id, "past");
    assert!(manager.claim_next("w").await.unwrap().is_none());

    sqlx::query("UPDATE jobs SET run_at = $1 WHERE id = 'later'")
        .bind(Utc::now() - Duration::seconds(1))
        .execute(&db.pool)
        .await
        .unwrap();
    let job = manager.claim_next("w").await.unwrap().expect("now due");
    assert_eq!(job.id, "later");
}

#[tokio::test]
async fn failed_job_waits_for_its_backoff() {
    let db = setup_db().await;
    let manager = manager(&db);

    insert_job(&manager, "flaky", "false").await;
    let job = manager.claim_next("w").await.unwrap().unwrap();
    let failed = manager.record_result(&job, "w", &failed_report()).await.unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert!(failed.next_retry_at.unwrap() > Utc::now());

    assert!(manager.claim_next("w").await.unwrap().is_none());

    make_due(&db.pool, "flaky").await;
    let again = manager.claim_next("w2").await.unwrap().expect("due retry");
    assert_eq!(again.id, "flaky");
    assert_eq!(again.attempts, 1);
    assert_eq!(again.worker_id.as_deref(), Some("w2"));
    assert!(again.next_retry_at.is_none());
}

#[tokio::test]
async fn result_from_a_worker_that_no_longer_holds_the_job_is_a_conflict() {
    let db = setup_db().await;
    let manager = manager(&db);

    insert_job(&manager, "j", "true").await;
    let job = manager.claim_next("owner").await.unwrap().unwrap();

    let ok = AttemptReport {
        outcome: Outcome::Succeeded,
        output: "done".into(),
        duration_ms: 3,
    };
    let err = manager.record_result(&job, "intruder", &ok).await.unwrap_err();
    assert!(matches!(err, queuectl::QueueError::Conflict(_)), "{err}");

    let done = manager.record_result(&job, "owner", &ok).await.unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.attempts, 0);
    assert!(done.worker_id.is_none());
    assert_eq!(done.last_output.as_deref(), Some("done"));
    assert_eq!(done.duration_ms, Some(3));

    // a second report for the same claim is also rejected
    assert!(manager.record_result(&job, "owner", &ok).await.is_err());
}
