//! Ingest -> orchestrate -> infer -> cache, against a scripted engine.

mod helpers;

use helpers::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

use xray_triage::{
    models::{
        label::{DiseaseLabel, Urgency},
        record::{Fingerprint, RecordState, ResultRecord},
        task::{TaskId, TaskPoll, TaskStatus},
    },
    services::{orchestrator::OrchestratorError, retrain::RetrainConfig, triage::Submission},
};

fn queued(submission: Submission) -> TaskId {
    match submission {
        Submission::Queued { task_id, .. } => task_id,
        other => panic!("expected a queued submission, got {other:?}"),
    }
}

fn completed(poll: TaskPoll) -> ResultRecord {
    match poll {
        TaskPoll::Completed { record } => record,
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn test_tuberculosis_result_is_cached_for_resubmission() {
    let h = Harness::started(fast_orchestrator(), RetrainConfig::default()).await;
    let image = xray("patient-a");

    let task_id = queued(assert_ok!(h.state.triage.ingest(&image).await));
    let record = completed(wait_for_terminal(&h, task_id).await);

    assert_eq!(record.fingerprint, Fingerprint::of(&image));
    assert_eq!(record.state, RecordState::Completed);
    assert!(!record.served_from_cache);
    let diagnosis = record.diagnosis.as_ref().unwrap();
    assert_eq!(diagnosis.label, DiseaseLabel::Tuberculosis);
    assert_eq!(diagnosis.confidence, 0.87);
    assert_eq!(diagnosis.urgency, Urgency::High);
    assert_eq!(diagnosis.recommendation.urgency, Urgency::High);
    assert!(record.image_key.ends_with(".png"));

    match assert_ok!(h.state.triage.ingest(&image).await) {
        Submission::Cached { record: cached } => {
            assert!(cached.served_from_cache);
            assert_eq!(cached.diagnosis, record.diagnosis);
        }
        other => panic!("expected a cache hit, got {other:?}"),
    }

    assert_eq!(h.state.orchestrator.task_count().await, 1);
    assert_eq!(h.engine.classify_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_identical_concurrent_submissions_share_one_task() {
    let mut h = Harness::new(fast_orchestrator(), RetrainConfig::default()).await;
    let image = xray("patient-b");

    let submissions = (0..8).map(|_| {
        let triage = Arc::clone(&h.state.triage);
        let image = image.clone();
        tokio::spawn(async move { triage.ingest(&image).await.unwrap() })
    });
    let task_ids: Vec<TaskId> = futures::future::join_all(submissions)
        .await
        .into_iter()
        .map(|s| queued(s.unwrap()))
        .collect();

    assert!(task_ids.iter().all(|id| *id == task_ids[0]));
    assert_eq!(h.state.orchestrator.task_count().await, 1);
    assert_eq!(h.store.len().await, 1);

    h.start();
    let first = wait_for_terminal(&h, task_ids[0]).await;
    let second = wait_for_terminal(&h, task_ids[7]).await;
    assert_eq!(first, second);
    assert_eq!(h.engine.classify_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried_under_the_same_task() {
    let h = Harness::started(fast_orchestrator(), RetrainConfig::default()).await;
    h.engine.fail_next(2);

    let task_id = queued(h.state.triage.ingest(&xray("patient-c")).await.unwrap());
    let record = completed(wait_for_terminal(&h, task_id).await);
    assert_eq!(record.state, RecordState::Completed);

    let task = h.state.orchestrator.task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.attempt_count, 3);
    assert_eq!(task.last_error, None);
}

#[tokio::test]
async fn test_exhausted_retries_fail_task_and_record() {
    let h = Harness::started(fast_orchestrator(), RetrainConfig::default()).await;
    h.engine.fail_next(3);
    let image = xray("patient-d");

    let task_id = queued(h.state.triage.ingest(&image).await.unwrap());
    match wait_for_terminal(&h, task_id).await {
        TaskPoll::Failed { error } => {
            assert!(error.contains("after 3 attempts"), "{error}");
            assert!(error.contains("CUDA out of memory"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }

    let task = h.state.orchestrator.task(task_id).await.unwrap();
    assert_eq!(task.attempt_count, 3);

    let record = h
        .state
        .cache
        .lookup(&Fingerprint::of(&image))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, RecordState::Failed);
    assert!(record.diagnosis.is_none());
    assert!(record.error.is_some());
}

#[tokio::test]
async fn test_poll_repeats_terminal_payload() {
    let h = Harness::started(fast_orchestrator(), RetrainConfig::default()).await;
    let image = xray("patient-e");
    let task_id = queued(h.state.triage.ingest(&image).await.unwrap());

    let first = wait_for_terminal(&h, task_id).await;
    assert_eq!(h.state.triage.poll(task_id).await.unwrap(), first);

    // A later correction changes the record, not what this task reported.
    let corrected = h
        .state
        .feedback
        .record_correction(&Fingerprint::of(&image), DiseaseLabel::Normal)
        .await
        .unwrap();
    assert!(corrected.correction.is_some());

    for _ in 0..3 {
        assert_eq!(h.state.triage.poll(task_id).await.unwrap(), first);
    }
    assert!(completed(first).correction.is_none());
}

#[tokio::test]
async fn test_attempt_timeout_is_retried() {
    let mut config = fast_orchestrator();
    config.attempt_timeout = Duration::from_millis(100);
    let h = Harness::started(config, RetrainConfig::default()).await;
    h.engine.stall_next(1);

    let task_id = queued(h.state.triage.ingest(&xray("patient-f")).await.unwrap());
    completed(wait_for_terminal(&h, task_id).await);

    let task = h.state.orchestrator.task(task_id).await.unwrap();
    assert_eq!(task.attempt_count, 2);
}

#[tokio::test]
async fn test_failed_image_can_be_resubmitted() {
    let h = Harness::started(fast_orchestrator(), RetrainConfig::default()).await;
    h.engine.fail_next(3);
    let image = xray("patient-g");

    let failed_task = queued(h.state.triage.ingest(&image).await.unwrap());
    assert!(matches!(
        wait_for_terminal(&h, failed_task).await,
        TaskPoll::Failed { .. }
    ));

    let retry_task = queued(h.state.triage.ingest(&image).await.unwrap());
    assert_ne!(retry_task, failed_task);
    let record = completed(wait_for_terminal(&h, retry_task).await);
    assert_eq!(record.error, None);
    assert_eq!(h.store.len().await, 1);
}

#[tokio::test]
async fn test_resubmitting_after_failure_reopens_the_record() {
    let h = Harness::started(fast_orchestrator(), RetrainConfig::default()).await;
    h.engine.fail_next(3);
    let image = xray("patient-i");
    let fingerprint = Fingerprint::of(&image);

    let failed_task = queued(h.state.triage.ingest(&image).await.unwrap());
    assert!(matches!(
        wait_for_terminal(&h, failed_task).await,
        TaskPoll::Failed { .. }
    ));

    // As an ingest does when it read the record just before it was marked failed.
    let retry_task = h.state.orchestrator.submit(fingerprint.clone()).await;
    assert_ne!(retry_task, failed_task);

    let record = completed(wait_for_terminal(&h, retry_task).await);
    assert_eq!(record.state, RecordState::Completed);
    let stored = h.state.cache.lookup(&fingerprint).await.unwrap().unwrap();
    assert_eq!(stored.state, RecordState::Completed);
}

#[tokio::test]
async fn test_ingest_racing_the_final_failure_leaves_no_orphaned_record() {
    let h = Harness::started(fast_orchestrator(), RetrainConfig::default()).await;
    h.engine.fail_next(3);
    let image = xray("patient-j");

    let first = queued(h.state.triage.ingest(&image).await.unwrap());
    let mut task_ids = vec![first];
    loop {
        match h.state.triage.ingest(&image).await.unwrap() {
            Submission::Queued { task_id, .. } if !task_ids.contains(&task_id) => {
                task_ids.push(task_id)
            }
            Submission::Queued { .. } => {}
            Submission::Cached { .. } => break,
        }
        let status = h.state.orchestrator.task(first).await.unwrap().status;
        if status.is_terminal() {
            break;
        }
        tokio::task::yield_now().await;
    }

    for task_id in &task_ids {
        wait_for_terminal(&h, *task_id).await;
    }
    // Every task is terminal, so the record must be too.
    let record = h
        .state
        .cache
        .lookup(&Fingerprint::of(&image))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(record.state, RecordState::Pending);
    if task_ids.len() > 1 {
        assert_eq!(record.state, RecordState::Completed);
    }
}

#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let h = Harness::started(fast_orchestrator(), RetrainConfig::default()).await;
    assert!(matches!(
        h.state.triage.poll(TaskId::new()).await,
        Err(OrchestratorError::TaskNotFound(_))
    ));
}

#[tokio::test]
async fn test_recover_resubmits_pending_records() {
    let mut h = Harness::new(fast_orchestrator(), RetrainConfig::default()).await;
    let image = xray("left over from a previous run");
    let fingerprint = Fingerprint::of(&image);
    let key = format!("xray_images/{fingerprint}.png");
    std::fs::create_dir_all(h.media.path().join("xray_images")).unwrap();
    std::fs::write(h.media.path().join(&key), &image).unwrap();
    h.state
        .cache
        .store(&ResultRecord::pending(fingerprint.clone(), key))
        .await
        .unwrap();

    assert_eq!(h.state.orchestrator.recover().await.unwrap(), 1);
    assert_eq!(h.state.orchestrator.queue_depth().await, 1);

    h.start();
    // Resubmitting joins the recovered task.
    let task_id = queued(h.state.triage.ingest(&image).await.unwrap());
    assert_eq!(h.state.orchestrator.task_count().await, 1);
    completed(wait_for_terminal(&h, task_id).await);
}

#[tokio::test]
async fn test_shutdown_lets_running_attempt_finish() {
    let h = Harness::new(fast_orchestrator(), RetrainConfig::default()).await;
    h.engine.delay_classify(Duration::from_millis(200));
    let runner = tokio::spawn(Arc::clone(&h.state.orchestrator).run());

    let image = xray("patient-h");
    let task_id = queued(h.state.triage.ingest(&image).await.unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.state.orchestrator.shutdown();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("run must return after shutdown")
        .unwrap();

    completed(h.state.triage.poll(task_id).await.unwrap());
}
