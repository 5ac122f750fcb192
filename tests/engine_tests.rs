
use std::io::{Cursor, Read};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use job_worker::job::JobStatus;
use job_worker::store::JobStore;
use test_harness::{assert_eventually, FakeRuntime, RuntimeBehavior, ShellRuntime, TestWorker};

fn archive_entry(archive: &[u8], name: &str) -> String {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive)).unwrap();
    let mut content = String::new();
    zip.by_name(name)
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    content
}

#[tokio::test]
async fn test_echo_job_finishes_with_archived_output() {
    let runtime = Arc::new(ShellRuntime::default());
    let worker = TestWorker::new(runtime.clone());
    let definition = worker.add_job("echo \"ok\"", Duration::from_secs(5)).await;
    let id = definition.id;

    assert!(worker.engine.run_job(definition).unwrap());
    assert_eq!(worker.engine.running_count(), 1);
    assert!(worker.engine.is_running(&id));

    worker.wait_until_idle().await;

    let calls = worker.store.results_calls();
    assert_eq!(calls.len(), 1, "SetResults must be called exactly once");
    let (called_id, status, results) = &calls[0];
    assert_eq!(*called_id, id);
    assert_eq!(*status, JobStatus::Finished);
    assert_eq!(archive_entry(results, "stdout.txt"), "ok\n");
    assert_eq!(archive_entry(results, "stderr.txt"), "");

    assert_eq!(worker.store.inner.status(&id).await, Some(JobStatus::Finished));
    assert!(!worker.job_directory(id).exists(), "sandbox must be cleared");
    assert_eq!(runtime.stops.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.removes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_non_zero_exit_is_still_finished() {
    let worker = TestWorker::new(Arc::new(ShellRuntime::default()));
    let definition = worker
        .add_job("echo boom >&2\nexit 3", Duration::from_secs(5))
        .await;
    let id = definition.id;

    worker.engine.run_job(definition).unwrap();
    worker.wait_until_idle().await;

    let calls = worker.store.results_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, JobStatus::Finished);
    assert_eq!(archive_entry(&calls[0].2, "stderr.txt"), "boom\n");
    assert_eq!(worker.store.inner.status(&id).await, Some(JobStatus::Finished));
}

#[tokio::test]
async fn test_duplicate_run_job_is_ignored() {
    let runtime = Arc::new(FakeRuntime::new(RuntimeBehavior::Hang));
    let worker = TestWorker::new(runtime.clone());
    let definition = worker
        .add_job("sleep 60", Duration::from_millis(300))
        .await;

    assert!(worker.engine.run_job(definition.clone()).unwrap());
    assert!(!worker.engine.run_job(definition.clone()).unwrap());
    assert_eq!(worker.engine.running_count(), 1);

    worker.wait_until_idle().await;
    assert_eq!(runtime.creates.load(Ordering::SeqCst), 1);
    assert_eq!(worker.store.results_calls().len(), 1);
}

#[tokio::test]
async fn test_hanging_job_times_out() {
    let runtime = Arc::new(FakeRuntime::new(RuntimeBehavior::Hang));
    let worker = TestWorker::new(runtime.clone());
    let definition = worker.add_job("sleep 60", Duration::from_millis(100)).await;
    let id = definition.id;

    worker.engine.run_job(definition).unwrap();
    worker.wait_until_idle().await;

    assert_eq!(worker.store.inner.status(&id).await, Some(JobStatus::Timeout));
    assert_eq!(runtime.stops.load(Ordering::SeqCst), 1, "stop exactly once");
    assert_eq!(runtime.removes.load(Ordering::SeqCst), 1, "remove exactly once");
    assert!(!worker.job_directory(id).exists());
}

#[tokio::test]
async fn test_shell_script_exceeding_timeout_is_killed() {
    let worker = TestWorker::new(Arc::new(ShellRuntime::default()));
    let definition = worker
        .add_job("echo started\nsleep 30", Duration::from_millis(300))
        .await;
    let id = definition.id;

    worker.engine.run_job(definition).unwrap();
    worker.wait_until_idle().await;

    let calls = worker.store.results_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, JobStatus::Timeout);
    assert_eq!(archive_entry(&calls[0].2, "stdout.txt"), "started\n");
    assert_eq!(worker.store.inner.status(&id).await, Some(JobStatus::Timeout));
}

#[tokio::test]
async fn test_empty_script_records_fault() {
    let runtime = Arc::new(FakeRuntime::new(RuntimeBehavior::Exit(0)));
    let worker = TestWorker::new(runtime.clone());
    let definition = worker.add_job("", Duration::from_secs(5)).await;
    let id = definition.id;

    worker.engine.run_job(definition).unwrap();
    worker.wait_until_idle().await;

    assert_eq!(
        worker.store.results_calls(),
        vec![(id, JobStatus::Fault, Vec::new())]
    );
    assert_eq!(worker.store.inner.status(&id).await, Some(JobStatus::Fault));
    assert!(!worker.engine.is_running(&id));
    assert!(!worker.job_directory(id).exists());
    assert_eq!(runtime.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_container_start_failure_is_fault() {
    let runtime = Arc::new(FakeRuntime::new(RuntimeBehavior::NotStarted));
    let worker = TestWorker::new(runtime.clone());
    let definition = worker.add_job("true", Duration::from_secs(5)).await;
    let id = definition.id;

    worker.engine.run_job(definition).unwrap();
    worker.wait_until_idle().await;

    let calls = worker.store.results_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, JobStatus::Fault);
    assert!(!calls[0].2.is_empty(), "logs are archived for faulted runs");
    assert_eq!(runtime.removes.load(Ordering::SeqCst), 1);
    assert!(!worker.job_directory(id).exists());
}

#[tokio::test]
async fn test_pipeline_panic_records_fault_and_clears_sandbox() {
    let runtime = Arc::new(FakeRuntime::new(RuntimeBehavior::PanicOnCreate));
    let worker = TestWorker::new(runtime.clone());
    let definition = worker.add_job("true", Duration::from_secs(5)).await;
    let id = definition.id;

    worker.engine.run_job(definition).unwrap();
    worker.wait_until_idle().await;

    assert_eq!(runtime.creates.load(Ordering::SeqCst), 1);
    assert_eq!(
        worker.store.results_calls(),
        vec![(id, JobStatus::Fault, Vec::new())]
    );
    assert_eq!(worker.store.inner.status(&id).await, Some(JobStatus::Fault));
    assert!(!worker.engine.is_running(&id));
    assert!(!worker.job_directory(id).exists());
}

#[tokio::test]
async fn test_rejected_results_fall_back_to_fault() {
    let runtime = Arc::new(FakeRuntime::new(RuntimeBehavior::Exit(0)));
    let worker = TestWorker::new(runtime);
    let definition = worker.add_job("true", Duration::from_secs(5)).await;
    let id = definition.id;

    // Job already recorded as lost by the sweeper: every write is refused.
    worker
        .store
        .inner
        .set_results(id, JobStatus::Lost, &[])
        .await
        .unwrap();

    worker.engine.run_job(definition).unwrap();
    worker.wait_until_idle().await;

    let statuses: Vec<JobStatus> = worker
        .store
        .results_calls()
        .into_iter()
        .map(|(_, status, _)| status)
        .collect();
    assert_eq!(statuses, vec![JobStatus::Finished, JobStatus::Fault]);
    assert_eq!(worker.store.inner.status(&id).await, Some(JobStatus::Lost));
    assert!(!worker.job_directory(id).exists());
}

#[tokio::test]
async fn test_wait_for_all_jobs_drains_and_refuses_new_jobs() {
    let worker = TestWorker::new(Arc::new(ShellRuntime::default()));
    let first = worker.add_job("sleep 0.2", Duration::from_secs(5)).await;
    let second = worker.add_job("sleep 0.2", Duration::from_secs(5)).await;
    let (first_id, second_id) = (first.id, second.id);

    worker.engine.run_job(first).unwrap();
    worker.engine.run_job(second).unwrap();
    assert_eq!(worker.engine.running_count(), 2);

    worker.engine.wait_for_all_jobs().await;
    assert_eq!(worker.engine.running_count(), 0);
    assert_eq!(
        worker.store.inner.status(&first_id).await,
        Some(JobStatus::Finished)
    );
    assert_eq!(
        worker.store.inner.status(&second_id).await,
        Some(JobStatus::Finished)
    );

    let late = worker.add_job("true", Duration::from_secs(5)).await;
    assert!(worker.engine.run_job(late).is_err());
}

#[tokio::test]
async fn test_running_jobs_snapshot() {
    let runtime = Arc::new(FakeRuntime::new(RuntimeBehavior::Hang));
    let worker = TestWorker::new(runtime);
    let definition = worker.add_job("sleep 60", Duration::from_secs(2)).await;
    let id = definition.id;

    worker.engine.run_job(definition).unwrap();

    let engine = worker.engine.clone();
    assert_eventually(
        || {
            let engine = engine.clone();
            async move { engine.running_jobs().len() == 1 }
        },
        Duration::from_secs(1),
        "job should be listed",
    )
    .await;

    let jobs = worker.engine.running_jobs();
    assert_eq!(jobs[0].id, id);
    assert_eq!(jobs[0].timeout, Duration::from_secs(2));
}
