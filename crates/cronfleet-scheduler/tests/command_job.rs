// CommandJob end to end: real `sh` processes on the real clock.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cronfleet_core::{JobDefinition, JobId, RunnerId, SystemClock};
use cronfleet_scheduler::{CommandJob, ExecutionReport, JobBody, JobExecutor, JobRegistry, LockManager};
use cronfleet_store::{MemoryLockStore, Outcome};

async fn run(command: &str, max_duration: Duration) -> ExecutionReport {
    let def = JobDefinition::new("cmd_job", "@hourly", max_duration, Duration::from_secs(60))
        .with_command(command);
    let body = JobRegistry::new().resolve(&def).unwrap();
    run_body(&def, body).await
}

async fn run_body(def: &JobDefinition, body: Arc<dyn JobBody>) -> ExecutionReport {
    let store = MemoryLockStore::new(Arc::new(SystemClock));
    let lock = LockManager::new(store, RunnerId::from("pi"), Duration::from_secs(2));
    let lease = lock
        .try_acquire(&JobId::from("cmd_job"), def.lease_ttl)
        .await
        .unwrap();
    JobExecutor::new(lock).execute(def, lease, body).await.unwrap()
}

/// Log sink shared with a thread-local subscriber.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[tokio::test]
async fn zero_exit_is_success() {
    let report = run("true", Duration::from_secs(10)).await;
    assert_eq!(report.outcome, Outcome::Success);
    assert!(report.released);
}

#[tokio::test]
async fn nonzero_exit_reports_code_and_stderr_with_job_env() {
    let report = run(
        r#"echo "job=$CRONFLEET_JOB_ID runner=$CRONFLEET_RUNNER_ID token=$CRONFLEET_FENCING_TOKEN" >&2; exit 3"#,
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(report.outcome, Outcome::Failure);
    assert_eq!(
        report.detail.as_deref(),
        Some("exit 3: job=cmd_job runner=pi token=1")
    );
}

#[tokio::test]
async fn slow_command_is_killed_at_deadline() {
    let started = std::time::Instant::now();
    let report = run("sleep 30", Duration::from_millis(500)).await;
    assert_eq!(report.outcome, Outcome::Timeout);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn job_output_is_forwarded_to_the_log() {
    let sink = Captured::default();
    let writer = sink.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let report = run(
        "echo 'synced 42 cards'; echo 'retrying page 3' >&2",
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(report.outcome, Outcome::Success);

    let logs = sink.text();
    let line = logs
        .lines()
        .find(|l| l.contains("synced 42 cards"))
        .unwrap_or_else(|| panic!("stdout line missing from logs:\n{logs}"));
    assert!(line.contains("cmd_job"));
    assert!(logs.contains("retrying page 3"));
}

#[tokio::test]
async fn trailing_args_reach_the_command_as_single_words() {
    let def = JobDefinition::new(
        "cmd_job",
        "@hourly",
        Duration::from_secs(10),
        Duration::from_secs(60),
    );
    let body = CommandJob::new("test").with_args(vec![
        "two words".to_string(),
        "=".to_string(),
        "two words".to_string(),
    ]);
    let report = run_body(&def, Arc::new(body)).await;
    assert_eq!(report.outcome, Outcome::Success, "{:?}", report.detail);

    let body = CommandJob::new(r#"echo "got $# args: $*" >&2; exit 1; echo"#)
        .with_args(vec!["--reload-all-years".to_string()]);
    let report = run_body(&def, Arc::new(body)).await;
    assert_eq!(report.detail.as_deref(), Some("exit 1: got 1 args: --reload-all-years"));
}
