//! End-to-end pipeline tests with real installer scripts.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use deckhand_agent::{
    FileResultStore, HostPlatform, JobPipeline, ManifestLoader, PipelineSettings, Poller,
    RetryPolicy, SignatureVerifier, SpoolQueue,
};
use deckhand_config::SigningKey;
use deckhand_sandbox::EngineConfig;
use deckhand_types::{
    EnvelopeBody, ExecutionStatus, FailureKind, JobEnvelope, JobId, JobState,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const KEY: &str = "integration-test-signing-key";

struct Harness {
    dir: TempDir,
    pipeline: JobPipeline,
}

struct Setup<'a> {
    script: &'a str,
    timeout_secs: u64,
    idempotent: bool,
    enforce_os: bool,
}

impl<'a> Setup<'a> {
    fn new(script: &'a str) -> Self {
        Self {
            script,
            timeout_secs: 60,
            idempotent: true,
            enforce_os: false,
        }
    }

    fn build_with(mut self, f: impl FnOnce(&mut Self)) -> Harness {
        f(&mut self);
        self.build()
    }

    fn build(self) -> Harness {
        let dir = TempDir::new().unwrap();
        let app = dir.path().join("installers/nginx");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(
            app.join("manifest.yml"),
            format!(
                r#"
id: nginx
name: Nginx
version: "1.24"
os_requirements:
  family: [debian, ubuntu]
  min_version: "20.04"
inputs:
  - name: server_name
    type: string
    validation:
      pattern: '^[a-z0-9\-\.]+$'
  - name: port
    type: port
    default: "80"
install_script: install.sh
timeout_seconds: {}
idempotent: {}
"#,
                self.timeout_secs, self.idempotent
            ),
        )
        .unwrap();

        let script = app.join("install.sh");
        let body = self.script.replace("{dir}", &dir.path().display().to_string());
        std::fs::write(&script, format!("#!/bin/bash\n{body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let settings = PipelineSettings {
            installers: dir.path().join("installers"),
            logs: dir.path().join("logs"),
            interpreter: PathBuf::from("/bin/bash"),
            script_extension: "sh".to_string(),
            env_allowlist: vec!["PATH".to_string()],
            max_output_bytes: 64 * 1024,
            termination_grace: Duration::from_millis(200),
            enforce_os_requirements: self.enforce_os,
            retry: RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40)),
        };
        let loader = Arc::new(ManifestLoader::new(&settings.installers));
        let pipeline = JobPipeline::new(settings, verifier(), loader)
            .with_engine(
                EngineConfig::default()
                    .with_grace(Duration::from_millis(200))
                    .with_drain_timeout(Duration::from_millis(200)),
            );
        Harness { dir, pipeline }
    }
}

impl Harness {
    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }
}

fn verifier() -> SignatureVerifier {
    SignatureVerifier::new(SigningKey::new(KEY).unwrap())
}

fn body(job_id: &str, inputs: &[(&str, &str)]) -> EnvelopeBody {
    EnvelopeBody {
        job_id: JobId::new(job_id).unwrap(),
        app_id: "nginx".to_string(),
        server_id: "web-01".to_string(),
        user_id: "alice".to_string(),
        inputs: inputs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        created_at: Utc::now(),
    }
}

fn signed(job_id: &str, inputs: &[(&str, &str)]) -> JobEnvelope {
    verifier().seal(body(job_id, inputs)).unwrap()
}

fn marker_script() -> &'static str {
    "touch {dir}/ran\necho \"configuring $SERVER_NAME on port $PORT\""
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_nginx_success() {
    let h = Setup::new(marker_script()).build();
    let result = h
        .pipeline
        .process(&signed("job-1", &[("server_name", "example.com")]), &CancellationToken::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::Success, "{result:?}");
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.attempts, 1);
    assert!(result.error.is_none());
    assert!(result.output.contains("configuring example.com on port 80"));
    assert!(result.completed_at >= result.started_at);

    let log = std::fs::read_to_string(h.path("logs/job-1.log")).unwrap();
    assert!(log.contains("=== attempt 1 of 3"));
    assert!(log.contains("configuring example.com"));
}

#[tokio::test]
async fn test_invalid_input_never_executes() {
    let h = Setup::new(marker_script()).build();
    let result = h
        .pipeline
        .process(&signed("job-2", &[("server_name", "Example!!")]), &CancellationToken::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::ValidationError);
    assert_eq!(result.error.as_deref(), Some("ValidationError: server_name"));
    assert_eq!(result.exit_code, 1);
    assert_eq!(result.attempts, 0);
    assert!(result.output.contains("server_name does not match the required pattern"));
    assert!(!result.output.contains("Example!!"));
    assert!(!h.path("ran").exists());
    assert!(!h.path("logs/job-2.log").exists());
}

#[tokio::test]
async fn test_transient_failures_then_success() {
    let script = r#"
count_file={dir}/count
n=$(( $(cat "$count_file" 2>/dev/null || echo 0) + 1 ))
echo "$n" > "$count_file"
echo "run $n attempt-env $PROVISIONING_ATTEMPT"
if [ "$n" -lt 3 ]; then exit 2; fi
exit 0
"#;
    let h = Setup::new(script).build();
    let result = h
        .pipeline
        .process(&signed("job-3", &[("server_name", "example.com")]), &CancellationToken::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::Success, "{}", result.output);
    assert_eq!(result.attempts, 3);
    for n in 1..=3 {
        assert!(result.output.contains(&format!("=== attempt {n} of 3")));
        assert!(result.output.contains(&format!("run {n} attempt-env {n}")));
    }
    assert!(result.output.contains("attempt 1 finished: exit code 2"));
    assert!(result.output.contains("attempt 3 finished: exit code 0"));
}

#[tokio::test]
async fn test_exhausted_budget_reports_last_exit() {
    let h = Setup::new("echo transient\nexit 2").build();
    let result = h
        .pipeline
        .process(&signed("job-4", &[("server_name", "example.com")]), &CancellationToken::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::InstallationError);
    assert_eq!(result.failure, Some(FailureKind::Installation));
    assert_eq!(result.exit_code, 2);
    assert_eq!(result.attempts, 3);
    assert_eq!(
        result.error.as_deref(),
        Some("InstallationError: installer failed with exit code 2")
    );
}

#[tokio::test]
async fn test_configuration_exit_not_retried() {
    let h = Setup::new("echo 'missing /etc/nginx' >&2\nexit 3").build();
    let result = h
        .pipeline
        .process(&signed("job-5", &[("server_name", "example.com")]), &CancellationToken::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::ConfigurationError);
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.attempts, 1);
    assert!(result.output.contains("missing /etc/nginx"));
}

#[tokio::test]
async fn test_non_idempotent_installer_runs_once() {
    let h = Setup::new("exit 2").build_with(|s| s.idempotent = false);
    let result = h
        .pipeline
        .process(&signed("job-6", &[("server_name", "example.com")]), &CancellationToken::new())
        .await;
    assert_eq!(result.attempts, 1);
    assert_eq!(result.exit_code, 2);
}

#[tokio::test]
async fn test_timeout_overrides_eventual_success() {
    let h = Setup::new("sleep 30\nexit 0").build_with(|s| s.timeout_secs = 1);
    let started = Instant::now();
    let result = h
        .pipeline
        .process(&signed("job-7", &[("server_name", "example.com")]), &CancellationToken::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert_eq!(result.exit_code, 124);
    assert_eq!(result.attempts, 1);
    assert_eq!(
        result.error.as_deref(),
        Some("TimeoutExceeded: installer exceeded its 1s timeout")
    );
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_shutdown_cancels_running_installer() {
    let h = Setup::new("sleep 30").build();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let result = h
        .pipeline
        .process(&signed("job-8", &[("server_name", "example.com")]), &cancel)
        .await;
    assert_eq!(result.status, ExecutionStatus::InstallationError);
    assert_eq!(result.failure, Some(FailureKind::Cancelled));
    assert_eq!(result.exit_code, 130);
}

#[tokio::test]
async fn test_forged_envelope_rejected() {
    let h = Setup::new(marker_script()).build();
    let genuine = signed("job-9", &[("server_name", "example.com")]);
    let forged = JobEnvelope::new(
        body("job-9", &[("server_name", "evil.example.com")]),
        genuine.signature(),
    );

    let result = h.pipeline.process(&forged, &CancellationToken::new()).await;
    assert_eq!(result.failure, Some(FailureKind::Authentication));
    assert_eq!(result.status, ExecutionStatus::ValidationError);
    assert_eq!(result.exit_code, 1);
    assert!(!h.path("ran").exists());
}

#[tokio::test]
async fn test_escaping_script_rejected() {
    let h = Setup::new(marker_script()).build();
    let outside = h.path("outside.sh");
    std::fs::write(&outside, format!("#!/bin/bash\ntouch {}\n", h.path("ran").display())).unwrap();
    let script = h.path("installers/nginx/install.sh");
    std::fs::remove_file(&script).unwrap();
    std::os::unix::fs::symlink(&outside, &script).unwrap();

    let result = h
        .pipeline
        .process(&signed("job-10", &[("server_name", "example.com")]), &CancellationToken::new())
        .await;
    assert_eq!(result.failure, Some(FailureKind::UnsafePath));
    assert_eq!(result.status, ExecutionStatus::ConfigurationError);
    assert_eq!(result.exit_code, 3);
}

#[tokio::test]
async fn test_unsupported_platform_rejected() {
    let alpine = HostPlatform::parse("ID=alpine\nVERSION_ID=3.19.1\n");
    let h = Setup::new(marker_script()).build_with(|s| s.enforce_os = true);
    let pipeline = h.pipeline.with_host(alpine);

    let result = pipeline
        .process(&signed("job-11", &[("server_name", "example.com")]), &CancellationToken::new())
        .await;
    assert_eq!(result.failure, Some(FailureKind::UnsupportedPlatform));
    assert_eq!(result.exit_code, 3);
    assert!(!h.dir.path().join("ran").exists());
}

#[tokio::test]
async fn test_unknown_app_rejected() {
    let h = Setup::new(marker_script()).build();
    let mut b = body("job-12", &[]);
    b.app_id = "redis".to_string();
    let result = h
        .pipeline
        .process(&verifier().seal(b).unwrap(), &CancellationToken::new())
        .await;
    assert_eq!(result.failure, Some(FailureKind::ContractNotFound));
    assert_eq!(result.exit_code, 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Poller over spool and file store
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_poller_spool_to_store() {
    let h = Setup::new(marker_script()).build();
    let spool = h.path("spool");
    let results = h.path("results");
    SpoolQueue::enqueue(&spool, "agent-001", &signed("job-20", &[("server_name", "a.example")]))
        .unwrap();

    let store = Arc::new(FileResultStore::new(&results));
    let mut events = store.subscribe();
    let queue = SpoolQueue::new(&spool, "agent-001", Duration::from_millis(20));
    let poller = Poller::new("agent-001", queue, Arc::new(h.pipeline), store.clone());

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(poller.run(cancel.clone()));

    let mut seen = Vec::new();
    let deadline = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let record = events.recv().await.unwrap();
            seen.push(record.status);
            if record.status.is_terminal() {
                break record;
            }
        }
    });
    let terminal = deadline.await.unwrap();
    cancel.cancel();
    let stats = handle.await.unwrap();

    assert_eq!(seen, vec![JobState::Running, JobState::Success]);
    assert_eq!(terminal.exit_code, Some(0));
    assert_eq!(stats.succeeded, 1);
    assert!(results.join("job-20.json").exists());
    assert!(no_pending_files(&spool.join("agent-001")));
}

fn no_pending_files(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .all(|e| e.path().is_dir())
}
