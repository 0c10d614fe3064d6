//! Tests against real child processes driven by small shell scripts.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use askbridge::metrics::{BridgeStats, LatencyTracker};
use askbridge::worker::{WorkerSupervisor, FALLBACK_CALL, WORKER_CALL};
use askbridge::{AskRequest, Bridge, BridgeError, BridgeRequest, Settings};
use serde_json::{json, Value};
use tempfile::TempDir;

/// Persistent worker: answers each envelope on its own line, keyed by id.
const SERVE_SCRIPT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"action":"status"'*)
      printf '{"id":"%s","ok":true,"result":{"pid":%s}}\n' "$id" "$$" ;;
    *'"question":"slow'*)
      (sleep 1; printf '{"id":"%s","ok":true,"result":{"answer":"slow"}}\n' "$id") & ;;
    *'"question":"die'*)
      echo "fatal: lost connection to model" >&2
      exit 3 ;;
    *'"question":"fail'*)
      printf '{"id":"%s","ok":false,"error":"knowledge base is empty"}\n' "$id" ;;
    *)
      printf 'not json at all\n'
      printf '{"id":"%s","ok":true,"result":{"answer":"pong","pid":%s}}\n' "$id" "$$" ;;
  esac
done
"#;

/// Worker that dies immediately on start.
const CRASH_SCRIPT: &str = r#"
echo "ModuleNotFoundError: No module named 'openai'" >&2
exit 1
"#;

/// One-shot worker: reads the whole payload, answers once.
const ONESHOT_SCRIPT: &str = r#"
payload=$(cat)
case "$payload" in
  *'"action":"ask"'*) printf '{"ok":true,"result":{"answer":"oneshot"}}\n' ;;
  *) printf '{"ok":true,"result":{"status":"oneshot"}}\n' ;;
esac
"#;

/// Worker that never reads its input.
const MUTE_SCRIPT: &str = "exec sleep 30\n";

/// A question far larger than a pipe buffer.
fn oversized_question() -> String {
    format!("lorem {}", "x".repeat(200 * 1024))
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn settings(&self, persistent: Option<&Path>, oneshot: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.worker.persistent = persistent.is_some();
        settings.worker.candidates = vec!["/bin/sh".to_string()];
        settings.worker.persistent_args = persistent
            .map(|p| vec![p.display().to_string()])
            .unwrap_or_default();
        settings.worker.oneshot_args = vec![oneshot.display().to_string()];
        settings.worker.startup_grace_ms = 100;
        settings.worker.request_timeout_ms = 5_000;
        settings
    }
}

fn supervisor(settings: &Settings) -> (WorkerSupervisor, Arc<BridgeStats>) {
    let stats = Arc::new(BridgeStats::new());
    let latency = Arc::new(LatencyTracker::new(50));
    (
        WorkerSupervisor::new(&settings.worker, stats.clone(), latency),
        stats,
    )
}

fn ask_payload(question: &str) -> Value {
    BridgeRequest::Ask(AskRequest::new(question))
        .to_payload()
        .unwrap()
}

fn status_payload() -> Value {
    json!({"action": "status"})
}

const TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Persistent worker
// ============================================================================

#[tokio::test]
async fn test_concurrent_calls_share_one_worker() {
    let fx = Fixture::new();
    let serve = fx.script("serve.sh", SERVE_SCRIPT);
    let oneshot = fx.script("oneshot.sh", ONESHOT_SCRIPT);
    let (supervisor, stats) = supervisor(&fx.settings(Some(serve.as_path()), &oneshot));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let supervisor = supervisor.clone();
        handles.push(tokio::spawn(async move {
            supervisor.call(&status_payload(), TIMEOUT).await
        }));
    }
    let mut pids = Vec::new();
    for handle in handles {
        pids.push(handle.await.unwrap().unwrap()["pid"].clone());
    }

    assert!(pids.windows(2).all(|w| w[0] == w[1]), "{pids:?}");
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.worker_starts, 1);
    assert_eq!(snapshot.worker_requests, 5);
    assert!(supervisor.is_running());

    let info = supervisor.worker_info().unwrap();
    assert!(info.running);
    assert_eq!(info.executable, "/bin/sh");
    supervisor.shutdown();
}

#[tokio::test]
async fn test_responses_are_matched_out_of_order() {
    let fx = Fixture::new();
    let serve = fx.script("serve.sh", SERVE_SCRIPT);
    let oneshot = fx.script("oneshot.sh", ONESHOT_SCRIPT);
    let (supervisor, _) = supervisor(&fx.settings(Some(serve.as_path()), &oneshot));

    // Start the worker first so both calls race on a live process.
    supervisor.call(&status_payload(), TIMEOUT).await.unwrap();

    let slow_sup = supervisor.clone();
    let slow = tokio::spawn(async move { slow_sup.call(&ask_payload("slow one"), TIMEOUT).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let fast = supervisor.call(&ask_payload("quick one"), TIMEOUT).await.unwrap();
    assert_eq!(fast["answer"], "pong");
    assert!(started.elapsed() < Duration::from_millis(800));

    let slow = slow.await.unwrap().unwrap();
    assert_eq!(slow["answer"], "slow");
    supervisor.shutdown();
}

#[tokio::test]
async fn test_call_timeout_leaves_worker_running() {
    let fx = Fixture::new();
    let serve = fx.script("serve.sh", SERVE_SCRIPT);
    let oneshot = fx.script("oneshot.sh", ONESHOT_SCRIPT);
    let (supervisor, stats) = supervisor(&fx.settings(Some(serve.as_path()), &oneshot));

    let before = supervisor.call(&status_payload(), TIMEOUT).await.unwrap();
    let err = supervisor
        .call(&ask_payload("slow again"), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(err, BridgeError::timeout(WORKER_CALL, Duration::from_millis(100)));

    let after = supervisor.call(&status_payload(), TIMEOUT).await.unwrap();
    assert_eq!(before["pid"], after["pid"]);
    assert_eq!(stats.snapshot().worker_starts, 1);
    supervisor.shutdown();
}

#[tokio::test]
async fn test_worker_not_reading_input_times_out_and_is_stopped() {
    let fx = Fixture::new();
    let mute = fx.script("mute.sh", MUTE_SCRIPT);
    let oneshot = fx.script("oneshot.sh", ONESHOT_SCRIPT);
    let (supervisor, stats) = supervisor(&fx.settings(Some(mute.as_path()), &oneshot));

    let started = Instant::now();
    let err = tokio::time::timeout(
        Duration::from_secs(3),
        supervisor.call(&ask_payload(&oversized_question()), Duration::from_millis(300)),
    )
    .await
    .expect("call outlived its timeout")
    .unwrap_err();
    assert!(matches!(err, BridgeError::Io(_)), "{err}");
    assert!(started.elapsed() < Duration::from_secs(2));

    for _ in 0..100 {
        if stats.snapshot().worker_exits == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!supervisor.is_running());
    assert_eq!(stats.snapshot().worker_exits, 1);
    supervisor.shutdown();
}

#[tokio::test]
async fn test_stalled_write_does_not_outlive_bridge_timeout() {
    let fx = Fixture::new();
    let mute = fx.script("mute.sh", MUTE_SCRIPT);
    let bridge = Bridge::new(&fx.settings(Some(mute.as_path()), &mute));

    let started = Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_secs(3),
        bridge.call(
            BridgeRequest::Ask(AskRequest::new(oversized_question())),
            Some(Duration::from_millis(300)),
        ),
    )
    .await
    .expect("call outlived its timeout");
    assert!(outcome.is_err());
    assert!(started.elapsed() < Duration::from_secs(2));
    bridge.shutdown();
}

#[tokio::test]
async fn test_worker_exit_rejects_pending_and_restarts() {
    let fx = Fixture::new();
    let serve = fx.script("serve.sh", SERVE_SCRIPT);
    let oneshot = fx.script("oneshot.sh", ONESHOT_SCRIPT);
    let (supervisor, stats) = supervisor(&fx.settings(Some(serve.as_path()), &oneshot));

    let first = supervisor.call(&status_payload(), TIMEOUT).await.unwrap();

    let slow_sup = supervisor.clone();
    let orphaned = tokio::spawn(async move { slow_sup.call(&ask_payload("slow"), TIMEOUT).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = supervisor.call(&ask_payload("die now"), TIMEOUT).await.unwrap_err();
    assert!(err.is_worker_exited(), "{err}");
    let err = orphaned.await.unwrap().unwrap_err();
    assert!(err.is_worker_exited(), "{err}");
    assert!(err.to_string().contains("code 3"), "{err}");

    let second = supervisor.call(&status_payload(), TIMEOUT).await.unwrap();
    assert_ne!(first["pid"], second["pid"]);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.worker_starts, 2);
    assert_eq!(snapshot.worker_restarts, 1);
    assert_eq!(snapshot.worker_exits, 1);
    supervisor.shutdown();
}

#[tokio::test]
async fn test_application_error_from_worker() {
    let fx = Fixture::new();
    let serve = fx.script("serve.sh", SERVE_SCRIPT);
    let oneshot = fx.script("oneshot.sh", ONESHOT_SCRIPT);
    let bridge = Bridge::new(&fx.settings(Some(serve.as_path()), &oneshot));

    let err = bridge.ask(AskRequest::new("fail please")).await.unwrap_err();
    assert_eq!(err, BridgeError::Application("knowledge base is empty".into()));
    assert_eq!(bridge.stats().fallback_requests, 0);
    bridge.shutdown();
}

#[tokio::test]
async fn test_source_change_restarts_worker_and_clears_cache() {
    let fx = Fixture::new();
    let serve = fx.script("serve.sh", SERVE_SCRIPT);
    let oneshot = fx.script("oneshot.sh", ONESHOT_SCRIPT);
    let mut settings = fx.settings(Some(serve.as_path()), &oneshot);
    settings.worker.watch_paths = vec![serve.display().to_string()];
    let bridge = Bridge::new(&settings);

    let answer = bridge.ask(AskRequest::new("hello")).await.unwrap();
    assert_eq!(answer["answer"], "pong");
    let first_pid = answer["pid"].clone();
    assert_eq!(bridge.health().cache_entries, 1);

    let file = std::fs::File::options().write(true).open(&serve).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(10))
        .unwrap();
    drop(file);

    let status = bridge.status().await.unwrap();
    assert_ne!(status["pid"], first_pid);

    let health = bridge.health();
    assert_eq!(health.stats.code_reloads, 1);
    assert_eq!(health.cache_entries, 0);
    assert_eq!(health.stats.worker_starts, 2);
    bridge.shutdown();
}

#[tokio::test]
async fn test_source_change_without_running_worker_is_not_a_reload() {
    let fx = Fixture::new();
    let serve = fx.script("serve.sh", SERVE_SCRIPT);
    let oneshot = fx.script("oneshot.sh", ONESHOT_SCRIPT);
    let mut settings = fx.settings(Some(serve.as_path()), &oneshot);
    settings.worker.watch_paths = vec![serve.display().to_string()];
    let bridge = Bridge::new(&settings);

    bridge.ask(AskRequest::new("hello")).await.unwrap();
    // The worker dies and the call is answered by a one-shot process.
    bridge.ask(AskRequest::new("die now")).await.unwrap();
    for _ in 0..100 {
        if bridge.stats().worker_exits == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(bridge.stats().worker_exits, 1);
    let cached = bridge.health().cache_entries;

    let file = std::fs::File::options().write(true).open(&serve).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(10))
        .unwrap();
    drop(file);

    bridge.status().await.unwrap();
    let health = bridge.health();
    assert_eq!(health.stats.code_reloads, 0);
    assert_eq!(health.cache_entries, cached);
    assert_eq!(health.stats.worker_starts, 2);
    bridge.shutdown();
}

#[tokio::test]
async fn test_noise_on_stdout_is_ignored() {
    let fx = Fixture::new();
    let serve = fx.script("serve.sh", SERVE_SCRIPT);
    let oneshot = fx.script("oneshot.sh", ONESHOT_SCRIPT);
    let (supervisor, _) = supervisor(&fx.settings(Some(serve.as_path()), &oneshot));

    // The default branch prints a non-JSON line before each answer.
    for question in ["a", "b", "c"] {
        let answer = supervisor.call(&ask_payload(question), TIMEOUT).await.unwrap();
        assert_eq!(answer["answer"], "pong");
    }
    supervisor.shutdown();
}

// ============================================================================
// Fallback
// ============================================================================

#[tokio::test]
async fn test_crashing_worker_degrades_to_oneshot() {
    let fx = Fixture::new();
    let crash = fx.script("crash.sh", CRASH_SCRIPT);
    let oneshot = fx.script("oneshot.sh", ONESHOT_SCRIPT);
    let bridge = Bridge::new(&fx.settings(Some(crash.as_path()), &oneshot));

    let answer = bridge.ask(AskRequest::new("hello")).await.unwrap();
    assert_eq!(answer["answer"], "oneshot");

    let health = bridge.health();
    assert_eq!(health.stats.worker_failures, 1);
    assert_eq!(health.stats.fallback_requests, 1);
    assert_eq!(health.stats.fallback_failures, 0);
    assert!(health.latency.contains_key("fallback.call"));
    bridge.shutdown();
}

#[tokio::test]
async fn test_no_candidates_is_unavailable_without_hanging() {
    let fx = Fixture::new();
    let oneshot = fx.script("oneshot.sh", ONESHOT_SCRIPT);
    let mut settings = fx.settings(Some(oneshot.as_path()), &oneshot);
    settings.worker.candidates.clear();
    let bridge = Bridge::new(&settings);

    let started = Instant::now();
    let err = bridge
        .call(
            BridgeRequest::Ask(AskRequest::new("anyone?")),
            Some(Duration::from_secs(2)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Unavailable(_)), "{err}");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_missing_executable_is_unavailable() {
    let fx = Fixture::new();
    let oneshot = fx.script("oneshot.sh", ONESHOT_SCRIPT);
    let mut settings = fx.settings(None, &oneshot);
    settings.worker.candidates = vec!["/nonexistent/askbridge-worker".to_string()];
    let bridge = Bridge::new(&settings);

    let err = bridge.status().await.unwrap_err();
    assert!(matches!(err, BridgeError::Unavailable(_)), "{err}");
    assert!(err.to_string().contains("was not found"), "{err}");
    assert_eq!(bridge.stats().fallback_failures, 1);
}

#[tokio::test]
async fn test_oneshot_skips_missing_candidate() {
    let fx = Fixture::new();
    let oneshot = fx.script("oneshot.sh", ONESHOT_SCRIPT);
    let mut settings = fx.settings(None, &oneshot);
    settings.worker.candidates = vec![
        "/nonexistent/askbridge-worker".to_string(),
        "/bin/sh".to_string(),
    ];
    let bridge = Bridge::new(&settings);

    let status = bridge.status().await.unwrap();
    assert_eq!(status["status"], "oneshot");
}

#[tokio::test]
async fn test_oneshot_bad_output_is_protocol_error() {
    let fx = Fixture::new();
    let oneshot = fx.script("oneshot.sh", "cat >/dev/null\necho 'hello from worker'\n");
    let bridge = Bridge::new(&fx.settings(None, &oneshot));

    let err = bridge.status().await.unwrap_err();
    assert!(matches!(err, BridgeError::Protocol(_)), "{err}");
}

#[tokio::test]
async fn test_oneshot_crash_is_normalized() {
    let fx = Fixture::new();
    let oneshot = fx.script("oneshot.sh", CRASH_SCRIPT);
    let bridge = Bridge::new(&fx.settings(None, &oneshot));

    let err = bridge.ask(AskRequest::new("hello")).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "worker is missing a dependency (`openai`); install the worker's requirements"
    );
}

#[tokio::test]
async fn test_oneshot_timeout_kills_process() {
    let fx = Fixture::new();
    let oneshot = fx.script("oneshot.sh", "cat >/dev/null\nsleep 5\n");
    let bridge = Bridge::new(&fx.settings(None, &oneshot));

    let started = Instant::now();
    let err = bridge
        .call(BridgeRequest::Status, Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert_eq!(err, BridgeError::timeout(FALLBACK_CALL, Duration::from_millis(200)));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_oneshot_not_reading_input_times_out() {
    let fx = Fixture::new();
    let mute = fx.script("mute.sh", MUTE_SCRIPT);
    let bridge = Bridge::new(&fx.settings(None, &mute));

    let started = Instant::now();
    let err = tokio::time::timeout(
        Duration::from_secs(3),
        bridge.call(
            BridgeRequest::Ask(AskRequest::new(oversized_question())),
            Some(Duration::from_millis(300)),
        ),
    )
    .await
    .expect("call outlived its timeout")
    .unwrap_err();
    assert_eq!(err, BridgeError::timeout(FALLBACK_CALL, Duration::from_millis(300)));
    assert!(started.elapsed() < Duration::from_secs(2));
}
