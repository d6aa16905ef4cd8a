//! Watchdog timeout tests against real child processes.
//!
//! A shell stand-in plays the wrapped CLI so the kill path is exercised on
//! actual processes, not mocks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use drover::backend::ClaudeBackend;
use drover::config::{Config, Overrides, RunConfig};
use drover::scheduler::Scheduler;

use crate::fixtures::{collecting_sink, tasklist};

fn write_script(path: &Path, content: &str) {
    std::fs::write(path, content).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

fn timeout_config(timeout_secs: f64, retry_on_timeout: bool) -> RunConfig {
    let mut config = Config::default();
    config.max_parallel_tasks = Some(1);
    config.task_timeout_secs = Some(timeout_secs);
    config.rate_limit.max_retries = 2;
    config.rate_limit.base_delay_secs = 0.001;
    config.rate_limit.max_delay_secs = 0.01;
    config.rate_limit.retry_on_timeout = retry_on_timeout;
    config.resolve(&Overrides::default()).unwrap()
}

fn backend_for(script: &Path, config: &RunConfig) -> Arc<ClaudeBackend> {
    Arc::new(ClaudeBackend::from_config(config).with_binary(script.to_string_lossy().to_string()))
}

/// Scenario: timeout=0.1s against a deliberately slow child.
/// Then the task records a timeout failure within a small bound above
/// 0.1s, and the child process is terminated, not orphaned.
#[tokio::test]
async fn test_slow_child_times_out_and_dies() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile: PathBuf = dir.path().join("child.pid");
    let script = dir.path().join("fake-agent");
    // exec keeps the PID stable so the kill provably lands on the sleeper.
    write_script(
        &script,
        &format!("#!/bin/sh\necho $$ > {}\nexec sleep 30\n", pidfile.display()),
    );

    let config = timeout_config(0.1, false);
    let backend = backend_for(&script, &config);
    let (list, tasks) = tasklist("- [ ] Slow task\n");
    let (sink, rx) = collecting_sink();
    let scheduler = Scheduler::new(backend, config, sink, list);

    let start = Instant::now();
    let summary = scheduler.run(tasks).await.unwrap();
    let elapsed = start.elapsed();
    drop(scheduler);
    drop(rx);

    assert_eq!(summary.failed(), vec!["Slow task"]);
    let result = &summary.results[0];
    assert!(
        result.error.as_deref().unwrap_or("").contains("timed out"),
        "error was: {:?}",
        result.error
    );
    assert!(result.duration >= Duration::from_millis(100));
    assert!(
        elapsed < Duration::from_secs(5),
        "run took {:?}, watchdog never fired",
        elapsed
    );

    // The child wrote its PID before sleeping; after the kill it must be
    // gone.
    let pid: u32 = std::fs::read_to_string(&pidfile)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    #[cfg(target_os = "linux")]
    assert!(
        !Path::new(&format!("/proc/{}", pid)).exists(),
        "child {} is still running",
        pid
    );
}

/// A fast child under a generous timeout completes normally; the watchdog
/// exits without acting.
#[tokio::test]
async fn test_fast_child_unaffected_by_watchdog() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("fake-agent");
    write_script(
        &script,
        "#!/bin/sh\n\
         echo '{\"type\":\"result\",\"subtype\":\"success\",\"is_error\":false,\"result\":\"ok\"}'\n",
    );

    let config = timeout_config(10.0, false);
    let backend = backend_for(&script, &config);
    let (list, tasks) = tasklist("- [ ] Quick task\n");
    let (sink, rx) = collecting_sink();
    let scheduler = Scheduler::new(backend, config, sink, list);

    let summary = scheduler.run(tasks).await.unwrap();
    drop(scheduler);
    drop(rx);

    assert_eq!(summary.succeeded(), vec!["Quick task"]);
}

/// With retry_on_timeout enabled, a task that times out once and then
/// completes ends `success`.
#[tokio::test]
async fn test_timeout_retried_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("first-attempt-done");
    let script = dir.path().join("fake-agent");
    // First invocation hangs and gets killed; later ones succeed.
    write_script(
        &script,
        &format!(
            "#!/bin/sh\n\
             if [ -f {marker} ]; then\n\
             echo '{{\"type\":\"result\",\"subtype\":\"success\",\"is_error\":false}}'\n\
             exit 0\n\
             fi\n\
             touch {marker}\n\
             exec sleep 30\n",
            marker = marker.display()
        ),
    );

    let config = timeout_config(0.2, true);
    let backend = backend_for(&script, &config);
    let (list, tasks) = tasklist("- [ ] Eventually quick\n");
    let (sink, rx) = collecting_sink();
    let scheduler = Scheduler::new(backend, config, sink, list);

    let summary = scheduler.run(tasks).await.unwrap();
    drop(scheduler);
    drop(rx);

    assert_eq!(summary.succeeded(), vec!["Eventually quick"]);
    assert!(marker.exists());
}
