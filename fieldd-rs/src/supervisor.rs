/* Worker supervision.
 *
 * Each named worker runs as its own process (a re-exec of the daemon
 * binary with a worker subcommand) so a crash cannot corrupt its
 * peers. The supervisor restarts failed workers under a bounded
 * respawn policy: failures within the `respawn_reset` window
 * accumulate, and hitting `max_respawns` is fatal for the whole
 * daemon. Shutdown is graceful-then-forceful: SIGTERM, then SIGKILL
 * after `terminate_timeout`. */

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::error::RuntimeError;

pub const DEFAULT_MAX_RESPAWNS: u32 = 3;
pub const DEFAULT_RESPAWN_RESET: Duration = Duration::from_secs(120);
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/* Period of the liveness line in the supervisor log. */
const MONITOR_LOG_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub max_respawns: u32,
    pub respawn_reset: Duration,
    pub terminate_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_respawns: DEFAULT_MAX_RESPAWNS,
            respawn_reset: DEFAULT_RESPAWN_RESET,
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    specs: Vec<WorkerSpec>,
    shutdown_tx: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            specs: Vec::new(),
            shutdown_tx,
        }
    }

    pub fn add(&mut self, name: impl Into<String>, program: PathBuf, args: Vec<String>) {
        self.specs.push(WorkerSpec {
            name: name.into(),
            program,
            args,
        });
    }

    /* Begin a graceful shutdown of every worker. */
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /* Run every worker's restart loop to completion. Returns the first
     * fatal supervision error, after tearing the other workers down. */
    pub async fn run(self: Arc<Self>) -> Result<(), RuntimeError> {
        let mut monitors = JoinSet::new();
        for spec in self.specs.clone() {
            let supervisor = Arc::clone(&self);
            let shutdown_rx = self.shutdown_tx.subscribe();
            monitors.spawn(async move { supervisor.monitor_worker(spec, shutdown_rx).await });
        }

        let worker_count = self.specs.len();
        let stats = tokio::spawn(async move {
            let mut ticks = IntervalStream::new(tokio::time::interval(MONITOR_LOG_PERIOD));
            while ticks.next().await.is_some() {
                debug!(workers = worker_count, "supervising");
            }
        });

        let mut result = Ok(());
        while let Some(joined) = monitors.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(%err, "fatal supervision failure, shutting down peers");
                    if result.is_ok() {
                        result = Err(err);
                    }
                    self.shutdown();
                }
                Err(err) => warn!(%err, "worker monitor panicked"),
            }
        }
        stats.abort();
        result
    }

    /* One worker's restart loop. */
    async fn monitor_worker(
        &self,
        spec: WorkerSpec,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), RuntimeError> {
        let mut failures = 0u32;
        loop {
            if *shutdown_rx.borrow() {
                return Ok(());
            }
            let started = Instant::now();
            let mut child = match Command::new(&spec.program).args(&spec.args).spawn() {
                Ok(child) => child,
                Err(err) => {
                    error!(worker = %spec.name, %err, "cannot spawn worker");
                    return Err(RuntimeError::SupervisionFailure {
                        worker: spec.name.clone(),
                        failures: failures + 1,
                    });
                }
            };
            info!(worker = %spec.name, pid = child.id(), "worker started");

            tokio::select! {
                status = child.wait() => {
                    /* An interval longer than the reset window clears
                     * the counter. */
                    if started.elapsed() > self.config.respawn_reset {
                        failures = 0;
                    }
                    failures += 1;
                    match status {
                        Ok(status) => warn!(
                            worker = %spec.name,
                            %status,
                            failures,
                            "worker exited"
                        ),
                        Err(err) => warn!(worker = %spec.name, %err, failures, "worker lost"),
                    }
                    if failures >= self.config.max_respawns {
                        return Err(RuntimeError::SupervisionFailure {
                            worker: spec.name.clone(),
                            failures,
                        });
                    }
                    info!(worker = %spec.name, "respawning worker");
                }
                _ = shutdown_rx.changed() => {
                    self.stop_child(&spec.name, &mut child).await;
                    return Ok(());
                }
            }
        }
    }

    /* SIGTERM, wait out the timeout, then SIGKILL. */
    async fn stop_child(&self, name: &str, child: &mut Child) {
        if let Some(pid) = child.id() {
            info!(worker = %name, pid, "terminating worker");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        match tokio::time::timeout(self.config.terminate_timeout, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(worker = %name, "worker ignored SIGTERM, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_worker(name: &str, script: &str) -> WorkerSpec {
        WorkerSpec {
            name: name.to_string(),
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn supervisor(config: SupervisorConfig, specs: Vec<WorkerSpec>) -> Arc<Supervisor> {
        let mut supervisor = Supervisor::new(config);
        for spec in specs {
            supervisor.add(spec.name.clone(), spec.program, spec.args);
        }
        Arc::new(supervisor)
    }

    #[tokio::test]
    async fn test_repeated_failures_are_fatal() {
        let sup = supervisor(
            SupervisorConfig {
                max_respawns: 3,
                respawn_reset: Duration::from_secs(120),
                terminate_timeout: Duration::from_secs(5),
            },
            vec![shell_worker("flaky", "exit 1")],
        );
        let err = tokio::time::timeout(Duration::from_secs(30), sup.run())
            .await
            .expect("supervisor did not settle")
            .unwrap_err();
        match err {
            RuntimeError::SupervisionFailure { worker, failures } => {
                assert_eq!(worker, "flaky");
                assert_eq!(failures, 3);
            }
            other => panic!("expected SupervisionFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_is_restarted_after_one_exit() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("restarted");
        /* First run exits nonzero; the respawned run leaves a marker
         * and idles. */
        let script = format!(
            "if [ -e {m} ]; then sleep 30; else touch {m}; exit 1; fi",
            m = marker.display()
        );
        let sup = supervisor(
            SupervisorConfig::default(),
            vec![shell_worker("once", &script)],
        );
        let runner = tokio::spawn(Arc::clone(&sup).run());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !marker.exists() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "worker was not respawned"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!runner.is_finished(), "a single failure must not be fatal");

        sup.shutdown();
        tokio::time::timeout(Duration::from_secs(10), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_graceful_shutdown_terminates_workers() {
        let sup = supervisor(
            SupervisorConfig::default(),
            vec![
                shell_worker("sleepy-a", "sleep 30"),
                shell_worker("sleepy-b", "sleep 30"),
            ],
        );
        let runner = tokio::spawn(Arc::clone(&sup).run());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let begun = Instant::now();
        sup.shutdown();
        tokio::time::timeout(Duration::from_secs(10), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(begun.elapsed() < DEFAULT_TERMINATE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_sigterm_escalates_to_kill() {
        let sup = supervisor(
            SupervisorConfig {
                max_respawns: 3,
                respawn_reset: Duration::from_secs(120),
                terminate_timeout: Duration::from_secs(1),
            },
            vec![shell_worker("stubborn", "trap '' TERM; sleep 30")],
        );
        let runner = tokio::spawn(Arc::clone(&sup).run());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let begun = Instant::now();
        sup.shutdown();
        tokio::time::timeout(Duration::from_secs(10), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        /* SIGKILL lands right after the one-second grace period. */
        assert!(begun.elapsed() < Duration::from_secs(5));
    }
}
