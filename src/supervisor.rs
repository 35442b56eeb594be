//! Worker supervisor (spec §4.G). Holds a registry of long-running
//! tasks and restarts them with exponential backoff on failure, with
//! crash-loop quarantine.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Permanent,
    OnFailure,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub crash_loop_threshold: u32,
    pub crash_loop_window: Duration,
    pub drain_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(300),
            crash_loop_threshold: 5,
            crash_loop_window: Duration::from_secs(600),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

type Runner = Box<dyn Fn(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

pub struct TaskSpec {
    pub name: String,
    pub policy: RestartPolicy,
    pub runner: Runner,
}

impl TaskSpec {
    pub fn new<F, Fut>(name: impl Into<String>, policy: RestartPolicy, runner: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            policy,
            runner: Box::new(move |token| Box::pin(runner(token))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Quarantined,
    Stopped,
}

/// Supervises a single task's restart lifecycle. The consecutive-crash
/// counter resets once a run survives at least `10 * min_backoff` (spec
/// §4.G); crash timestamps older than `crash_loop_window` also age out
/// of the threshold count.
struct TaskRuntime {
    name: String,
    policy: RestartPolicy,
    consecutive_crashes: u32,
    crash_times: Vec<std::time::Instant>,
    current_backoff: Duration,
    state: TaskState,
}

impl TaskRuntime {
    fn new(name: String, policy: RestartPolicy, min_backoff: Duration) -> Self {
        Self {
            name,
            policy,
            consecutive_crashes: 0,
            crash_times: Vec::new(),
            current_backoff: min_backoff,
            state: TaskState::Running,
        }
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    tasks: Mutex<Vec<Arc<Mutex<TaskRuntime>>>>,
    shutdown: CancellationToken,
    metrics_restarts: metrics::Counter,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            metrics_restarts: metrics::counter!("supervisor_task_restarts_total"),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawns `spec` as a supervised `tokio` task. Returns immediately;
    /// the restart loop runs in the background for the life of the
    /// process (or until [`Supervisor::shutdown`]).
    pub async fn spawn(self: &Arc<Self>, spec: TaskSpec) {
        let runtime = Arc::new(Mutex::new(TaskRuntime::new(
            spec.name.clone(),
            spec.policy,
            self.config.min_backoff,
        )));
        self.tasks.lock().await.push(runtime.clone());

        let this = self.clone();
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            this.run_loop(runtime, spec.runner, token).await;
        });
    }

    async fn run_loop(self: Arc<Self>, runtime: Arc<Mutex<TaskRuntime>>, runner: Runner, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                let mut rt = runtime.lock().await;
                rt.state = TaskState::Stopped;
                return;
            }

            let name = runtime.lock().await.name.clone();
            let started_at = std::time::Instant::now();
            let result = runner(token.clone()).await;

            if token.is_cancelled() {
                let mut rt = runtime.lock().await;
                rt.state = TaskState::Stopped;
                return;
            }

            let mut rt = runtime.lock().await;
            match result {
                Ok(()) if rt.policy == RestartPolicy::OnFailure => {
                    info!(task = %name, "task exited normally");
                    rt.state = TaskState::Stopped;
                    return;
                }
                Ok(()) => {
                    // Permanent relaunches even on a clean exit (spec §4.G
                    // supervision-tree semantics); a normal exit is not a
                    // crash, so counters and backoff reset rather than climb.
                    info!(task = %name, "permanent task exited normally, relaunching");
                    rt.consecutive_crashes = 0;
                    rt.crash_times.clear();
                    rt.current_backoff = self.config.min_backoff;
                    drop(rt);
                    tokio::select! {
                        _ = token.cancelled() => {
                            runtime.lock().await.state = TaskState::Stopped;
                            return;
                        }
                        _ = tokio::task::yield_now() => {}
                    }
                }
                Err(e) => {
                    error!(task = %name, error = %e, "task failed");
                    // Both policies relaunch on failure (spec §4.G: "if failure
                    // and policy allows"); only a clean `Ok(())` under `OnFailure`
                    // ends the task permanently (handled above).

                    let survived = started_at.elapsed() >= self.config.min_backoff * 10;
                    if survived {
                        rt.consecutive_crashes = 0;
                        rt.crash_times.clear();
                        rt.current_backoff = self.config.min_backoff;
                    }

                    rt.consecutive_crashes += 1;
                    let now = std::time::Instant::now();
                    rt.crash_times.push(now);
                    rt.crash_times.retain(|t| now.duration_since(*t) <= self.config.crash_loop_window);

                    if rt.crash_times.len() as u32 >= self.config.crash_loop_threshold {
                        rt.state = TaskState::Quarantined;
                        error!(task = %name, crashes = rt.crash_times.len(), "crash-loop threshold reached, quarantining task");
                        return;
                    }

                    let backoff = rt.current_backoff;
                    rt.current_backoff = (rt.current_backoff * 2).min(self.config.max_backoff);
                    self.metrics_restarts.increment(1);
                    drop(rt);

                    warn!(task = %name, backoff_ms = backoff.as_millis() as u64, "restarting task after backoff");
                    tokio::select! {
                        _ = token.cancelled() => {
                            runtime.lock().await.state = TaskState::Stopped;
                            return;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    /// Signals cancellation to all tasks, waits up to `drain_timeout`,
    /// then returns (tasks that ignore cancellation are abandoned —
    /// `tokio` has no hard task-kill; the process exit is the backstop,
    /// matching spec §4.G's "force-terminate" intent for an in-process
    /// supervisor).
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let deadline = tokio::time::sleep(self.config.drain_timeout);
        tokio::pin!(deadline);
        loop {
            let all_stopped = {
                let tasks = self.tasks.lock().await;
                let mut stopped = true;
                for t in tasks.iter() {
                    if t.lock().await.state == TaskState::Running {
                        stopped = false;
                        break;
                    }
                }
                stopped
            };
            if all_stopped {
                return;
            }
            tokio::select! {
                _ = &mut deadline => {
                    warn!("supervisor drain timeout elapsed; remaining tasks abandoned");
                    return;
                }
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }

    pub async fn task_states(&self) -> Vec<(String, TaskState)> {
        let tasks = self.tasks.lock().await;
        let mut out = Vec::with_capacity(tasks.len());
        for t in tasks.iter() {
            let rt = t.lock().await;
            out.push((rt.name.clone(), rt.state));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn crash_loop_quarantines_after_threshold() {
        let config = SupervisorConfig {
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            crash_loop_threshold: 3,
            crash_loop_window: Duration::from_secs(600),
            drain_timeout: Duration::from_millis(50),
        };
        let sup = Supervisor::new(config);
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        sup.spawn(TaskSpec::new("flaky", RestartPolicy::OnFailure, move |_token| {
            let a = a.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("boom")
            }
        }))
        .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        let states = sup.task_states().await;
        assert_eq!(states[0].1, TaskState::Quarantined);
        assert!(attempts.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn permanent_policy_relaunches_after_failure() {
        let sup = Supervisor::new(SupervisorConfig {
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            crash_loop_threshold: 100,
            ..Default::default()
        });
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        sup.spawn(TaskSpec::new("permanent-flush", RestartPolicy::Permanent, move |_token| {
            let a = a.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("flush failed")
            }
        }))
        .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(attempts.load(Ordering::SeqCst) >= 3, "a Permanent task must relaunch after Err, not stop");
    }

    #[tokio::test]
    async fn permanent_policy_relaunches_after_clean_exit() {
        let sup = Supervisor::new(SupervisorConfig {
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            ..Default::default()
        });
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        sup.spawn(TaskSpec::new("permanent-one-shot", RestartPolicy::Permanent, move |_token| {
            let r = r.clone();
            async move {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
        .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runs.load(Ordering::SeqCst) >= 3, "a Permanent task must relaunch after a clean exit");
    }

    #[tokio::test]
    async fn normal_exit_does_not_restart() {
        let sup = Supervisor::new(SupervisorConfig {
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            ..Default::default()
        });
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        sup.spawn(TaskSpec::new("one-shot", RestartPolicy::OnFailure, move |_token| {
            let r = r.clone();
            async move {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
        .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let states = sup.task_states().await;
        assert_eq!(states[0].1, TaskState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_stops_a_long_running_task() {
        let sup = Supervisor::new(SupervisorConfig::default());
        sup.spawn(TaskSpec::new("long-runner", RestartPolicy::Permanent, |token| async move {
            token.cancelled().await;
            Ok(())
        }))
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        sup.shutdown().await;
        let states = sup.task_states().await;
        assert_eq!(states[0].1, TaskState::Stopped);
    }
}
