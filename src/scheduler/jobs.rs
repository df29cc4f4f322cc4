//! Job registry and periodic runner.
//!
//! The registry is created once at startup and shared by reference; it records
//! the state of every periodic pass for the status endpoint.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Registered with an interval, not yet run.
    Idle,
    Running,
    Succeeded,
    Failed,
    /// Periodic execution disabled by configuration.
    Disabled,
}

/// Snapshot of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub state: JobState,
    pub interval_secs: Option<u64>,
    pub runs: u64,
    pub failures: u64,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_summary: Option<String>,
    pub last_error: Option<String>,
}

impl JobStatus {
    fn new(name: &str, interval: Option<Duration>) -> Self {
        Self {
            name: name.to_string(),
            state: if interval.is_some() {
                JobState::Idle
            } else {
                JobState::Disabled
            },
            interval_secs: interval.map(|d| d.as_secs()),
            runs: 0,
            failures: 0,
            last_started_at: None,
            last_finished_at: None,
            last_summary: None,
            last_error: None,
        }
    }
}

/// Registry of job states. Never reset implicitly.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<BTreeMap<String, JobStatus>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, BTreeMap<String, JobStatus>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, name: &str, interval: Option<Duration>) {
        self.jobs()
            .insert(name.to_string(), JobStatus::new(name, interval));
    }

    pub fn mark_started(&self, name: &str) {
        let mut jobs = self.jobs();
        let job = jobs
            .entry(name.to_string())
            .or_insert_with(|| JobStatus::new(name, None));
        job.state = JobState::Running;
        job.last_started_at = Some(Utc::now());
    }

    pub fn mark_finished(&self, name: &str, outcome: Result<String, String>) {
        let mut jobs = self.jobs();
        let job = jobs
            .entry(name.to_string())
            .or_insert_with(|| JobStatus::new(name, None));
        job.runs += 1;
        job.last_finished_at = Some(Utc::now());
        match outcome {
            Ok(summary) => {
                job.state = JobState::Succeeded;
                job.last_summary = Some(summary);
                job.last_error = None;
            }
            Err(error) => {
                job.state = JobState::Failed;
                job.failures += 1;
                job.last_error = Some(error);
            }
        }
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<JobStatus> {
        self.jobs().get(name).cloned()
    }

    /// All jobs ordered by name.
    pub fn snapshot(&self) -> Vec<JobStatus> {
        self.jobs().values().cloned().collect()
    }
}

/// Runs tasks on fixed intervals, recording each run in the registry.
pub struct PeriodicRunner {
    registry: Arc<JobRegistry>,
    stop_tx: broadcast::Sender<()>,
}

impl PeriodicRunner {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self { registry, stop_tx }
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }

    /// Run `task` every `interval`, starting immediately. Each run is awaited
    /// before the next tick so a job never overlaps itself; missed ticks are
    /// skipped. `None` registers the job as disabled and spawns nothing.
    pub fn run_periodic<F, Fut>(&self, name: &'static str, interval: Option<Duration>, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.registry.register(name, interval);

        let Some(interval) = interval else {
            tracing::info!("Jobs: periodic execution disabled for {}", name);
            return;
        };

        tracing::info!("Jobs: scheduling {} every {:?}", name, interval);
        let registry = self.registry.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => {
                        run_once(&registry, name, &task).await;
                    }
                }
            }

            tracing::info!("Jobs: {} stopped", name);
        });
    }

    /// Stop all periodic jobs after their current run.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

/// Run a task once and record the result.
pub async fn run_once<F, Fut>(registry: &JobRegistry, name: &str, task: &F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    registry.mark_started(name);
    let outcome = task().await;
    match &outcome {
        Ok(summary) => tracing::debug!("Jobs: {} finished: {}", name, summary),
        Err(e) => tracing::error!("Jobs: {} failed: {}", name, e),
    }
    registry.mark_finished(name, outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_registry_records_runs() {
        let registry = JobRegistry::new();
        registry.register("checks", Some(Duration::from_secs(60)));
        registry.register("rollup", None);

        assert_eq!(registry.get("checks").unwrap().state, JobState::Idle);
        assert_eq!(registry.get("rollup").unwrap().state, JobState::Disabled);

        registry.mark_started("checks");
        assert_eq!(registry.get("checks").unwrap().state, JobState::Running);
        registry.mark_finished("checks", Ok("checked=3".to_string()));
        registry.mark_started("checks");
        registry.mark_finished("checks", Err("db locked".to_string()));

        let job = registry.get("checks").unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.runs, 2);
        assert_eq!(job.failures, 1);
        assert_eq!(job.last_summary.as_deref(), Some("checked=3"));
        assert_eq!(job.last_error.as_deref(), Some("db locked"));

        let names: Vec<String> = registry.snapshot().into_iter().map(|j| j.name).collect();
        assert_eq!(names, vec!["checks", "rollup"]);
    }

    #[test]
    fn test_run_once_records_success() {
        let registry = JobRegistry::new();
        tokio_test::block_on(run_once(&registry, "adhoc", &|| async {
            Ok::<_, String>("done".to_string())
        }));
        let job = registry.get("adhoc").unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.runs, 1);
    }

    #[tokio::test]
    async fn test_periodic_runs_until_stopped() {
        let registry = Arc::new(JobRegistry::new());
        let runner = PeriodicRunner::new(registry.clone());
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        runner.run_periodic("tick", Some(Duration::from_millis(20)), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok("ok".to_string())
            }
        });
        runner.run_periodic("off", None, || async { Ok(String::new()) });

        tokio::time::sleep(Duration::from_millis(150)).await;
        runner.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_stop = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(after_stop >= 2);
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);
        assert_eq!(registry.get("off").unwrap().state, JobState::Disabled);
        assert_eq!(registry.get("off").unwrap().runs, 0);
        assert!(registry.get("tick").unwrap().runs >= 2);
    }
}
