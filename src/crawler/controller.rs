use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::crawler::runner::{CycleRunner, RunLimits};
use crate::storage::{timefmt, JobStatus, PersistError, StatusHandle};

/// Rejected control requests. The status is left untouched.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("a job is already running")]
    AlreadyRunning,

    #[error("no job is running")]
    NotRunning,

    #[error("could not record job status: {0}")]
    Persist(#[from] PersistError),
}

/// Resets the running flags when the worker ends, however it ends.
struct FinishGuard {
    status: StatusHandle,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let cleared = self.status.update(|s| {
            s.running = false;
            s.stop_requested = false;
            ((), true)
        });
        if let Err(e) = cleared {
            error!("Job ended but its status could not be cleared: {}", e);
        }
    }
}

/// Owns the process-wide job status and the single background worker
pub struct JobController {
    status: StatusHandle,
    runner: Arc<CycleRunner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl JobController {
    pub fn new(status: StatusHandle, runner: CycleRunner) -> Self {
        Self {
            status,
            runner: Arc::new(runner),
            worker: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn runner(&self) -> &CycleRunner {
        &self.runner
    }

    pub fn get_status(&self) -> JobStatus {
        self.status.read()
    }

    /// Clear a `running` flag left behind by a process that died mid-run.
    /// Only valid before any job has been started in this process.
    pub fn recover_stale(&self) -> Result<bool, PersistError> {
        self.status.update(|s| {
            if !s.running && !s.stop_requested {
                return (false, false);
            }
            warn!(
                started_at = ?s.started_at,
                "Resetting job status left running by a previous process"
            );
            s.running = false;
            s.stop_requested = false;
            (true, true)
        })
    }

    /// Mark the job running and launch the worker. `cycles == 0` runs until
    /// stopped or the duration is exhausted; a non-positive `hours` means no
    /// duration limit. Nothing is launched unless `running` was persisted.
    pub fn request_start(&self, cycles: u32, hours: Option<f64>) -> Result<JobStatus, ControlError> {
        let limits = RunLimits {
            cycles,
            hours: hours.filter(|h| *h > 0.0),
        };
        let status = self.status.update(|s| {
            if s.running {
                return (Err(ControlError::AlreadyRunning), false);
            }
            s.running = true;
            s.started_at = Some(timefmt::now());
            s.cycles = limits.cycles;
            s.hours = limits.hours;
            s.stop_requested = false;
            (Ok(s.clone()), true)
        })??;

        self.spawn_worker(limits);
        Ok(status)
    }

    /// Ask the worker to stop before its next cycle.
    pub fn request_stop(&self) -> Result<JobStatus, ControlError> {
        self.status.update(|s| {
            if !s.running {
                return (Err(ControlError::NotRunning), false);
            }
            s.stop_requested = true;
            (Ok(s.clone()), true)
        })?
    }

    fn spawn_worker(&self, limits: RunLimits) {
        let runner = self.runner.clone();
        let status = self.status.clone();
        let run_id = Uuid::new_v4();

        let handle = tokio::spawn(
            async move {
                let _finish = FinishGuard { status: status.clone() };
                info!("Job started");
                match runner.run(limits, &status).await {
                    Ok(summary) => info!(
                        outcome = ?summary.outcome,
                        cycles = summary.executed,
                        "Job ended"
                    ),
                    Err(e) => error!("Job failed: {}", e),
                }
            }
            .instrument(info_span!("job", %run_id)),
        );

        let mut worker = self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *worker = Some(handle);
    }

    /// Wait for the current worker, if any, to finish.
    pub async fn wait_idle(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Job worker panicked: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::fakes::{page, runner, FakeSite};
    use crate::storage::StatusStore;
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    fn controller(site: &FakeSite, temp: &TempDir) -> Arc<JobController> {
        let status = StatusHandle::new(StatusStore::new(temp.path().join("task_status.json")));
        Arc::new(JobController::new(status, runner(site, temp.path(), false)))
    }

    #[tokio::test]
    async fn two_cycles_process_every_new_listing() {
        let temp = TempDir::new().unwrap();
        let site = FakeSite::with_pages(vec![page(1..=3), page(4..=6)]);
        let jobs = controller(&site, &temp);

        let started = assert_ok!(jobs.request_start(2, None));
        assert!(started.running);
        jobs.wait_idle().await;

        let store = jobs.runner().store();
        assert_eq!(store.load_processed().len(), 6);
        assert_eq!(store.load_seen().len(), 6);

        let status = jobs.get_status();
        assert!(!status.running);
        assert!(!status.stop_requested);
        assert_eq!(status.cycles, 2);
        assert!(status.started_at.is_some());
    }

    #[tokio::test]
    async fn stop_mid_cycle_finishes_the_current_cycle_only() {
        let temp = TempDir::new().unwrap();
        let site = FakeSite::with_pages(vec![page(1..=3), page(4..=6), page(7..=9)]).gated();
        let jobs = controller(&site, &temp);

        assert_ok!(jobs.request_start(3, None));
        site.fetch_started.notified().await;

        let stopping = assert_ok!(jobs.request_stop());
        assert!(stopping.stop_requested);
        site.release(3);
        jobs.wait_idle().await;

        assert_eq!(site.state().launches, 1);
        assert_eq!(jobs.runner().store().load_processed().len(), 3);
        let status = jobs.get_status();
        assert!(!status.running);
        assert!(!status.stop_requested);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_admit_exactly_one() {
        let temp = TempDir::new().unwrap();
        let site = FakeSite::with_pages(vec![page(1..=1)]).gated();
        let jobs = controller(&site, &temp);

        let attempts: Vec<_> = (0..16)
            .map(|_| {
                let jobs = jobs.clone();
                tokio::spawn(async move { jobs.request_start(1, None) })
            })
            .collect();

        let mut accepted = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(e) => assert!(matches!(e, ControlError::AlreadyRunning)),
            }
        }
        assert_eq!(accepted, 1);

        site.release(1);
        jobs.wait_idle().await;
        assert!(!jobs.get_status().running);
    }

    #[tokio::test]
    async fn stop_while_idle_is_rejected() {
        let temp = TempDir::new().unwrap();
        let jobs = controller(&FakeSite::default(), &temp);

        assert!(matches!(jobs.request_stop(), Err(ControlError::NotRunning)));
        assert!(!jobs.get_status().stop_requested);
    }

    #[tokio::test]
    async fn failed_run_still_clears_running() {
        let temp = TempDir::new().unwrap();
        let site = FakeSite::with_pages(vec![page(1..=2)]);
        site.state().fetch_error = true;
        let jobs = controller(&site, &temp);

        assert_ok!(jobs.request_start(3, Some(1.5)));
        jobs.wait_idle().await;

        let status = jobs.get_status();
        assert!(!status.running);
        assert_eq!(status.cycles, 3);
        assert_eq!(status.hours, Some(1.5));
        assert_eq!(site.state().launches, 1);
    }

    #[tokio::test]
    async fn stale_running_flag_is_recovered() {
        let temp = TempDir::new().unwrap();
        let jobs = controller(&FakeSite::default(), &temp);
        jobs.status
            .update(|s| {
                s.running = true;
                ((), true)
            })
            .unwrap();

        assert!(jobs.recover_stale().unwrap());
        assert!(!jobs.recover_stale().unwrap());
        assert!(!jobs.get_status().running);
        assert_ok!(jobs.request_start(1, None));
        jobs.wait_idle().await;
    }

    #[tokio::test]
    async fn unwritable_status_rejects_every_start() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("task_status.json");
        std::fs::create_dir(&path).unwrap();
        let site = FakeSite::with_pages(vec![page(1..=1), page(2..=2)]).gated();
        let jobs = Arc::new(JobController::new(
            StatusHandle::new(StatusStore::new(&path)),
            runner(&site, temp.path(), false),
        ));

        assert!(matches!(jobs.request_start(1, None), Err(ControlError::Persist(_))));
        assert!(matches!(jobs.request_start(1, None), Err(ControlError::Persist(_))));
        assert!(matches!(jobs.request_stop(), Err(ControlError::NotRunning)));

        site.release(2);
        jobs.wait_idle().await;
        assert_eq!(site.state().launches, 0);
    }

    #[tokio::test]
    async fn accepted_cycle_limit_holds_when_status_turns_unreadable() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("task_status.json");
        let site = FakeSite::with_pages(vec![page(1..=1), page(2..=2), page(3..=3)]).gated();
        let jobs = Arc::new(JobController::new(
            StatusHandle::new(StatusStore::new(&path)),
            runner(&site, temp.path(), false),
        ));

        assert_ok!(jobs.request_start(1, None));
        site.fetch_started.notified().await;
        std::fs::write(&path, "{\"running\": tru").unwrap();
        site.release(3);
        jobs.wait_idle().await;

        assert_eq!(site.state().launches, 1);
        assert!(!jobs.get_status().running);
    }
}
