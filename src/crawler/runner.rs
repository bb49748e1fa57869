use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::browser::behavior::random_delay;
use crate::browser::roles::{SessionError, SessionManager, SessionRole};
use crate::browser::{BrowserLauncher, ListingBrowser};
use crate::cli::config::{AccountSettings, AppConfig};
use crate::crawler::listing::{render_message, ListingRecord};
use crate::storage::{DedupStore, PersistError, ProcessedMap, SeenUrls, StatusHandle};

/// Errors that end a job run
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("failed to launch browser: {0:#}")]
    Launch(#[source] anyhow::Error),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("failed to fetch listings: {0:#}")]
    Fetch(#[source] anyhow::Error),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Why a run ended normally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    StoppedByUser,
    CyclesExhausted,
    DurationExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub executed: u32,
}

/// Counters for one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub scraped: usize,
    pub candidates: usize,
    pub applied: usize,
    pub failed: usize,
}

/// Settings a run needs besides the browser and the state files
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub search_url: String,
    pub message_template: String,
    /// Preview only: no state is read or written and nothing is submitted
    pub dry_run: bool,
    pub cycle_pause: Duration,
    /// Min and max pause between applications in milliseconds
    pub candidate_delay: (u64, u64),
}

impl RunOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            search_url: config.site.search_url.clone(),
            message_template: config.job.message_template.clone(),
            dry_run: config.job.dry_run,
            cycle_pause: Duration::from_secs(config.job.cycle_pause_secs),
            candidate_delay: config.browser.behavior.candidate_delay,
        }
    }
}

/// Cycle and duration budget accepted for one run
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunLimits {
    /// 0 = unbounded
    pub cycles: u32,
    pub hours: Option<f64>,
}

impl RunLimits {
    /// Decide whether the loop should end before starting another cycle.
    /// A pending stop wins over both limits.
    pub fn exit_reason(&self, stop_requested: bool, executed: u32, elapsed: Duration) -> Option<RunOutcome> {
        if stop_requested {
            return Some(RunOutcome::StoppedByUser);
        }
        if self.cycles > 0 && executed >= self.cycles {
            return Some(RunOutcome::CyclesExhausted);
        }
        match self.hours {
            Some(hours) if elapsed.as_secs_f64() / 3600.0 >= hours => Some(RunOutcome::DurationExhausted),
            _ => None,
        }
    }
}

/// Executes scrape/filter/apply/persist cycles until the job is exhausted
/// or asked to stop.
pub struct CycleRunner {
    launcher: Arc<dyn BrowserLauncher>,
    store: DedupStore,
    accounts: AccountSettings,
    options: RunOptions,
}

impl CycleRunner {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        store: DedupStore,
        accounts: AccountSettings,
        options: RunOptions,
    ) -> Self {
        Self {
            launcher,
            store,
            accounts,
            options,
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &DedupStore {
        &self.store
    }

    /// Run cycles until stop is requested or `limits` are reached. Only the
    /// stop flag is read back from `status`, between cycles.
    pub async fn run(&self, limits: RunLimits, status: &StatusHandle) -> Result<RunSummary, CycleError> {
        let started = Instant::now();
        let mut executed = 0u32;

        loop {
            let stop = status.read().stop_requested;
            if let Some(outcome) = limits.exit_reason(stop, executed, started.elapsed()) {
                info!(?outcome, executed, "Job finished");
                return Ok(RunSummary { outcome, executed });
            }

            info!(cycle = executed + 1, "Starting cycle");
            let report = self.run_cycle().await?;
            executed += 1;
            info!(
                cycle = executed,
                scraped = report.scraped,
                candidates = report.candidates,
                applied = report.applied,
                failed = report.failed,
                "Cycle complete"
            );

            let pause = self.options.cycle_pause;
            if !pause.is_zero()
                && limits
                    .exit_reason(status.read().stop_requested, executed, started.elapsed())
                    .is_none()
            {
                debug!("Pausing {:?} before the next cycle", pause);
                sleep(pause).await;
            }
        }
    }

    /// One cycle on a fresh browser that is closed on every exit path.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let mut browser = self.launcher.launch().await.map_err(CycleError::Launch)?;
        let result = self.cycle_with(browser.as_mut()).await;
        browser.close().await;
        result
    }

    async fn cycle_with(&self, browser: &mut dyn ListingBrowser) -> Result<CycleReport, CycleError> {
        let dry_run = self.options.dry_run;
        let mut sessions = SessionManager::new(self.accounts.clone());
        sessions.ensure_role(browser, SessionRole::Browsing).await?;
        debug!(role = %sessions.current(), "Session ready");

        let (mut processed, mut seen) = if dry_run {
            (ProcessedMap::new(), SeenUrls::new())
        } else {
            (self.store.load_processed(), self.store.load_seen())
        };

        let scraped = browser
            .fetch_listings(&self.options.search_url)
            .await
            .map_err(CycleError::Fetch)?;

        if !dry_run {
            if let Err(e) = self.store.save_scrape(&scraped, &processed) {
                warn!("Could not save scrape snapshot: {}", e);
            }
        }

        let candidates = DedupStore::filter(&scraped, &processed, &seen);
        info!("Found {} new listings out of {}", candidates.len(), scraped.len());

        let mut report = CycleReport {
            scraped: scraped.len(),
            candidates: candidates.len(),
            ..CycleReport::default()
        };

        for (index, listing) in candidates.iter().enumerate() {
            let Some(url) = listing.identity() else {
                continue;
            };
            let message = render_message(&self.options.message_template, listing);

            if dry_run {
                let filled = browser.submit_application(url, &message).await;
                info!(url, name = %listing.name, filled, "[dry-run] Previewed listing");
                continue;
            }

            if let Err(e) = sessions.ensure_role(browser, SessionRole::Applying).await {
                self.save_partial(&seen, &processed);
                return Err(e.into());
            }

            let success = browser.submit_application(url, &message).await;
            DedupStore::mark_processed(&mut processed, listing, success);
            if success {
                report.applied += 1;
            } else {
                report.failed += 1;
            }
            info!(url, name = %listing.name, success, "Processed listing");

            if index + 1 < candidates.len() {
                sleep(random_delay(self.options.candidate_delay)).await;
            }
        }

        if !dry_run {
            seen.extend(scraped.iter().filter_map(ListingRecord::identity).map(str::to_owned));
            self.store.save_all(&seen, &processed)?;
        }

        Ok(report)
    }

    fn save_partial(&self, seen: &SeenUrls, processed: &ProcessedMap) {
        if let Err(e) = self.store.save_all(seen, processed) {
            error!("Failed to save partial progress: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::fakes::{listing, page, runner, FakeSite};
    use crate::storage::StatusStore;
    use tempfile::TempDir;

    fn status(temp: &TempDir) -> StatusHandle {
        let handle = StatusHandle::new(StatusStore::new(temp.path().join("task_status.json")));
        handle
            .update(|s| {
                s.running = true;
                ((), true)
            })
            .unwrap();
        handle
    }

    fn limits(cycles: u32, hours: Option<f64>) -> RunLimits {
        RunLimits { cycles, hours }
    }

    #[test]
    fn exit_checks_stop_before_limits() {
        let l = limits(2, Some(1.0));
        assert_eq!(l.exit_reason(false, 0, Duration::ZERO), None);
        assert_eq!(l.exit_reason(false, 2, Duration::ZERO), Some(RunOutcome::CyclesExhausted));
        assert_eq!(
            l.exit_reason(false, 1, Duration::from_secs(3600)),
            Some(RunOutcome::DurationExhausted)
        );
        assert_eq!(
            l.exit_reason(true, 2, Duration::from_secs(7200)),
            Some(RunOutcome::StoppedByUser)
        );
    }

    #[test]
    fn zero_cycles_means_unbounded() {
        assert_eq!(limits(0, None).exit_reason(false, 1000, Duration::from_secs(86_400)), None);
    }

    #[tokio::test]
    async fn failed_submission_is_recorded_and_batch_continues() {
        let temp = TempDir::new().unwrap();
        let site = FakeSite::with_pages(vec![page(1..=3)]);
        site.state().rejected.insert(listing(2).url.unwrap());
        let runner = runner(&site, temp.path(), false);

        let report = runner.run_cycle().await.unwrap();

        assert_eq!(report.applied, 2);
        assert_eq!(report.failed, 1);
        let processed = runner.store().load_processed();
        assert_eq!(processed.len(), 3);
        assert_eq!(processed[&listing(2).url.unwrap()].success, Some(false));
        assert_eq!(processed[&listing(3).url.unwrap()].success, Some(true));
    }

    #[tokio::test]
    async fn logs_in_once_per_role_per_cycle() {
        let temp = TempDir::new().unwrap();
        let site = FakeSite::with_pages(vec![page(1..=3)]);
        let runner = runner(&site, temp.path(), false);

        runner.run_cycle().await.unwrap();

        let state = site.state();
        assert_eq!(state.logins, vec!["browse@example.nl", "apply@example.nl"]);
        assert_eq!(state.submissions.len(), 3);
        assert_eq!((state.launches, state.closes), (1, 1));
    }

    #[tokio::test]
    async fn seen_listings_are_not_applied_to_again() {
        let temp = TempDir::new().unwrap();
        let site = FakeSite::with_pages(vec![page(1..=3), page(2..=5)]);
        let runner = runner(&site, temp.path(), false);

        runner.run_cycle().await.unwrap();
        let second = runner.run_cycle().await.unwrap();

        assert_eq!(second.candidates, 2);
        assert_eq!(site.state().submissions.len(), 5);
        assert_eq!(runner.store().load_seen().len(), 5);
    }

    #[tokio::test]
    async fn no_candidates_means_no_applying_login() {
        let temp = TempDir::new().unwrap();
        let site = FakeSite::with_pages(vec![Vec::new()]);
        let runner = runner(&site, temp.path(), false);

        let report = runner.run_cycle().await.unwrap();

        assert_eq!(report, CycleReport::default());
        assert_eq!(site.state().logins, vec!["browse@example.nl"]);
    }

    #[tokio::test]
    async fn dry_run_touches_no_files_and_stays_on_browse_account() {
        let temp = TempDir::new().unwrap();
        let site = FakeSite::with_pages(vec![page(1..=2)]);
        let runner = runner(&site, temp.path(), true);

        runner.run_cycle().await.unwrap();

        assert_eq!(site.state().logins, vec!["browse@example.nl"]);
        assert_eq!(site.state().submissions.len(), 2);
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn fetch_failure_is_fatal_and_closes_browser() {
        let temp = TempDir::new().unwrap();
        let site = FakeSite::with_pages(vec![page(1..=2)]);
        site.state().fetch_error = true;
        let runner = runner(&site, temp.path(), false);

        let err = runner.run_cycle().await.unwrap_err();

        assert!(matches!(err, CycleError::Fetch(_)));
        assert_eq!(site.state().closes, 1);
    }

    #[tokio::test]
    async fn applying_login_failure_keeps_history() {
        let temp = TempDir::new().unwrap();
        let site = FakeSite::with_pages(vec![page(1..=2), page(3..=4)]);
        let runner = runner(&site, temp.path(), false);
        runner.run_cycle().await.unwrap();

        site.state().failing_logins.insert("apply@example.nl".into());
        let err = runner.run_cycle().await.unwrap_err();

        assert!(matches!(err, CycleError::Session(SessionError::LoginFailed { .. })));
        assert_eq!(site.state().closes, 2);
        assert_eq!(runner.store().load_processed().len(), 2);
    }

    #[tokio::test]
    async fn run_stops_after_requested_cycles() {
        let temp = TempDir::new().unwrap();
        let site = FakeSite::with_pages(vec![page(1..=1), page(2..=2), page(3..=3)]);
        let runner = runner(&site, temp.path(), false);

        let summary = runner.run(limits(2, None), &status(&temp)).await.unwrap();

        assert_eq!(summary, RunSummary { outcome: RunOutcome::CyclesExhausted, executed: 2 });
        assert_eq!(site.state().launches, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_cycle_exhausts_duration() {
        let temp = TempDir::new().unwrap();
        let site = FakeSite::with_pages(vec![page(1..=3), page(4..=6)]);
        site.state().fetch_delay = Duration::from_secs(5);
        let runner = runner(&site, temp.path(), false);

        // 0.001 h is 3.6 s, shorter than one fetch
        let summary = runner.run(limits(5, Some(0.001)), &status(&temp)).await.unwrap();

        assert_eq!(summary, RunSummary { outcome: RunOutcome::DurationExhausted, executed: 1 });
    }

    #[tokio::test]
    async fn stop_flag_is_checked_before_the_first_cycle() {
        let temp = TempDir::new().unwrap();
        let site = FakeSite::with_pages(vec![page(1..=1)]);
        let runner = runner(&site, temp.path(), false);
        let handle = status(&temp);
        handle
            .update(|s| {
                s.stop_requested = true;
                ((), true)
            })
            .unwrap();

        let summary = runner.run(limits(3, None), &handle).await.unwrap();

        assert_eq!(summary.outcome, RunOutcome::StoppedByUser);
        assert_eq!(site.state().launches, 0);
    }
}
