use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::browser::WebDriverLauncher;
use crate::cli::config::AppConfig;
use crate::crawler::{ControlError, CycleRunner, JobController, RunOptions};
use crate::server::{self, AppState};
use crate::storage::atomic;
use crate::storage::snapshot;
use crate::storage::{DedupStore, SnapshotDir, StatusHandle, StatusStore};

/// Wire the job controller to the WebDriver browser and the data directory
fn build_controller(config: &AppConfig) -> Result<JobController> {
    let storage = &config.storage;
    atomic::ensure_dir(&storage.data_dir)
        .with_context(|| format!("Failed to prepare data directory: {}", storage.data_dir.display()))?;

    let launcher = Arc::new(WebDriverLauncher::new(
        config.browser.clone(),
        config.site.clone(),
        config.job.dry_run,
    ));
    let runner = CycleRunner::new(
        launcher,
        DedupStore::new(storage.seen_path(), &storage.data_dir),
        config.accounts.clone(),
        RunOptions::from_config(config),
    );
    let status = StatusHandle::new(StatusStore::new(storage.status_path()));

    Ok(JobController::new(status, runner))
}

/// Serve the HTTP control surface
pub async fn serve(config: AppConfig) -> Result<()> {
    let jobs = Arc::new(build_controller(&config)?);
    let state = AppState {
        jobs,
        snapshots: SnapshotDir::new(&config.storage.data_dir),
    };
    let addr = format!("{}:{}", config.server.host, config.server.port);

    server::serve(state, &addr).await
}

/// Run a job in the foreground. Ctrl-C requests a cooperative stop.
pub async fn run(config: AppConfig, cycles: u32, hours: Option<f64>, reset: bool) -> Result<()> {
    let jobs = Arc::new(build_controller(&config)?);
    if reset && jobs.recover_stale()? {
        info!("Cleared stale job status");
    }
    if config.job.dry_run {
        info!("Dry run: nothing will be submitted or saved");
    }

    jobs.request_start(cycles, hours).map_err(|e| match e {
        ControlError::AlreadyRunning => anyhow!(
            "a job is already running according to {}; use --reset if its process is gone",
            config.storage.status_path().display()
        ),
        other => anyhow!(other),
    })?;

    let stopper = {
        let jobs = jobs.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current cycle");
                let _ = jobs.request_stop();
            }
        })
    };

    jobs.wait_idle().await;
    stopper.abort();

    let status = jobs.get_status();
    info!("Job finished: {}", serde_json::to_string(&status)?);
    Ok(())
}

/// Print the persisted job status
pub fn status(config: AppConfig) -> Result<()> {
    let status = StatusStore::new(config.storage.status_path()).load();
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Ask a job running in another process to stop
pub fn stop(config: AppConfig) -> Result<()> {
    let jobs = build_controller(&config)?;
    match jobs.request_stop() {
        Ok(_) => println!("Stop requested; the job ends after its current cycle"),
        Err(ControlError::NotRunning) => println!("Nothing to stop: no job is running"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Print the latest snapshot
pub fn houses(config: AppConfig, list: bool) -> Result<()> {
    let snapshots = SnapshotDir::new(&config.storage.data_dir);
    let output = if list {
        serde_json::to_string_pretty(&snapshot::streets_view(&snapshots))?
    } else {
        serde_json::to_string_pretty(&snapshot::houses_view(&snapshots))?
    };
    println!("{}", output);
    Ok(())
}

/// Show the current configuration
pub fn show_config(config: AppConfig) -> Result<()> {
    println!("Current configuration:");
    println!("{:#?}", config);

    Ok(())
}
