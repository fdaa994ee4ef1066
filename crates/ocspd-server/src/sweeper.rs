//! Periodic background sweep
//!
//! Each sweep runs one CRL refresh pass and purges expired OCSP responses.
//! The first sweep fires after `initial_delay_secs`; the next one starts
//! `interval_secs` after the previous one finished. One guard serialises
//! scheduled and operator-triggered sweeps, so two never overlap.

use crate::config::{RefreshConfig, SweeperConfig};
use crate::refresh::{RefreshEngine, RefreshError, RefreshReport};
use crate::store::{ResponseCache, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("a sweep is already running")]
    AlreadyRunning,

    #[error("refresh failed: {0}")]
    Refresh(#[from] RefreshError),

    #[error("OCSP purge failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweeperState {
    Idle,
    Running,
}

/// Outcome of one sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub crl: RefreshReport,
    pub ocsp_purged: usize,
}

struct SweepJob {
    engine: RefreshEngine,
    cache: Arc<ResponseCache>,
    refresh: RefreshConfig,
    guard: tokio::sync::Mutex<()>,
    last_report: Mutex<Option<SweepReport>>,
}

impl SweepJob {
    async fn sweep(&self) -> Result<SweepReport, SweepError> {
        let _running = self.guard.try_lock().map_err(|_| SweepError::AlreadyRunning)?;

        let started_at = Utc::now();
        debug!("Sweep started");
        let crl = self.engine.run(&self.refresh, started_at).await?;
        let ocsp_purged = self
            .cache
            .blocking(|c| c.purge_expired_ocsp(Utc::now()))
            .await?;

        let report = SweepReport {
            started_at,
            finished_at: Utc::now(),
            crl,
            ocsp_purged,
        };
        if let Ok(mut last) = self.last_report.lock() {
            *last = Some(report.clone());
        }
        info!(
            crl_deleted = report.crl.deleted,
            crl_refreshed = report.crl.refreshed,
            ocsp_purged = report.ocsp_purged,
            "Sweep complete"
        );
        Ok(report)
    }
}

pub struct PeriodicSweeper {
    job: Arc<SweepJob>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicSweeper {
    pub fn new(engine: RefreshEngine, cache: Arc<ResponseCache>, refresh: RefreshConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            job: Arc::new(SweepJob {
                engine,
                cache,
                refresh,
                guard: tokio::sync::Mutex::new(()),
                last_report: Mutex::new(None),
            }),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Start the background schedule; a second call is a no-op
    pub fn start(&self, schedule: &SweeperConfig) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.is_some() {
            return;
        }

        let job = Arc::clone(&self.job);
        let mut shutdown = self.shutdown_tx.subscribe();
        let initial_delay = Duration::from_secs(schedule.initial_delay_secs);
        let interval = Duration::from_secs(schedule.interval_secs);
        info!(
            initial_delay_secs = schedule.initial_delay_secs,
            interval_secs = schedule.interval_secs,
            "Starting periodic sweeper"
        );

        *task = Some(tokio::spawn(async move {
            let mut delay = initial_delay;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }

                match job.sweep().await {
                    Ok(_) => {}
                    Err(SweepError::AlreadyRunning) => {
                        debug!("Operator sweep in progress, skipping scheduled sweep")
                    }
                    Err(e) => error!("Scheduled sweep failed: {}", e),
                }
                delay = interval;
            }
            debug!("Periodic sweeper stopped");
        }));
    }

    /// Run a sweep now, unless one is already running
    pub async fn trigger_now(&self) -> Result<SweepReport, SweepError> {
        info!("Operator-triggered sweep");
        self.job.sweep().await
    }

    pub fn state(&self) -> SweeperState {
        match self.job.guard.try_lock() {
            Ok(_) => SweeperState::Idle,
            Err(_) => SweeperState::Running,
        }
    }

    pub fn last_report(&self) -> Option<SweepReport> {
        self.job.last_report.lock().ok().and_then(|last| last.clone())
    }

    /// Stop the schedule and wait for the loop to exit
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Sweeper task ended abnormally: {}", e);
            }
        }
    }
}
