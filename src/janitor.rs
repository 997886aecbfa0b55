//! # Journal Janitor
//!
//! Records can be deleted once every node has consumed them. The janitor
//! periodically computes the lowest local revision in the cluster and deletes
//! every journal row below it.
//!
//! ## Safety
//!
//! A node that stops checkpointing (crashed, partitioned, decommissioned
//! without removing its row) pins the minimum and stops cleanup for the whole
//! cluster. Nothing here times such a node out; an operator has to remove its
//! `local_revisions` row.
//!
//! ## Schedule
//!
//! ```text
//!   start ──sleep until first_run_hour──► clean ──sleep interval──► clean ...
//!                 ▲                                    ▲
//!                 └────────── shutdown signal wakes either sleep ──┘
//! ```
//!
//! The janitor runs on its own named thread driving a current-thread Tokio
//! runtime, so it works whether or not the embedding application uses Tokio.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{Local, NaiveDateTime, TimeDelta};
use rusqlite::params;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionManager, Slot};
use crate::error::{Error, Result};
use crate::schema::Statements;
use crate::types::CleanupStats;

// =============================================================================
// Cleanup
// =============================================================================

/// Runs one cleanup cycle.
///
/// The minimum and the delete run in one transaction, so the delete bound is
/// exactly the minimum observed.
pub fn clean_journal(conns: &ConnectionManager, statements: &Statements) -> Result<CleanupStats> {
    let stats = conns.with_connection(Slot::Shared, "clean journal", |conn| {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let result = (|| -> rusqlite::Result<CleanupStats> {
            let min: Option<i64> = conn
                .prepare_cached(&statements.select_min_local)?
                .query_row([], |row| row.get(0))?;
            let records_deleted = match min {
                Some(min) => conn
                    .prepare_cached(&statements.delete_below)?
                    .execute(params![min])?,
                None => 0,
            };
            Ok(CleanupStats {
                min_revision: min,
                records_deleted,
            })
        })();
        match result {
            Ok(stats) => {
                conn.execute_batch("COMMIT")?;
                Ok(stats)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    })?;

    match stats.min_revision {
        Some(min) => info!(
            min_revision = min,
            records_deleted = stats.records_deleted,
            "journal cleaned"
        ),
        None => debug!("no local revisions registered, nothing to clean"),
    }
    Ok(stats)
}

// =============================================================================
// Schedule
// =============================================================================

/// Time from `now` until the next `hour:00:00`. If that moment is now or has
/// passed today, the next day's is used.
pub fn delay_until_hour(now: NaiveDateTime, hour: u32) -> Duration {
    let Some(today) = now.date().and_hms_opt(hour, 0, 0) else {
        return Duration::ZERO;
    };
    let target = if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    };
    (target - now).to_std().unwrap_or(Duration::ZERO)
}

// =============================================================================
// Janitor Task
// =============================================================================

/// Handle to the running janitor. Stopping (or dropping) it wakes the task
/// and joins its thread.
pub struct Janitor {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Janitor {
    /// Starts the janitor with the first run at the next local
    /// `first_run_hour`.
    pub fn start(
        conns: Arc<ConnectionManager>,
        statements: Arc<Statements>,
        first_run_hour: u32,
        interval: Duration,
    ) -> Result<Self> {
        let first_delay = delay_until_hour(Local::now().naive_local(), first_run_hour);
        Self::start_with_delay(conns, statements, first_delay, interval)
    }

    /// Starts the janitor with an explicit delay before the first run.
    pub fn start_with_delay(
        conns: Arc<ConnectionManager>,
        statements: Arc<Statements>,
        first_delay: Duration,
        interval: Duration,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!(
            first_run_in_secs = first_delay.as_secs(),
            interval_secs = interval.as_secs(),
            "starting journal janitor"
        );

        let handle = thread::Builder::new()
            .name("journal-janitor".to_string())
            .spawn(move || {
                runtime.block_on(run(conns, statements, first_delay, interval, shutdown_rx));
            })
            .map_err(|e| Error::InvalidState(format!("failed to spawn janitor thread: {e}")))?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Signals the janitor to stop and waits for its thread.
    ///
    /// A cleanup already talking to the database finishes first.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn shutdown_and_join(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("journal janitor thread panicked");
            } else {
                info!("journal janitor stopped");
            }
        }
    }
}

impl Drop for Janitor {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

async fn run(
    conns: Arc<ConnectionManager>,
    statements: Arc<Statements>,
    first_delay: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut delay = first_delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            // Fires on the stop signal and when the handle is dropped.
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        if let Err(e) = clean_journal(&conns, &statements) {
            warn!(error = %e, "journal cleanup failed, retrying next cycle");
        }
        delay = interval;
    }
}

// =============================================================================
// Tests
// =============================================================================
