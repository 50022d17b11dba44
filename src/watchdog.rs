//! Turns "stuck too long" into an interrupt.
//!
//! The watchdog never touches a worker's connection. It only flags overdue
//! workers in the table and wakes them; the worker itself does the cleanup.

use std::sync::Weak;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};

use crate::worker::WorkerTable;

/// Scans the table every `period` until the table is dropped.
pub async fn run(
    table: Weak<WorkerTable>,
    period: Duration,
    connect_timeout: Option<Duration>,
    command_timeout: Option<Duration>,
) {
    if connect_timeout.is_none() && command_timeout.is_none() {
        tracing::debug!("watchdog idle: no timeouts configured");
        return;
    }
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(table) = table.upgrade() else {
            break;
        };
        let fired = table
            .expire(Instant::now().into_std(), connect_timeout, command_timeout)
            .await;
        if fired > 0 {
            tracing::info!(fired, "watchdog interrupted overdue workers");
        }
    }
    tracing::debug!("watchdog stopped");
}
