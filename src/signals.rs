//! Interactive interrupt and suspend handling during a dispatch.
//!
//! The first ^C prints where every in-flight host stands. A second ^C within
//! `DEBOUNCE` terminates running commands and aborts. A ^Z within `DEBOUNCE` of a
//! ^C cancels hosts that have not started their command yet; any other ^Z
//! suspends the process as usual. In batch mode the first ^C aborts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use crate::config::DispatchOptions;
use crate::error::Result;
use crate::output::{OutputSink, Stream};
use crate::worker::{WorkerState, WorkerTable, WorkerView};

/// How close together two signals must be to count as one gesture.
pub const DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ShowStatus,
    Abort,
    CancelPending,
    Suspend,
}

/// Decides what a signal means given the one before it.
#[derive(Debug)]
pub struct Debounce {
    batch: bool,
    window: Duration,
    last_interrupt: Option<Instant>,
}

impl Debounce {
    pub fn new(batch: bool, window: Duration) -> Self {
        Self {
            batch,
            window,
            last_interrupt: None,
        }
    }

    fn recent(&self, now: Instant) -> bool {
        self.last_interrupt
            .map(|t| now.saturating_duration_since(t) <= self.window)
            .unwrap_or(false)
    }

    pub fn on_interrupt(&mut self, now: Instant) -> Action {
        if self.batch || self.recent(now) {
            return Action::Abort;
        }
        self.last_interrupt = Some(now);
        Action::ShowStatus
    }

    pub fn on_suspend(&mut self, now: Instant) -> Action {
        if self.recent(now) {
            Action::CancelPending
        } else {
            Action::Suspend
        }
    }
}

/// Installs the handlers and starts the coordinator task.
///
/// Handler installation failures are returned before any task is spawned.
pub fn spawn(
    table: Arc<WorkerTable>,
    sink: Arc<dyn OutputSink>,
    options: &DispatchOptions,
) -> Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut suspend = signal(SignalKind::from_raw(libc::SIGTSTP))?;
    let mut debounce = Debounce::new(options.batch, DEBOUNCE);
    let options = options.clone();

    Ok(tokio::spawn(async move {
        loop {
            let action = tokio::select! {
                Some(()) = interrupt.recv() => debounce.on_interrupt(Instant::now()),
                Some(()) = suspend.recv() => debounce.on_suspend(Instant::now()),
                else => break,
            };
            tracing::debug!(?action, "signal received");
            apply(action, &table, sink.as_ref(), &options).await;
        }
    }))
}

async fn apply(action: Action, table: &WorkerTable, sink: &dyn OutputSink, options: &DispatchOptions) {
    match action {
        Action::ShowStatus => {
            let views = table.snapshot().await;
            let mut report = format!(
                "fanout: interrupt (one more within {} sec to abort)\n\
                 fanout:  (^Z within {} sec to cancel pending hosts)\n",
                DEBOUNCE.as_secs(),
                DEBOUNCE.as_secs()
            );
            for line in status_lines(&views, Instant::now(), options) {
                report.push_str(&line);
                report.push('\n');
            }
            sink.write(Stream::Stderr, report.as_bytes());
        }
        Action::Abort => {
            sink.write(Stream::Stderr, b"fanout: interrupt, aborting.\n");
            let signaled = table.signal_reading(libc::SIGTERM, None).await;
            tracing::debug!(signaled, "terminated running workers");
            table.abort("interrupted");
        }
        Action::CancelPending => {
            let canceled = table.cancel_pending().await;
            sink.write(
                Stream::Stderr,
                format!("fanout: canceled {} pending hosts\n", canceled).as_bytes(),
            );
        }
        Action::Suspend => {
            // Our handler replaced the default stop action, so stop ourselves.
            // SAFETY: raise(3) has no memory-safety preconditions.
            unsafe {
                libc::raise(libc::SIGSTOP);
            }
        }
    }
}

/// One line per host that is connecting or running.
pub fn status_lines(views: &[WorkerView], now: Instant, options: &DispatchOptions) -> Vec<String> {
    views
        .iter()
        .filter_map(|view| {
            let (what, since, limit) = match view.state {
                WorkerState::Rcmd => ("connecting", view.started, options.connect_timeout),
                WorkerState::Reading => {
                    ("command in progress", view.connected, options.command_timeout)
                }
                _ => return None,
            };
            let hint = match (options.debug, since, limit) {
                (true, Some(since), Some(limit)) => {
                    let left = limit.saturating_sub(now.saturating_duration_since(since));
                    format!(" ({}s left)", left.as_secs())
                }
                _ => String::new(),
            };
            Some(format!("{}: {}{}", view.host, what, hint))
        })
        .collect()
}
