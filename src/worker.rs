//! Per-host workers and the table they share.
//!
//! A worker drives one host through NEW → RCMD → READING → {DONE, FAILED} and may
//! be CANCELED while still NEW or RCMD. The worker task owns its connection and
//! buffers. Everything other tasks may look at (state, timestamps, the remote
//! handle used to forward signals) lives in `WorkerTable` behind one lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex, Notify};

use crate::buffer::LineBuffer;
use crate::config::DispatchOptions;
use crate::error::{FanoutError, Result, TimeoutKind};
use crate::host::Host;
use crate::output::{report_error, Label, OutputSink, Stream};
use crate::rcmd::{ConnectRequest, Rcmd, RcmdHandle};
use crate::retcode;

/// How long teardown waits for a provider after a timeout before giving up on it.
const DESTROY_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    New,
    Rcmd,
    Reading,
    Done,
    Failed,
    Canceled,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkerState::Done | WorkerState::Failed | WorkerState::Canceled
        )
    }

    /// Only workers that have not started their command can be canceled.
    pub fn is_cancelable(self) -> bool {
        matches!(self, WorkerState::New | WorkerState::Rcmd)
    }
}

/// What a worker is asked to do on its host.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Run a shell command.
    Command(String),
    /// Copy a local file to `dest` on the host.
    Copy { source: PathBuf, dest: String },
}

impl Payload {
    /// The command text handed to the provider.
    fn remote_command(&self, remote_rc: bool) -> String {
        match self {
            Payload::Command(command) if remote_rc => retcode::append_marker(command),
            Payload::Command(command) => command.clone(),
            Payload::Copy { dest, .. } => {
                format!("cat > '{}'", dest.replace('\'', r"'\''"))
            }
        }
    }
}

/// The lock-protected part of a worker.
#[derive(Clone, Default)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub started: Option<Instant>,
    pub connected: Option<Instant>,
    pub finished: Option<Instant>,
    pub rc: Option<i32>,
    /// Set by the watchdog right before it wakes the worker.
    interrupt: Option<TimeoutKind>,
    handle: Option<Arc<dyn RcmdHandle>>,
}

impl WorkerStatus {
    /// Which timeout, if any, this worker has overrun at `now`.
    pub fn overdue(
        &self,
        now: Instant,
        connect_timeout: Option<Duration>,
        command_timeout: Option<Duration>,
    ) -> Option<TimeoutKind> {
        match (self.state, connect_timeout, command_timeout) {
            (WorkerState::Rcmd, Some(limit), _) => self
                .started
                .filter(|t| now.saturating_duration_since(*t) > limit)
                .map(|_| TimeoutKind::Connect),
            (WorkerState::Reading, _, Some(limit)) => self
                .connected
                .filter(|t| now.saturating_duration_since(*t) > limit)
                .map(|_| TimeoutKind::Command),
            _ => None,
        }
    }
}

/// Snapshot of one worker, handed out to readers outside the lock.
#[derive(Debug, Clone)]
pub struct WorkerView {
    pub host: String,
    pub state: WorkerState,
    pub started: Option<Instant>,
    pub connected: Option<Instant>,
    pub rc: Option<i32>,
}

/// Shared handle over every worker of one dispatch.
pub struct WorkerTable {
    hosts: Vec<Host>,
    wakeups: Vec<Notify>,
    status: Mutex<Vec<WorkerStatus>>,
    abort: watch::Sender<Option<String>>,
}

impl WorkerTable {
    pub fn new(hosts: Vec<Host>) -> Self {
        let n = hosts.len();
        let (abort, _) = watch::channel(None);
        Self {
            wakeups: (0..n).map(|_| Notify::new()).collect(),
            status: Mutex::new(vec![WorkerStatus::default(); n]),
            hosts,
            abort,
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn host(&self, index: usize) -> &Host {
        &self.hosts[index]
    }

    pub async fn state(&self, index: usize) -> WorkerState {
        self.status.lock().await[index].state
    }

    pub async fn snapshot(&self) -> Vec<WorkerView> {
        let status = self.status.lock().await;
        self.hosts
            .iter()
            .zip(status.iter())
            .map(|(host, s)| WorkerView {
                host: host.hostname.clone(),
                state: s.state,
                started: s.started,
                connected: s.connected,
                rc: s.rc,
            })
            .collect()
    }

    /// Wakes every worker that has overrun one of its timeouts.
    ///
    /// Returns how many workers were interrupted.
    pub async fn expire(
        &self,
        now: Instant,
        connect_timeout: Option<Duration>,
        command_timeout: Option<Duration>,
    ) -> usize {
        let mut status = self.status.lock().await;
        let mut fired = 0;
        for (index, s) in status.iter_mut().enumerate() {
            if let Some(kind) = s.overdue(now, connect_timeout, command_timeout) {
                tracing::debug!(host = %self.hosts[index], %kind, "timeout");
                s.interrupt = Some(kind);
                self.wakeups[index].notify_one();
                fired += 1;
            }
        }
        fired
    }

    /// Cancels every worker that has not started its command yet.
    pub async fn cancel_pending(&self) -> usize {
        let mut status = self.status.lock().await;
        let mut canceled = 0;
        for (index, s) in status.iter_mut().enumerate() {
            if s.state.is_cancelable() {
                s.state = WorkerState::Canceled;
                s.finished = Some(Instant::now());
                // A connect in flight is abandoned at its next wakeup.
                self.wakeups[index].notify_one();
                canceled += 1;
            }
        }
        canceled
    }

    /// Sends `signum` to every READING worker except `except`.
    pub async fn signal_reading(&self, signum: i32, except: Option<usize>) -> usize {
        let targets: Vec<(usize, Arc<dyn RcmdHandle>)> = {
            let status = self.status.lock().await;
            status
                .iter()
                .enumerate()
                .filter(|(index, s)| Some(*index) != except && s.state == WorkerState::Reading)
                .filter_map(|(index, s)| s.handle.clone().map(|h| (index, h)))
                .collect()
        };
        let count = targets.len();
        for (index, handle) in targets {
            if let Err(e) = handle.signal(signum).await {
                tracing::warn!(host = %self.hosts[index], "failed to send signal {}: {}", signum, e);
            }
        }
        count
    }

    /// Asks the whole dispatch to stop. The first reason wins.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.abort.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// The abort reason, if the dispatch has been aborted.
    pub fn abort_reason(&self) -> Option<String> {
        self.abort.borrow().clone()
    }

    /// Resolves once `abort` has been called.
    pub async fn aborted(&self) -> String {
        let mut rx = self.abort.subscribe();
        let reason = match rx.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            // The sender lives in `self`, so this cannot close while borrowed.
            Err(_) => String::new(),
        };
        reason
    }

    async fn begin_connect(&self, index: usize) -> bool {
        let mut status = self.status.lock().await;
        let s = &mut status[index];
        if s.state != WorkerState::New {
            return false;
        }
        s.state = WorkerState::Rcmd;
        s.started = Some(Instant::now());
        true
    }

    async fn begin_reading(&self, index: usize, handle: Arc<dyn RcmdHandle>) -> bool {
        let mut status = self.status.lock().await;
        let s = &mut status[index];
        if s.state != WorkerState::Rcmd {
            return false;
        }
        s.state = WorkerState::Reading;
        s.connected = Some(Instant::now());
        s.interrupt = None;
        s.handle = Some(handle);
        true
    }

    async fn take_interrupt(&self, index: usize) -> Option<TimeoutKind> {
        self.status.lock().await[index].interrupt.take()
    }

    async fn finish(&self, index: usize, state: WorkerState, rc: Option<i32>) {
        let mut status = self.status.lock().await;
        let s = &mut status[index];
        if s.state != WorkerState::Canceled {
            s.state = state;
        }
        s.finished = Some(Instant::now());
        s.rc = rc;
        s.handle = None;
        s.interrupt = None;
    }
}

/// Everything workers of one dispatch have in common.
pub(crate) struct WorkerShared {
    pub table: Arc<WorkerTable>,
    pub options: DispatchOptions,
    pub payload: Payload,
    pub sink: Arc<dyn OutputSink>,
    pub local_user: String,
}

pub(crate) struct Worker {
    index: usize,
    host: Host,
    label: Label,
    rcmd: Arc<dyn Rcmd>,
    shared: Arc<WorkerShared>,
    rc: Option<i32>,
    deadly_reported: bool,
}

impl Worker {
    pub fn new(index: usize, label: Label, rcmd: Arc<dyn Rcmd>, shared: Arc<WorkerShared>) -> Self {
        Self {
            index,
            host: shared.table.host(index).clone(),
            label,
            rcmd,
            shared,
            rc: None,
            deadly_reported: false,
        }
    }

    /// Runs the whole lifecycle and records the final state.
    pub async fn run(mut self) {
        let state = match self.execute().await {
            Ok(state) => state,
            Err(e) => {
                tracing::debug!(host = %self.host, "failed: {}", e);
                report_error(self.shared.sink.as_ref(), &self.host.hostname, &e.to_string());
                WorkerState::Failed
            }
        };
        tracing::debug!(host = %self.host, ?state, rc = ?self.rc, "worker finished");
        self.shared.table.finish(self.index, state, self.rc).await;
    }

    async fn execute(&mut self) -> Result<WorkerState> {
        let table = Arc::clone(&self.shared.table);
        let wakeup = &table.wakeups[self.index];

        let address = if self.rcmd.resolves_address() {
            Some(self.resolve().await?)
        } else {
            None
        };

        if !table.begin_connect(self.index).await {
            // Canceled before we got to it.
            return Ok(WorkerState::Canceled);
        }

        let options = &self.shared.options;
        let request = ConnectRequest {
            host: self.host.hostname.clone(),
            address,
            local_user: self.shared.local_user.clone(),
            remote_user: self
                .host
                .user
                .clone()
                .or_else(|| options.remote_user.clone())
                .unwrap_or_else(|| self.shared.local_user.clone()),
            command: self.shared.payload.remote_command(options.remote_rc),
            node_index: self.index,
            want_stderr: options.separate_stderr,
            want_stdin: matches!(self.shared.payload, Payload::Copy { .. }),
        };
        tracing::debug!(host = %self.host, rcmd = self.rcmd.name(), "connecting");

        let connected = tokio::select! {
            result = self.rcmd.connect(&request) => Some(result),
            _ = wakeup.notified() => None,
        };
        let mut connection = match connected {
            Some(result) => result?,
            None => {
                if table.state(self.index).await == WorkerState::Canceled {
                    return Ok(WorkerState::Canceled);
                }
                table.take_interrupt(self.index).await;
                return Err(FanoutError::Timeout(TimeoutKind::Connect));
            }
        };

        let handle = Arc::clone(&connection.handle);
        if !table.begin_reading(self.index, Arc::clone(&handle)).await {
            tracing::debug!(host = %self.host, "canceled while connecting");
            drop(connection);
            return Ok(WorkerState::Canceled);
        }

        let mut failure = None;

        if let (Some(mut stdin), Payload::Copy { source, .. }) =
            (connection.stdin.take(), &self.shared.payload)
        {
            let feed = async {
                let mut file = tokio::fs::File::open(source).await?;
                tokio::io::copy(&mut file, &mut stdin).await?;
                stdin.shutdown().await
            };
            tokio::select! {
                result = feed => {
                    if let Err(e) = result {
                        failure = Some(FanoutError::Io(e));
                    }
                }
                _ = self.command_interrupt(wakeup) => {
                    failure = Some(FanoutError::Timeout(TimeoutKind::Command));
                }
            }
        }

        let mut out_buf = LineBuffer::new();
        let mut err_buf = LineBuffer::new();
        let mut stdio = connection.stdio;
        let mut stderr = connection.stderr.take();
        let mut stdio_open = failure.is_none();
        let mut stderr_open = failure.is_none() && stderr.is_some();

        while stdio_open || stderr_open {
            tokio::select! {
                result = out_buf.fill(&mut stdio), if stdio_open => {
                    match result {
                        Ok(0) => stdio_open = false,
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!(host = %self.host, "stdout read error: {}", e);
                            stdio_open = false;
                        }
                    }
                    while let Some(line) = out_buf.next_line() {
                        self.emit_stdout(&line).await;
                    }
                }
                result = read_optional(&mut err_buf, &mut stderr), if stderr_open => {
                    match result {
                        Ok(0) => stderr_open = false,
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!(host = %self.host, "stderr read error: {}", e);
                            stderr_open = false;
                        }
                    }
                    while let Some(line) = err_buf.next_line() {
                        self.emit(Stream::Stderr, &line);
                    }
                }
                _ = self.command_interrupt(wakeup) => {
                    failure = Some(FanoutError::Timeout(TimeoutKind::Command));
                    break;
                }
            }
        }

        if failure.is_some() {
            self.terminate(handle.as_ref()).await;
        }

        if let Some(rest) = out_buf.take_remainder() {
            self.emit(Stream::Stdout, &rest);
        }
        if let Some(rest) = err_buf.take_remainder() {
            self.emit(Stream::Stderr, &rest);
        }
        drop(stdio);
        drop(stderr);

        let destroyed = if failure.is_some() {
            self.destroy_after_failure(handle.as_ref()).await
        } else {
            // Both streams are closed but the command may still be running.
            tokio::select! {
                result = handle.destroy() => result,
                _ = self.command_interrupt(wakeup) => {
                    failure = Some(FanoutError::Timeout(TimeoutKind::Command));
                    self.terminate(handle.as_ref()).await;
                    self.destroy_after_failure(handle.as_ref()).await
                }
            }
        };
        match destroyed {
            Ok(Some(code)) if self.rc.is_none() => {
                self.rc = Some(code);
                // Our own SIGTERM after a timeout is not a remote death.
                if failure.is_none() {
                    self.check_deadly(code).await;
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(host = %self.host, "teardown failed: {}", e),
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(WorkerState::Done),
        }
    }

    async fn terminate(&self, handle: &dyn RcmdHandle) {
        if let Err(e) = handle.signal(libc::SIGTERM).await {
            tracing::debug!(host = %self.host, "failed to signal: {}", e);
        }
    }

    /// Tears down after a failure without waiting forever on the provider.
    async fn destroy_after_failure(&self, handle: &dyn RcmdHandle) -> Result<Option<i32>> {
        tokio::time::timeout(DESTROY_GRACE, handle.destroy())
            .await
            .unwrap_or(Ok(None))
    }

    async fn resolve(&self) -> Result<std::net::IpAddr> {
        let mut addrs = tokio::net::lookup_host((self.host.hostname.as_str(), 0))
            .await
            .map_err(|e| FanoutError::Resolve(e.to_string()))?;
        addrs
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| FanoutError::Resolve("no addresses".to_string()))
    }

    /// Resolves when the watchdog flags this worker's command as overdue.
    async fn command_interrupt(&self, wakeup: &Notify) {
        loop {
            wakeup.notified().await;
            // Leftover wakeups from the connect phase are ignored.
            if self.shared.table.take_interrupt(self.index).await == Some(TimeoutKind::Command) {
                return;
            }
        }
    }

    async fn emit_stdout(&mut self, line: &[u8]) {
        if !(self.shared.options.remote_rc && matches!(self.shared.payload, Payload::Command(_))) {
            self.emit(Stream::Stdout, line);
            return;
        }
        let (display, code) = match retcode::extract(line) {
            Some(marked) => (marked.display.to_vec(), marked.code),
            None => {
                self.emit(Stream::Stdout, line);
                return;
            }
        };
        if !display.is_empty() {
            let mut display = display;
            display.push(b'\n');
            self.emit(Stream::Stdout, &display);
        }
        if let Some(code) = code {
            tracing::debug!(host = %self.host, code, "remote return code");
            self.rc = Some(code);
            self.check_deadly(code).await;
        }
    }

    fn emit(&self, stream: Stream, line: &[u8]) {
        self.shared.sink.write(stream, &self.label.frame(line));
    }

    /// Escalates a remote death-by-signal to the whole dispatch under kill-on-fail.
    async fn check_deadly(&mut self, code: i32) {
        if !self.shared.options.kill_on_fail || self.deadly_reported {
            return;
        }
        let Some(signal) = retcode::killed_by_signal(code) else {
            return;
        };
        self.deadly_reported = true;
        let message = format!("process killed by signal {}", signal);
        tracing::warn!(host = %self.host, signal, "kill-on-fail triggered");
        report_error(self.shared.sink.as_ref(), &self.host.hostname, &message);
        let table = &self.shared.table;
        let signaled = table.signal_reading(libc::SIGTERM, Some(self.index)).await;
        tracing::debug!(signaled, "terminated running workers");
        table.abort(format!("{}: {}", self.host.hostname, message));
    }
}

async fn read_optional(
    buf: &mut LineBuffer,
    reader: &mut Option<crate::rcmd::BoxReader>,
) -> std::io::Result<usize> {
    match reader.as_mut() {
        Some(reader) => buf.fill(reader).await,
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: WorkerState, started: Option<Instant>, connected: Option<Instant>) -> WorkerStatus {
        WorkerStatus {
            state,
            started,
            connected,
            ..Default::default()
        }
    }

    #[test]
    fn test_overdue_connect() {
        let t0 = Instant::now();
        let s = status(WorkerState::Rcmd, Some(t0), None);
        let limit = Some(Duration::from_secs(1));
        assert_eq!(s.overdue(t0 + Duration::from_millis(500), limit, None), None);
        assert_eq!(
            s.overdue(t0 + Duration::from_secs(2), limit, None),
            Some(TimeoutKind::Connect)
        );
        // Disabled means wait forever.
        assert_eq!(s.overdue(t0 + Duration::from_secs(3600), None, None), None);
    }

    #[test]
    fn test_overdue_command_uses_connect_time() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(5);
        let s = status(WorkerState::Reading, Some(t0), Some(t1));
        let limit = Some(Duration::from_secs(2));
        assert_eq!(s.overdue(t1 + Duration::from_secs(1), limit, limit), None);
        assert_eq!(
            s.overdue(t1 + Duration::from_secs(3), limit, limit),
            Some(TimeoutKind::Command)
        );
    }

    #[test]
    fn test_overdue_ignores_other_states() {
        let t0 = Instant::now();
        let limit = Some(Duration::from_millis(1));
        let later = t0 + Duration::from_secs(10);
        for state in [
            WorkerState::New,
            WorkerState::Done,
            WorkerState::Failed,
            WorkerState::Canceled,
        ] {
            assert_eq!(status(state, Some(t0), Some(t0)).overdue(later, limit, limit), None);
        }
    }

    #[tokio::test]
    async fn test_cancel_pending_only_touches_new_and_rcmd() {
        let table = WorkerTable::new(vec![Host::new("a"), Host::new("b"), Host::new("c")]);
        assert!(table.begin_connect(1).await);
        assert!(table.begin_connect(2).await);
        {
            let mut status = table.status.lock().await;
            status[2].state = WorkerState::Reading;
        }
        assert_eq!(table.cancel_pending().await, 2);
        assert_eq!(table.state(0).await, WorkerState::Canceled);
        assert_eq!(table.state(1).await, WorkerState::Canceled);
        assert_eq!(table.state(2).await, WorkerState::Reading);
        // A canceled worker never starts connecting.
        assert!(!table.begin_connect(0).await);
    }

    #[tokio::test]
    async fn test_finish_keeps_canceled() {
        let table = WorkerTable::new(vec![Host::new("a")]);
        table.cancel_pending().await;
        table.finish(0, WorkerState::Failed, None).await;
        assert_eq!(table.state(0).await, WorkerState::Canceled);
    }

    #[tokio::test]
    async fn test_first_abort_reason_wins() {
        let table = WorkerTable::new(vec![]);
        table.abort("first");
        table.abort("second");
        assert_eq!(table.aborted().await, "first");
    }

    #[test]
    fn test_remote_command() {
        let cmd = Payload::Command("uptime".to_string());
        assert_eq!(cmd.remote_command(false), "uptime");
        assert_eq!(cmd.remote_command(true), "uptime; echo XXRETCODE:$?");
        let copy = Payload::Copy {
            source: PathBuf::from("/tmp/x"),
            dest: "/tmp/it's".to_string(),
        };
        assert_eq!(copy.remote_command(true), r"cat > '/tmp/it'\''s'");
    }
}
