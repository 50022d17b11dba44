//! The fanout dispatcher.
//!
//! Admits at most `fanout` workers at a time, in target order, and replaces each
//! finished worker with the next target. Workers report completion over a channel
//! so the dispatcher handles them in the order they finish.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use colourado::{ColorPalette, PaletteType};
use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::config::{local_user, DispatchOptions};
use crate::error::{FanoutError, Result};
use crate::host::{dedup_hosts, Host};
use crate::output::{Label, OutputSink, StdioSink, Stream};
use crate::rcmd::{Rcmd, RcmdRegistry};
use crate::retcode::RC_FAILED;
use crate::signals;
use crate::watchdog;
use crate::worker::{Payload, Worker, WorkerShared, WorkerState, WorkerTable};

/// Descriptors kept free on top of two per in-flight host.
const FD_SLACK: usize = 32;

/// Message sent from a worker task when it is done.
#[derive(Debug)]
struct Completion {
    index: usize,
    panicked: bool,
}

pub struct Dispatcher {
    options: DispatchOptions,
    registry: Arc<RcmdRegistry>,
    sink: Arc<dyn OutputSink>,
}

impl Dispatcher {
    pub fn new(options: DispatchOptions, registry: RcmdRegistry) -> Self {
        Self {
            options,
            registry: Arc::new(registry),
            sink: Arc::new(StdioSink),
        }
    }

    /// Sends output somewhere other than the process stdout/stderr.
    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Runs `payload` on every host and waits for all of them.
    pub async fn run(&self, hosts: Vec<Host>, payload: Payload) -> Result<DispatchReport> {
        let options = &self.options;
        if options.fanout == 0 {
            return Err(FanoutError::Config("fanout must be at least 1".to_string()));
        }
        let hosts = dedup_hosts(hosts);
        let providers = hosts
            .iter()
            .map(|host| self.registry.select(host))
            .collect::<Result<Vec<Arc<dyn Rcmd>>>>()?;
        let labels = self.labels(&hosts);

        raise_fd_limit(options.fanout.min(hosts.len()));

        let table = Arc::new(WorkerTable::new(hosts));
        let shared = Arc::new(WorkerShared {
            table: Arc::clone(&table),
            options: options.clone(),
            payload,
            sink: Arc::clone(&self.sink),
            local_user: local_user(),
        });

        let watchdog = tokio::spawn(watchdog::run(
            Arc::downgrade(&table),
            options.watchdog_period,
            options.connect_timeout,
            options.command_timeout,
        ));
        let coordinator = if options.handle_signals {
            match signals::spawn(Arc::clone(&table), Arc::clone(&self.sink), options) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    watchdog.abort();
                    return Err(e);
                }
            }
        } else {
            None
        };

        let result = self.admit_all(&table, &shared, providers, labels).await;

        // The handlers stay registered with tokio; only the coordinator stops.
        if let Some(coordinator) = coordinator {
            coordinator.abort();
        }
        watchdog.abort();
        drop(shared);

        result?;
        let report = DispatchReport::collect(&table, options.remote_rc).await;
        if options.debug {
            self.sink.write(Stream::Stderr, report.summary().as_bytes());
        }
        Ok(report)
    }

    async fn admit_all(
        &self,
        table: &Arc<WorkerTable>,
        shared: &Arc<WorkerShared>,
        providers: Vec<Arc<dyn Rcmd>>,
        labels: Vec<Label>,
    ) -> Result<()> {
        let fanout = self.options.fanout;
        let (completion_tx, completion_rx) = flume::bounded::<Completion>(table.len().max(1));
        let mut tasks: Vec<Option<JoinHandle<()>>> = (0..table.len()).map(|_| None).collect();
        let mut active = 0;

        for (index, (rcmd, label)) in providers.into_iter().zip(labels).enumerate() {
            while active >= fanout {
                self.wait_one(table, &completion_rx, &mut tasks).await?;
                active -= 1;
            }
            if table.state(index).await == WorkerState::Canceled {
                tracing::debug!(host = %table.host(index), "skipping canceled host");
                continue;
            }

            let worker = Worker::new(index, label, rcmd, Arc::clone(shared));
            let completion_tx = completion_tx.clone();
            tasks[index] = Some(tokio::spawn(async move {
                let panicked = AssertUnwindSafe(worker.run()).catch_unwind().await.is_err();
                let _ = completion_tx.send_async(Completion { index, panicked }).await;
            }));
            active += 1;
            tracing::debug!(host = %table.host(index), active, "admitted");
        }

        while active > 0 {
            self.wait_one(table, &completion_rx, &mut tasks).await?;
            active -= 1;
        }
        match table.abort_reason() {
            Some(reason) => Err(FanoutError::Aborted(reason)),
            None => Ok(()),
        }
    }

    /// Waits for one worker to finish, or for the dispatch to be aborted.
    async fn wait_one(
        &self,
        table: &WorkerTable,
        completion_rx: &flume::Receiver<Completion>,
        tasks: &mut [Option<JoinHandle<()>>],
    ) -> Result<()> {
        let completion = tokio::select! {
            biased;
            reason = table.aborted() => {
                abort_all(tasks);
                return Err(FanoutError::Aborted(reason));
            }
            completion = completion_rx.recv_async() => completion,
        };
        let Ok(Completion { index, panicked }) = completion else {
            abort_all(tasks);
            return Err(FanoutError::Aborted("completion channel closed".to_string()));
        };
        tasks[index] = None;
        if panicked {
            let host = table.host(index).hostname.clone();
            table.signal_reading(libc::SIGTERM, None).await;
            abort_all(tasks);
            return Err(FanoutError::Spawn {
                host,
                reason: "worker panicked".to_string(),
            });
        }
        Ok(())
    }

    fn labels(&self, hosts: &[Host]) -> Vec<Label> {
        if !self.options.labels {
            return hosts.iter().map(|_| Label::none()).collect();
        }
        if !self.options.color {
            return hosts.iter().map(|h| Label::plain(&h.hostname)).collect();
        }
        let colors = ColorPalette::new(hosts.len() as u32, PaletteType::Pastel, false).colors;
        hosts
            .iter()
            .zip(colors)
            .map(|(host, color)| Label::colored(&host.hostname, color))
            .collect()
    }
}

fn abort_all(tasks: &mut [Option<JoinHandle<()>>]) {
    for task in tasks.iter_mut().filter_map(Option::take) {
        task.abort();
    }
}

/// Raises the soft open-file limit to cover two descriptors per in-flight host.
fn raise_fd_limit(in_flight: usize) {
    let want = (2 * in_flight + FD_SLACK) as libc::rlim_t;
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid, writable rlimit.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        tracing::warn!("getrlimit: {}", std::io::Error::last_os_error());
        return;
    }
    if limit.rlim_cur >= want {
        return;
    }
    let raised = libc::rlimit {
        rlim_cur: want.min(limit.rlim_max),
        rlim_max: limit.rlim_max,
    };
    // SAFETY: `raised` is a valid rlimit.
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &raised) } != 0 {
        tracing::warn!("setrlimit: {}", std::io::Error::last_os_error());
        return;
    }
    tracing::debug!(from = limit.rlim_cur, to = raised.rlim_cur, "raised open file limit");
}

/// Final state of one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostReport {
    pub host: String,
    pub state: WorkerState,
    pub rc: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub hosts: Vec<HostReport>,
    remote_rc: bool,
}

impl DispatchReport {
    pub fn new(hosts: Vec<HostReport>, remote_rc: bool) -> Self {
        Self { hosts, remote_rc }
    }

    async fn collect(table: &WorkerTable, remote_rc: bool) -> Self {
        let hosts = table
            .snapshot()
            .await
            .into_iter()
            .map(|view| HostReport {
                host: view.host,
                state: view.state,
                rc: view.rc,
            })
            .collect();
        Self { hosts, remote_rc }
    }

    pub fn failed(&self) -> usize {
        self.count(WorkerState::Failed)
    }

    pub fn canceled(&self) -> usize {
        self.count(WorkerState::Canceled)
    }

    fn count(&self, state: WorkerState) -> usize {
        self.hosts.iter().filter(|h| h.state == state).count()
    }

    pub fn get(&self, host: &str) -> Option<&HostReport> {
        self.hosts.iter().find(|h| h.host == host)
    }

    /// Process exit code for this dispatch.
    ///
    /// With remote return codes this is the largest code any host reported, a
    /// host without a code counting as `RC_FAILED`. Otherwise it is 1 if any host
    /// failed. Canceled hosts never count.
    pub fn exit_code(&self) -> i32 {
        if !self.remote_rc {
            return if self.failed() > 0 { 1 } else { 0 };
        }
        self.hosts
            .iter()
            .filter_map(|h| match (h.state, h.rc) {
                (WorkerState::Canceled, _) => None,
                (WorkerState::Done, Some(rc)) => Some(rc),
                _ => Some(RC_FAILED),
            })
            .max()
            .unwrap_or(0)
    }

    pub fn summary(&self) -> String {
        format!(
            "fanout: {} hosts, {} failed, {} canceled\n",
            self.hosts.len(),
            self.failed(),
            self.canceled()
        )
    }
}
