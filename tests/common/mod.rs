//! Mock connection provider shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;

use fanout::rcmd::BoxReader;
use fanout::{ConnectRequest, Connection, DispatchOptions, FanoutError, Rcmd, RcmdHandle};

/// What a mock host does once connected to.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Writes the given output after `delay`, then exits with `exit`.
    Output {
        stdout: &'static str,
        stderr: &'static str,
        delay: Duration,
        exit: i32,
    },
    /// Connection is refused.
    FailConnect,
    /// Connect never returns.
    HangConnect,
    /// Prints `stdout`, then runs until signaled.
    HangUntilSignaled { stdout: &'static str },
    /// The provider panics `delay` into connecting.
    Panic { delay: Duration },
}

impl Behavior {
    pub fn echo(stdout: &'static str) -> Self {
        Behavior::Output {
            stdout,
            stderr: "",
            delay: Duration::ZERO,
            exit: 0,
        }
    }

    pub fn slow(stdout: &'static str, delay: Duration) -> Self {
        Behavior::Output {
            stdout,
            stderr: "",
            delay,
            exit: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    pub connects: Mutex<Vec<ConnectRequest>>,
    pub signals: Mutex<Vec<(String, i32)>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub connect_started: Notify,
}

impl Stats {
    pub fn connected_hosts(&self) -> Vec<String> {
        self.connects
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.host.clone())
            .collect()
    }

    pub fn signals(&self) -> Vec<(String, i32)> {
        self.signals.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Counts a host as in flight from connect until the guard is dropped.
struct InFlight(Arc<Stats>);

impl InFlight {
    fn enter(stats: &Arc<Stats>) -> Self {
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(stats))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockRcmd {
    behaviors: HashMap<String, Behavior>,
    default: Behavior,
    pub stats: Arc<Stats>,
}

impl MockRcmd {
    pub fn new(default: Behavior) -> Self {
        Self {
            behaviors: HashMap::new(),
            default,
            stats: Arc::new(Stats::default()),
        }
    }

    pub fn with(mut self, host: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(host.to_string(), behavior);
        self
    }
}

#[async_trait]
impl Rcmd for MockRcmd {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self, request: &ConnectRequest) -> Result<Connection, FanoutError> {
        self.stats.connects.lock().unwrap().push(request.clone());
        let guard = InFlight::enter(&self.stats);
        self.stats.connect_started.notify_one();

        let behavior = self
            .behaviors
            .get(&request.host)
            .unwrap_or(&self.default)
            .clone();
        let (stdout_rx, mut stdout_tx) = tokio::io::duplex(64 * 1024);
        let (stderr_rx, mut stderr_tx) = tokio::io::duplex(64 * 1024);

        let handle = MockHandle {
            host: request.host.clone(),
            stats: Arc::clone(&self.stats),
            exit: 0,
            writer: tokio::sync::Mutex::new(None),
            signaled: Mutex::new(None),
            _guard: guard,
        };
        let handle = match behavior {
            Behavior::FailConnect => {
                return Err(FanoutError::Connect("refused".to_string()));
            }
            Behavior::Panic { delay } => {
                tokio::time::sleep(delay).await;
                panic!("mock provider blew up on {}", request.host);
            }
            Behavior::HangConnect => {
                let _guard = handle;
                std::future::pending::<()>().await;
                unreachable!();
            }
            Behavior::Output {
                stdout,
                stderr,
                delay,
                exit,
            } => {
                let want_stderr = request.want_stderr;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = stdout_tx.write_all(stdout.as_bytes()).await;
                    if want_stderr {
                        let _ = stderr_tx.write_all(stderr.as_bytes()).await;
                    } else {
                        let _ = stdout_tx.write_all(stderr.as_bytes()).await;
                    }
                });
                MockHandle { exit, ..handle }
            }
            Behavior::HangUntilSignaled { stdout } => {
                stdout_tx.write_all(stdout.as_bytes()).await?;
                drop(stderr_tx);
                MockHandle {
                    writer: tokio::sync::Mutex::new(Some(stdout_tx)),
                    ..handle
                }
            }
        };

        Ok(Connection {
            stdio: Box::new(stdout_rx) as BoxReader,
            stderr: request
                .want_stderr
                .then(|| Box::new(stderr_rx) as BoxReader),
            stdin: None,
            handle: Arc::new(handle),
        })
    }
}

struct MockHandle {
    host: String,
    stats: Arc<Stats>,
    exit: i32,
    writer: tokio::sync::Mutex<Option<DuplexStream>>,
    signaled: Mutex<Option<i32>>,
    _guard: InFlight,
}

#[async_trait]
impl RcmdHandle for MockHandle {
    async fn signal(&self, signum: i32) -> Result<(), FanoutError> {
        self.stats
            .signals
            .lock()
            .unwrap()
            .push((self.host.clone(), signum));
        *self.signaled.lock().unwrap() = Some(signum);
        // Closing our end of the pipe ends the remote output.
        self.writer.lock().await.take();
        Ok(())
    }

    async fn destroy(&self) -> Result<Option<i32>, FanoutError> {
        let signaled = *self.signaled.lock().unwrap();
        Ok(Some(signaled.map(|s| 128 + s).unwrap_or(self.exit)))
    }
}

/// Options tuned for tests: fast watchdog, no process-wide signal handling.
pub fn test_options(fanout: usize) -> DispatchOptions {
    DispatchOptions {
        fanout,
        watchdog_period: Duration::from_millis(100),
        handle_signals: false,
        ..DispatchOptions::default()
    }
}

/// Polls `sink` until some stderr record contains `needle`.
pub async fn wait_for_stderr(sink: &fanout::MemorySink, needle: &str) {
    let poll = async {
        while !sink
            .text(fanout::Stream::Stderr)
            .iter()
            .any(|line| line.contains(needle))
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .unwrap_or_else(|_| panic!("no stderr output containing {:?}", needle));
}

/// Sends `signum` to this test process.
pub fn raise(signum: i32) {
    // SAFETY: raise(3) has no memory-safety preconditions.
    assert_eq!(unsafe { libc::raise(signum) }, 0);
}
