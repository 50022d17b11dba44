//! Fanout: run one command on many hosts at once.

// Serde helper module.
mod serde;
// Command line arguments and engine options.
pub mod config;
// How to parse and represent hosts.
pub mod host;
// Per-stream line buffering.
pub mod buffer;
// In-band remote return codes.
pub mod retcode;
// Output sinks and host labels.
pub mod output;
// Connection providers.
pub mod rcmd;
// Per-host workers and their shared table.
pub mod worker;
// Timeout enforcement.
pub mod watchdog;
// Interrupt and suspend handling.
pub mod signals;
// The fanout dispatcher.
pub mod dispatch;
// Error handling.
pub mod error;

pub use config::{Config, DispatchOptions, Mode};
pub use dispatch::{DispatchReport, Dispatcher, HostReport};
pub use error::{FanoutError, TimeoutKind};
pub use host::{get_hosts, Host};
pub use output::{MemorySink, OutputSink, StdioSink, Stream};
pub use rcmd::{ConnectRequest, Connection, Rcmd, RcmdHandle, RcmdRegistry};
pub use worker::{Payload, WorkerState};
