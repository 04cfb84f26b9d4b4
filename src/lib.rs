//! fsweep - one-shot fleet fault-log collection over SSH.
//!
//! Streams a self-contained text processor into remote shell sessions across
//! a fleet of machine controllers, runs it against their rotating logs since
//! a cutoff timestamp, and aggregates the per-host outcomes into an ordered
//! report. Nothing is installed or persisted on the remote side.

#![forbid(unsafe_code)]

pub mod config;
pub mod dispatch;
pub mod hosts;
pub mod logging;
pub mod parse;
pub mod persist;
pub mod redact;
pub mod report;
pub mod retry;
pub mod script;
pub mod ssh;
pub mod testing;

pub use config::{
    CollectionRequest, Credential, EnvSettings, DEFAULT_COMMAND_TIMEOUT_SECS,
    DEFAULT_CONCURRENCY, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAX_RETRIES, DEFAULT_SSH_PORT,
};
pub use dispatch::{Dispatcher, RunOutcome};
pub use hosts::{Host, HostRegistry, HostsFileError, SinceCutoff};
pub use logging::{init_logging, LogConfig, LogFormat};
pub use parse::{parse_processor_output, FaultTuple, ParseError, ProcessorReport};
pub use persist::{write_json, PersistError};
pub use report::{AggregateReport, HostResult, ResultAggregator};
pub use script::default_script;
pub use retry::{RetryPolicy, RetryableError};
pub use ssh::{SessionError, SessionOutput, SshTransport, Transport};
