//! Command line and run configuration.

use crate::session::{DEFAULT_MESSAGE_THRESHOLD, DEFAULT_PAYLOAD};
use crate::{Error, Result};
use clap::Parser;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

pub const DEFAULT_RECV_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_LOG_LEVEL: &str = "error";

/// Opens CONNECTION_COUNT connections to an echo server, exchanges messages for DURATION seconds
/// and prints throughput and success statistics.
#[derive(Parser, Debug, Clone)]
#[command(name = "echo-stress", version, about)]
pub struct Cli {
    /// Server IP address or host name.
    #[arg(value_name = "IP")]
    pub ip: String,

    /// Server port.
    #[arg(value_name = "PORT")]
    pub port: u16,

    /// Number of concurrent connections.
    #[arg(value_name = "CONNECTION_COUNT")]
    pub connection_count: usize,

    /// Run duration in seconds.
    #[arg(value_name = "DURATION", allow_hyphen_values = true)]
    pub duration: i64,

    /// Reactor threads the connections are spread over.
    #[arg(long, default_value_t = 1)]
    pub threads: usize,

    /// Received messages after which a connection is shut down.
    #[arg(long = "messages", value_name = "COUNT", default_value_t = DEFAULT_MESSAGE_THRESHOLD)]
    pub threshold: u64,

    /// Payload sent on every message.
    #[arg(long, default_value = DEFAULT_PAYLOAD)]
    pub payload: String,

    /// Upper bound of one connect attempt, in milliseconds.
    #[arg(long, value_name = "MILLIS", default_value_t = DEFAULT_CONNECT_TIMEOUT_MS)]
    pub connect_timeout_ms: u64,

    /// Minimum free space of the per-connection receive buffer.
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_RECV_BUFFER_SIZE)]
    pub recv_buffer_size: usize,

    /// Log filter, e.g. "error", "info" or "echo_stress=debug".
    #[arg(long, default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,
}

/// Tunables of a load run besides target, connection count and duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    pub threads: usize,
    pub threshold: u64,
    pub payload: Vec<u8>,
    pub connect_timeout: Duration,
    pub recv_buffer_size: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            threshold: DEFAULT_MESSAGE_THRESHOLD,
            payload: DEFAULT_PAYLOAD.as_bytes().to_vec(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }
}

impl LoadOptions {
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(Error::config("threads must be at least 1"));
        }
        if self.threshold == 0 {
            return Err(Error::config("message threshold must be at least 1"));
        }
        if self.payload.is_empty() {
            return Err(Error::config("payload must not be empty"));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::config("connect timeout must be positive"));
        }
        if self.recv_buffer_size == 0 {
            return Err(Error::config("receive buffer size must be positive"));
        }
        Ok(())
    }
}

/// A validated run, ready for `LoadGenerator`.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub target: SocketAddr,
    pub connection_count: usize,
    pub duration: Duration,
    pub options: LoadOptions,
}

impl Cli {
    pub fn into_config(self) -> Result<RunConfig> {
        if self.connection_count == 0 {
            return Err(Error::config("connection count must be at least 1"));
        }
        if self.duration <= 0 {
            return Err(Error::config(format!(
                "duration must be a positive number of seconds, got {}",
                self.duration
            )));
        }
        let options = LoadOptions {
            threads: self.threads,
            threshold: self.threshold,
            payload: self.payload.into_bytes(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            recv_buffer_size: self.recv_buffer_size,
        };
        options.validate()?;
        Ok(RunConfig {
            target: resolve_target(&self.ip, self.port)?,
            connection_count: self.connection_count,
            duration: Duration::from_secs(self.duration.unsigned_abs()),
            options,
        })
    }
}

/// Resolve host and port to the first socket address.
pub fn resolve_target(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| Error::resolve(format!("{host}:{port}")))
}
