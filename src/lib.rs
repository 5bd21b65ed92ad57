//! # Event driven load generator for echo-style TCP servers.
//!
//! echo-stress opens N connections to a server, exchanges a fixed text message on each of them and reports
//! aggregate throughput and success statistics after a fixed duration.
//!
//! It is built on a small Reactor pattern runtime. Each `ReactRuntime` polls the sockets of all its
//! reactors and runs on one thread, so reactors don't need any mutex to protect their state.
//! There are 2 kinds of events:
//! - socket events. `MsgReader` & `MsgSender` are provided for a Reactor to receive/send bytes.
//! - commands. Through `CmdSender`, connect/close/quit commands are queued immediately or deferred to a time.
//!
//! Every connection runs an `EchoSession`:
//! send on connect, send again on each received message, shut down after a threshold (10 by default).
//! A session closed by the peer before the threshold still counts as completed.
//!
//! ## Example
//!
//! ```rust,no_run
//! use echo_stress::{config::LoadOptions, LoadGenerator};
//! use std::time::Duration;
//!
//! let target = "127.0.0.1:9000".parse().unwrap();
//! let mut generator = LoadGenerator::new(
//!     target,
//!     LoadOptions {
//!         threads: 2, // sessions are spread over 2 reactor threads.
//!         ..LoadOptions::default()
//!     },
//! );
//! generator.start(64, Duration::from_secs(10)).unwrap();
//! let report = generator.collect_results().unwrap();
//! println!("{} of {} sessions completed", report.completed_count, report.connection_count);
//! ```

pub mod config;
mod error;
pub mod flat_storage;
pub mod generator;
pub mod logging;
mod reactor;
pub use reactor::*;
pub mod session;

pub use error::{Error, Result};
pub use generator::{LoadGenerator, LoadReport};
