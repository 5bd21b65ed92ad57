//! Load generation: N echo sessions against one target, bounded by a wall-clock duration.

use crate::config::LoadOptions;
use crate::reactor::{Deferred, ReactRuntime};
use crate::session::{EchoSession, SessionReactor, SessionStats};
use crate::{Error, Result};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Drives `connection_count` sessions for a fixed duration, then aggregates their counters.
///
/// ```rust,no_run
/// use echo_stress::{config::LoadOptions, LoadGenerator};
/// use std::time::Duration;
///
/// let target = "127.0.0.1:9000".parse().unwrap();
/// let mut generator = LoadGenerator::new(target, LoadOptions::default());
/// generator.start(100, Duration::from_secs(5)).unwrap();
/// print!("{}", generator.collect_results().unwrap());
/// ```
pub struct LoadGenerator {
    target: SocketAddr,
    options: LoadOptions,
    sessions: Vec<Arc<SessionStats>>,
}

impl LoadGenerator {
    pub fn new(target: SocketAddr, options: LoadOptions) -> Self {
        Self {
            target,
            options,
            sessions: Vec::new(),
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// Session counters in creation order. Empty before `start`.
    pub fn sessions(&self) -> &[Arc<SessionStats>] {
        &self.sessions
    }

    /// Create the sessions, connect them and run the event loop(s) until `duration` elapses.
    /// Blocks the calling thread for the whole run. Connects don't block the loop, so a stalled
    /// target doesn't extend the run. Connections that fail are not retried.
    pub fn start(&mut self, connection_count: usize, duration: Duration) -> Result<()> {
        if !self.sessions.is_empty() {
            return Err(Error::AlreadyStarted);
        }
        if connection_count == 0 {
            return Err(Error::config("connection count must be at least 1"));
        }
        if duration.is_zero() {
            return Err(Error::config("duration must be positive"));
        }
        self.options.validate()?;
        let deadline = Instant::now()
            .checked_add(duration)
            .ok_or_else(|| Error::config(format!("duration {duration:?} is too large")))?;

        self.sessions = (0..connection_count)
            .map(|_| Arc::new(SessionStats::new()))
            .collect();
        let threads = self.options.threads.min(connection_count);
        info!(
            server = %self.target,
            connections = connection_count,
            ?duration,
            threads,
            "starting load run"
        );

        if threads == 1 {
            let sessions = self.sessions.iter().cloned().enumerate().collect();
            return run_sessions(self.target, &self.options, sessions, deadline);
        }

        let (target, options) = (self.target, &self.options);
        let sessions = &self.sessions;
        thread::scope(|scope| -> Result<()> {
            let mut handles = Vec::with_capacity(threads);
            for threadid in 0..threads {
                // round-robin over the reactor threads.
                let assigned: Vec<_> = sessions
                    .iter()
                    .cloned()
                    .enumerate()
                    .skip(threadid)
                    .step_by(threads)
                    .collect();
                let handle = thread::Builder::new()
                    .name(format!("echo-stress-{threadid}"))
                    .spawn_scoped(scope, move || {
                        run_sessions(target, options, assigned, deadline)
                    })?;
                handles.push(handle);
            }
            handles.into_iter().try_for_each(|handle| {
                handle
                    .join()
                    .map_err(|_| Error::reactor_thread("reactor thread panicked"))?
            })
        })
    }

    /// Aggregate the session counters. Call after `start` returned.
    pub fn collect_results(&self) -> Result<LoadReport> {
        if self.sessions.is_empty() {
            return Err(Error::NotStarted);
        }
        let now = Instant::now();
        let samples: Vec<_> = self
            .sessions
            .iter()
            .map(|stats| SessionSample {
                messages: stats.message_count(),
                elapsed_seconds: stats.elapsed_seconds_at(now),
                completed: stats.is_completed(),
            })
            .collect();
        Ok(LoadReport::from_samples(&samples))
    }
}

/// Run one event loop with the given sessions until `deadline`.
fn run_sessions(
    target: SocketAddr,
    options: &LoadOptions,
    sessions: Vec<(usize, Arc<SessionStats>)>,
    deadline: Instant,
) -> Result<()> {
    let mut runtime = ReactRuntime::new()?;
    runtime.set_connect_timeout(options.connect_timeout);
    let payload: Arc<[u8]> = Arc::from(options.payload.as_slice());
    let cmd_sender = runtime.get_cmd_sender().clone();
    // armed first so that it is scheduled before any connect attempt.
    cmd_sender.send_quit(Deferred::UntilTime(deadline))?;
    let count = sessions.len();
    for (id, stats) in sessions {
        let reactor = SessionReactor::new(
            EchoSession::new(id, options.threshold, stats),
            Arc::clone(&payload),
        );
        cmd_sender.send_connect(
            target,
            options.recv_buffer_size,
            reactor,
            Deferred::Immediate,
            move |completion| {
                if let Err(err) = completion {
                    debug!(session = id, error = %err, "connection not established");
                }
            },
        )?;
    }
    debug!(sessions = count, "event loop running");
    runtime.run()?;
    debug!(
        sessions = count,
        open = runtime.count_reactors(),
        sock_events = runtime.count_sock_events(),
        "event loop stopped"
    );
    Ok(())
}

/// Counters of one session at aggregation time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSample {
    pub messages: u64,
    pub elapsed_seconds: f64,
    pub completed: bool,
}

/// Aggregate statistics of a load run.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadReport {
    pub connection_count: usize,
    pub completed_count: usize,
    pub total_messages: u64,
    /// Sum of the per-session elapsed times.
    pub total_elapsed_seconds: f64,
    pub avg_duration_per_client: f64,
    /// `total_messages / total_elapsed_seconds`: a rate over the summed per-session durations,
    /// not over the wall-clock run time, so it behaves like a per-connection rate.
    pub throughput: f64,
    /// Percentage of completed sessions. Sessions the peer disconnected early count as completed.
    pub success_rate: f64,
}

impl LoadReport {
    pub fn from_samples(samples: &[SessionSample]) -> Self {
        let connection_count = samples.len();
        let total_messages: u64 = samples.iter().map(|s| s.messages).sum();
        let total_elapsed_seconds: f64 = samples.iter().map(|s| s.elapsed_seconds).sum();
        let completed_count = samples.iter().filter(|s| s.completed).count();
        let (avg_duration_per_client, success_rate) = if connection_count == 0 {
            (0.0, 0.0)
        } else {
            (
                total_elapsed_seconds / connection_count as f64,
                100.0 * completed_count as f64 / connection_count as f64,
            )
        };
        let throughput = if total_elapsed_seconds > 0.0 {
            total_messages as f64 / total_elapsed_seconds
        } else {
            0.0
        };
        Self {
            connection_count,
            completed_count,
            total_messages,
            total_elapsed_seconds,
            avg_duration_per_client,
            throughput,
            success_rate,
        }
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Test results:")?;
        writeln!(f, "Total messages sent: {}", self.total_messages)?;
        writeln!(
            f,
            "Average duration per client: {:.3} seconds",
            self.avg_duration_per_client
        )?;
        writeln!(f, "Throughput (messages per second): {:.2}", self.throughput)?;
        writeln!(f, "Success rate: {:.2}%", self.success_rate)
    }
}
