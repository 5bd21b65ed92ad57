//! Per-connection echo protocol.
//!
//! `EchoSession` is a plain state machine driven by `SessionEvent`s, so its policy can be
//! exercised without sockets. `SessionReactor` binds it to a connection of a `ReactRuntime`.

use crate::reactor::{CmdSender, DispatchContext, MessageResult, Reactor, ReactorID};
use crate::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace};

/// Sent on connect and after every received message below the threshold.
pub const DEFAULT_PAYLOAD: &str = "Hello from client!";
/// Number of received messages after which a session shuts its connection down.
pub const DEFAULT_MESSAGE_THRESHOLD: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    MessageReceived,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Completed,
}

/// What the connection has to do after a session handled an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    None,
    Send,
    Shutdown,
}

/// Counters of one session. Written by the event loop thread, read by the aggregation
/// once the loop stopped, possibly from another thread.
#[derive(Debug)]
pub struct SessionStats {
    message_count: AtomicU64,
    completed: AtomicBool,
    start_time: Instant,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStats {
    /// The start time is captured here.
    pub fn new() -> Self {
        Self {
            message_count: AtomicU64::new(0),
            completed: AtomicBool::new(false),
            start_time: Instant::now(),
        }
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed_seconds_at(Instant::now())
    }

    /// Seconds from start to `now`, 0 if `now` is earlier.
    pub fn elapsed_seconds_at(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.start_time).as_secs_f64()
    }

    fn increment_messages(&self) -> u64 {
        self.message_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// return true only for the call that flipped the flag.
    fn mark_completed(&self) -> bool {
        !self.completed.swap(true, Ordering::AcqRel)
    }
}

/// One logical client connection: Connecting -> Active -> Completed.
#[derive(Debug)]
pub struct EchoSession {
    id: usize,
    threshold: u64,
    state: SessionState,
    stats: Arc<SessionStats>,
}

impl EchoSession {
    pub fn new(id: usize, threshold: u64, stats: Arc<SessionStats>) -> Self {
        Self {
            id,
            threshold,
            state: SessionState::Connecting,
            stats,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }
    pub fn state(&self) -> SessionState {
        self.state
    }
    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }
    pub fn message_count(&self) -> u64 {
        self.stats.message_count()
    }
    pub fn is_completed(&self) -> bool {
        self.stats.is_completed()
    }
    pub fn elapsed_seconds(&self) -> f64 {
        self.stats.elapsed_seconds()
    }

    pub fn handle(&mut self, event: SessionEvent) -> SessionAction {
        match event {
            SessionEvent::Connected => self.on_connected(),
            SessionEvent::MessageReceived => self.on_message_received(),
            SessionEvent::Disconnected => self.on_disconnected(),
        }
    }

    fn on_connected(&mut self) -> SessionAction {
        if self.state != SessionState::Connecting {
            return SessionAction::None;
        }
        self.state = SessionState::Active;
        SessionAction::Send
    }

    fn on_message_received(&mut self) -> SessionAction {
        if self.state == SessionState::Completed {
            return SessionAction::None;
        }
        self.state = SessionState::Active;
        let count = self.stats.increment_messages();
        if count < self.threshold {
            return SessionAction::Send;
        }
        self.complete();
        SessionAction::Shutdown
    }

    /// A peer close before the threshold still counts as completed.
    fn on_disconnected(&mut self) -> SessionAction {
        self.complete();
        SessionAction::None
    }

    fn complete(&mut self) {
        self.state = SessionState::Completed;
        if self.stats.mark_completed() {
            trace!(session = self.id, messages = self.stats.message_count(), "session completed");
        }
    }
}

/// Runs an `EchoSession` on a runtime connection. Each readable batch of bytes is one message
/// event; the bytes are consumed without being inspected.
pub struct SessionReactor {
    session: EchoSession,
    payload: Arc<[u8]>,
}

impl SessionReactor {
    pub fn new(session: EchoSession, payload: Arc<[u8]>) -> Self {
        Self { session, payload }
    }

    pub fn session(&self) -> &EchoSession {
        &self.session
    }

    fn apply(&mut self, action: SessionAction, ctx: &mut DispatchContext<'_>) -> Result<()> {
        match action {
            SessionAction::None => {}
            SessionAction::Send => {
                ctx.send_or_que(&self.payload)?;
            }
            SessionAction::Shutdown => {
                info!(
                    session = self.session.id(),
                    peer = ?ctx.peer_addr(),
                    messages = self.session.message_count(),
                    bytes_sent = ctx.sender.bytes_sent(),
                    "message threshold reached, shutting down connection"
                );
                ctx.shutdown()?;
            }
        }
        Ok(())
    }
}

impl Reactor for SessionReactor {
    fn on_connected(&mut self, ctx: &mut DispatchContext<'_>) -> Result<()> {
        debug!(session = self.session.id(), reactorid = %ctx.reactorid, "session connected");
        let action = self.session.handle(SessionEvent::Connected);
        self.apply(action, ctx)
    }

    fn on_inbound_message(
        &mut self,
        buf: &mut [u8],
        _new_bytes: usize,
        _decoded_msg_size: usize,
        ctx: &mut DispatchContext<'_>,
    ) -> Result<MessageResult> {
        let action = self.session.handle(SessionEvent::MessageReceived);
        self.apply(action, ctx)?;
        Ok(MessageResult::DropMsgSize(buf.len()))
    }

    fn on_close(&mut self, reactorid: ReactorID, _cmd_sender: &CmdSender) {
        debug!(
            session = self.session.id(),
            %reactorid,
            messages = self.session.message_count(),
            "session disconnected"
        );
        self.session.handle(SessionEvent::Disconnected);
    }
}
