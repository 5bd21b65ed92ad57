use crate::flat_storage::FlatStorage;
use crate::{Error, Result};
use polling::{Event, Events, PollMode, Poller};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

//====================================================================================
//            Reactor
//====================================================================================

/// A `Reactor` handles the events of one TCP connection. It is assigned a unique `ReactorID` when the
/// connection is added to a `ReactRuntime`, and is destroyed when the socket is closed.
/// All callbacks of a runtime are dispatched sequentially on the thread that drives `process_events`.
pub trait Reactor {
    /// Called once the connection is established. Bytes sent here are queued if the socket is not writable.
    /// * return Err to close the connection.
    fn on_connected(&mut self, _ctx: &mut DispatchContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Called when new bytes are read, with `buf` holding all unprocessed bytes.
    ///
    /// * `new_bytes` - number of bytes at the end of `buf` that were not passed before.
    /// * `decoded_msg_size` - value of the last `ExpectMsgSize`; 0 means the size is unknown.
    /// * return `ExpectMsgSize(n)` to wait for more bytes (n == 0: size unknown, call again on next read;
    ///   otherwise n must exceed `buf.len()`), `DropMsgSize(n)` after consuming n bytes, or `Close`.
    fn on_inbound_message(
        &mut self,
        buf: &mut [u8],
        new_bytes: usize,
        decoded_msg_size: usize,
        ctx: &mut DispatchContext<'_>,
    ) -> Result<MessageResult>;

    /// Called after the reactor is removed from the poller and before its socket is closed.
    /// Not called for connections that are still open when the runtime is dropped.
    fn on_close(&mut self, _reactorid: ReactorID, _cmd_sender: &CmdSender) {}
}

/// `DispatchContext` is the connection handle passed to reactor callbacks.
pub struct DispatchContext<'a> {
    pub reactorid: ReactorID,
    pub sock: &'a mut TcpStream,
    pub sender: &'a mut MsgSender,
    pub cmd_sender: &'a CmdSender,
}

impl DispatchContext<'_> {
    /// Send bytes or queue them for the next writable event.
    pub fn send_or_que(&mut self, buf: &[u8]) -> Result<SendOrQueResult> {
        self.sender.send_or_que(self.sock, buf)
    }

    /// Graceful shutdown: the write side is closed once all queued bytes are flushed.
    /// The connection stays registered until the peer closes its side.
    pub fn shutdown(&mut self) -> Result<()> {
        self.sender.shutdown(self.sock)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.sock.peer_addr().ok()
    }

    /// false once a shutdown was requested or the socket failed.
    pub fn connected(&self) -> bool {
        self.sender.is_writable()
    }
}

/// `MessageResult` is returned by `on_inbound_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageResult {
    /// Stop reading and close the socket.
    Close,
    /// Partial message. Carries the decoded message size, or 0 when the size is still unknown.
    ExpectMsgSize(usize),
    /// A message of the given size has been processed and can be dropped from the buffer.
    DropMsgSize(usize),
}

/// `Deferred` tells whether a command is executed immediately or as a one-shot timer.
#[derive(Debug, Clone, Copy)]
pub enum Deferred {
    Immediate,
    After(Duration),
    UntilTime(Instant),
}

impl Deferred {
    fn deadline(self) -> Option<Instant> {
        match self {
            Deferred::Immediate => None,
            Deferred::After(delay) => Some(Instant::now() + delay),
            Deferred::UntilTime(deadline) => Some(deadline),
        }
    }
}

/// Argument of command completion callbacks.
pub type CommandCompletion = Result<ReactorID>;

//====================================================================================
//            CmdSender
//====================================================================================

/// `CmdSender` queues commands to the `ReactRuntime` that owns it.
/// Reactors use it from inside callbacks, when the runtime itself is mutably borrowed.
#[derive(Clone)]
pub struct CmdSender(mpsc::Sender<CmdData>);

impl CmdSender {
    /// Start a non-blocking connect to `remote_addr`. `reactor` is added to the runtime right away and
    /// `on_connected` is called once the connect completes.
    /// * `completion` - receives the new ReactorID once connected, or the connect error (refused, timed out).
    ///   On error the reactor is dropped without any callback.
    pub fn send_connect(
        &self,
        remote_addr: SocketAddr,
        recv_buffer_min_size: usize,
        reactor: impl Reactor + 'static,
        deferred: Deferred,
        completion: impl FnOnce(CommandCompletion) + 'static,
    ) -> Result<()> {
        self.send_cmd(
            INVALID_REACTOR_ID,
            SysCommand::NewConnect(Box::new(reactor), remote_addr, recv_buffer_min_size),
            deferred,
            completion,
        )
    }

    /// Close a reactor and its socket. `on_close` is called on the reactor.
    pub fn send_close(
        &self,
        reactorid: ReactorID,
        deferred: Deferred,
        completion: impl FnOnce(CommandCompletion) + 'static,
    ) -> Result<()> {
        self.send_cmd(reactorid, SysCommand::CloseSocket, deferred, completion)
    }

    /// Make `ReactRuntime::run` return. Combined with a deferred time, this bounds the run duration.
    pub fn send_quit(&self, deferred: Deferred) -> Result<()> {
        self.send_cmd(INVALID_REACTOR_ID, SysCommand::Quit, deferred, |_| {})
    }

    fn send_cmd(
        &self,
        reactorid: ReactorID,
        cmd: SysCommand,
        deferred: Deferred,
        completion: impl FnOnce(CommandCompletion) + 'static,
    ) -> Result<()> {
        if matches!(cmd, SysCommand::CloseSocket) && reactorid == INVALID_REACTOR_ID {
            return Err(Error::UnknownReactor {
                reactorid: reactorid.to_string(),
            });
        }
        self.0
            .send(CmdData {
                reactorid,
                cmd,
                deadline: deferred.deadline(),
                completion: Box::new(completion),
            })
            .map_err(|_| Error::CommandChannelClosed)
    }
}

enum SysCommand {
    NewConnect(Box<dyn Reactor>, SocketAddr, usize), // reactor, remote address, min recv buffer size
    CloseSocket,
    ConnectTimeout,
    Quit,
}

struct CmdData {
    reactorid: ReactorID,
    cmd: SysCommand,
    deadline: Option<Instant>,
    completion: CompletionFn,
}

type CompletionFn = Box<dyn FnOnce(CommandCompletion)>;
/// The new ReactorID, or the error with the completion handed back.
type ConnectStart = std::result::Result<ReactorID, (Error, CompletionFn)>;

//====================================================================================
//            ReactorID
//====================================================================================

#[cfg(target_pointer_width = "64")]
type HalfUsize = u32;
#[cfg(target_pointer_width = "32")]
type HalfUsize = u16;

/// Identifies a reactor in its runtime. `ver` tells apart reactors that reuse the same slot,
/// so a stale poll event never reaches a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReactorID {
    sockslot: HalfUsize,
    ver: HalfUsize,
}

pub const INVALID_REACTOR_ID: ReactorID = ReactorID {
    sockslot: HalfUsize::MAX,
    ver: HalfUsize::MAX,
};

impl ReactorID {
    const HALF_BITS: usize = std::mem::size_of::<usize>() * 8 / 2;

    /// convert to poller event key
    pub fn to_usize(&self) -> usize {
        ((self.ver as usize) << Self::HALF_BITS) | (self.sockslot as usize)
    }
    /// convert from poller event key
    pub fn from_usize(val: usize) -> Self {
        Self {
            sockslot: val as HalfUsize,
            ver: (val >> Self::HALF_BITS) as HalfUsize,
        }
    }
    fn slot(&self) -> usize {
        self.sockslot as usize
    }
}

impl std::fmt::Display for ReactorID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.sockslot, self.ver)
    }
}

//====================================================================================
//            ReactRuntime
//====================================================================================

/// `ReactRuntime` owns a poller, the connected reactors, a command queue and a deferred command queue.
/// It is the event loop: `run` dispatches socket events and commands until a quit command executes.
/// A runtime is driven by one thread; use one runtime per thread for multi-threaded setups.
pub struct ReactRuntime {
    mgr: ReactorMgr,
    deferred_data: FlatStorage<CmdData>,
    deferred_heap: BinaryHeap<Reverse<DeferredKey>>,
    sock_events: Events, // decoupled from mgr to iterate events while mutating reactors.
    connect_timeout: Duration,
    quit: bool,
    accum_sock_events: usize,
    accum_commands: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DeferredKey {
    deadline: Instant,
    data: usize, // key in deferred_data
}

impl ReactRuntime {
    pub fn new() -> Result<Self> {
        Ok(Self {
            mgr: ReactorMgr::new()?,
            deferred_data: FlatStorage::new(),
            deferred_heap: BinaryHeap::new(),
            sock_events: Events::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            quit: false,
            accum_sock_events: 0,
            accum_commands: 0,
        })
    }

    /// Upper bound of a connect attempt. A connect still pending after it fails with `TimedOut`.
    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    /// Get the `CmdSender` of this runtime.
    pub fn get_cmd_sender(&self) -> &CmdSender {
        &self.mgr.cmd_sender
    }

    pub fn count_reactors(&self) -> usize {
        self.mgr.streams.len()
    }
    /// number of commands waiting for their deferred time.
    pub fn count_deferred_queue(&self) -> usize {
        self.deferred_data.len()
    }
    pub fn count_sock_events(&self) -> usize {
        self.accum_sock_events
    }
    pub fn count_received_commands(&self) -> usize {
        self.accum_commands
    }

    /// Process events until a quit command executes, or until there is nothing left to process.
    pub fn run(&mut self) -> Result<()> {
        self.quit = false;
        while !self.quit {
            if !self.process_events()? {
                debug!("no reactors, commands or timers left. leaving event loop");
                break;
            }
        }
        Ok(())
    }

    /// One tick of the event loop.
    /// - return true if the runtime still has any reactor, command or deferred command.
    pub fn process_events(&mut self) -> Result<bool> {
        self.process_events_with(Duration::from_millis(1), 32)
    }

    pub fn process_events_with(
        &mut self,
        sock_timeout: Duration,
        max_commands: usize,
    ) -> Result<bool> {
        let timeout = match self.deferred_heap.peek() {
            Some(Reverse(key)) => sock_timeout.min(key.deadline.saturating_duration_since(Instant::now())),
            None => sock_timeout,
        };
        let sock_events = self.process_sock_events(timeout)?;
        self.accum_sock_events += sock_events;
        self.process_deferred_queue();
        let cmds = self.process_command_queue(max_commands);
        self.accum_commands += cmds;
        Ok(sock_events > 0
            || cmds > 0
            || !self.deferred_heap.is_empty()
            || !self.mgr.streams.is_empty())
    }

    /// return number of socket events processed.
    pub fn process_sock_events(&mut self, timeout: Duration) -> Result<usize> {
        self.sock_events.clear();
        match self.mgr.poller.wait(&mut self.sock_events, Some(timeout)) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(err.into()),
        }
        for ev in self.sock_events.iter() {
            let reactorid = ReactorID::from_usize(ev.key);
            let close = match self.mgr.streams.get_mut(reactorid.slot()) {
                Some(handler) if handler.data.reactorid == reactorid => {
                    if handler.data.pending_connect.is_some() {
                        self.mgr.finish_connect(reactorid);
                        continue;
                    }
                    dispatch_sock_event(&self.mgr.poller, &self.mgr.cmd_sender, handler, &ev)
                }
                _ => {
                    trace!(%reactorid, "event for a removed reactor");
                    continue;
                }
            };
            if close {
                self.mgr.close_reactor(reactorid);
            }
        }
        Ok(self.sock_events.len())
    }

    /// return number of commands executed.
    pub fn process_command_queue(&mut self, max_commands: usize) -> usize {
        let mut count_cmd = 0;
        while count_cmd < max_commands && !self.quit {
            // never disconnected since mgr keeps a sender.
            let Ok(cmddata) = self.mgr.cmd_recv.try_recv() else {
                break;
            };
            count_cmd += 1;
            if let Some(deadline) = cmddata.deadline {
                if deadline > Instant::now() {
                    let data = self.deferred_data.add(cmddata);
                    self.deferred_heap.push(Reverse(DeferredKey { deadline, data }));
                    continue;
                }
            }
            self.execute_immediate_cmd(cmddata);
        }
        count_cmd
    }

    /// return number of deferred commands that became due and were executed.
    pub fn process_deferred_queue(&mut self) -> usize {
        let now = Instant::now();
        let mut cmds = 0;
        while let Some(Reverse(key)) = self.deferred_heap.peek().copied() {
            if self.quit || key.deadline > now {
                break;
            }
            self.deferred_heap.pop();
            if let Some(cmddata) = self.deferred_data.remove(key.data) {
                self.execute_immediate_cmd(cmddata);
                cmds += 1;
            }
        }
        cmds
    }

    fn execute_immediate_cmd(&mut self, cmddata: CmdData) {
        let CmdData {
            reactorid,
            cmd,
            completion,
            ..
        } = cmddata;
        match cmd {
            SysCommand::NewConnect(reactor, remote_addr, recv_buffer_min_size) => {
                match self
                    .mgr
                    .start_connect(remote_addr, recv_buffer_min_size, reactor, completion)
                {
                    Ok(newid) => {
                        trace!(reactorid = %newid, %remote_addr, "connect in progress");
                        self.arm_connect_timeout(newid);
                    }
                    Err((err, completion)) => {
                        debug!(%remote_addr, error = %err, "failed to connect");
                        completion(Err(err));
                    }
                }
            }
            SysCommand::ConnectTimeout => {
                if self.mgr.is_connecting(reactorid) {
                    let err = io::Error::new(ErrorKind::TimedOut, "connect timed out");
                    self.mgr.fail_connect(reactorid, err.into());
                }
            }
            SysCommand::CloseSocket => {
                if self.mgr.close_reactor(reactorid) {
                    completion(Ok(reactorid));
                } else {
                    completion(Err(Error::UnknownReactor {
                        reactorid: reactorid.to_string(),
                    }));
                }
            }
            SysCommand::Quit => {
                debug!(reactors = self.mgr.streams.len(), "quit requested");
                self.quit = true;
                completion(Ok(INVALID_REACTOR_ID));
            }
        }
    }

    fn arm_connect_timeout(&mut self, reactorid: ReactorID) {
        // a timeout beyond the range of Instant never fires.
        let Some(deadline) = Instant::now().checked_add(self.connect_timeout) else {
            return;
        };
        let data = self.deferred_data.add(CmdData {
            reactorid,
            cmd: SysCommand::ConnectTimeout,
            deadline: Some(deadline),
            completion: Box::new(|_| {}),
        });
        self.deferred_heap.push(Reverse(DeferredKey { deadline, data }));
    }
}

/// Handle one poll event of a stream. return true to close the stream.
fn dispatch_sock_event(
    poller: &Poller,
    cmd_sender: &CmdSender,
    handler: &mut StreamHandler,
    ev: &Event,
) -> bool {
    let StreamHandler { data, reactor } = handler;
    if ev.writable {
        if let Err(err) = data.sender.send_queued(&mut data.sock) {
            debug!(reactorid = %data.reactorid, error = %err, "failed to flush queued bytes");
            return true;
        }
    }
    if ev.readable {
        let (mut ctx, reader) = data.split(cmd_sender);
        if !reader.try_read_fast_read(&mut ctx, &mut **reactor) {
            return true;
        }
    }
    if data.sender.close_or_error() {
        return true;
    }
    if ev.is_err().unwrap_or(false) {
        warn!(reactorid = %data.reactorid, "socket error event");
        return true;
    }
    if let Err(err) = sync_write_interest(poller, data) {
        warn!(reactorid = %data.reactorid, error = %err, "failed to update poll interest");
        return true;
    }
    false
}

/// Register write interest only while there are queued bytes.
fn sync_write_interest(poller: &Poller, data: &mut SockData) -> std::io::Result<()> {
    let want_writable = data.sender.has_pending();
    if want_writable != data.interested_writable {
        let key = data.reactorid.to_usize();
        let interest = if want_writable {
            Event::all(key)
        } else {
            Event::readable(key)
        };
        poller.modify_with_mode(&data.sock, interest, PollMode::Level)?;
        data.interested_writable = want_writable;
    }
    Ok(())
}

// A separate struct so that streams can be mutated while iterating ReactRuntime::sock_events.
struct ReactorMgr {
    streams: FlatStorage<StreamHandler>,
    poller: Poller,
    next_ver: HalfUsize,
    cmd_recv: mpsc::Receiver<CmdData>,
    cmd_sender: CmdSender,
}

struct StreamHandler {
    data: SockData,
    reactor: Box<dyn Reactor>,
}

struct SockData {
    reactorid: ReactorID,
    sock: TcpStream,
    sender: MsgSender,
    reader: MsgReader,
    interested_writable: bool,
    pending_connect: Option<CompletionFn>, // Some until the connect completes.
}

impl SockData {
    fn split<'a>(&'a mut self, cmd_sender: &'a CmdSender) -> (DispatchContext<'a>, &'a mut MsgReader) {
        let SockData {
            reactorid,
            sock,
            sender,
            reader,
            ..
        } = self;
        (
            DispatchContext {
                reactorid: *reactorid,
                sock,
                sender,
                cmd_sender,
            },
            reader,
        )
    }
}

impl ReactorMgr {
    fn new() -> Result<Self> {
        let (cmd_sender, cmd_recv) = mpsc::channel::<CmdData>();
        Ok(Self {
            streams: FlatStorage::new(),
            poller: Poller::new()?,
            next_ver: 0,
            cmd_recv,
            cmd_sender: CmdSender(cmd_sender),
        })
    }

    fn add_stream(
        &mut self,
        recv_buffer_min_size: usize,
        sock: TcpStream,
        reactor: Box<dyn Reactor>,
        pending_connect: CompletionFn,
    ) -> ConnectStart {
        self.next_ver = self.next_ver.wrapping_add(1) % HalfUsize::MAX;
        let reactorid = ReactorID {
            sockslot: self.streams.next_key() as HalfUsize,
            ver: self.next_ver,
        };
        // writable (or error) signals the end of the connect.
        // SAFETY: the socket is deleted from the poller before it is dropped (close_reactor / Drop).
        let added = unsafe {
            self.poller
                .add_with_mode(&sock, Event::all(reactorid.to_usize()), PollMode::Level)
        };
        if let Err(err) = added {
            return Err((err.into(), pending_connect));
        }
        trace!(%reactorid, ?sock, "added stream");
        let key = self.streams.add(StreamHandler {
            data: SockData {
                reactorid,
                sock,
                sender: MsgSender::new(),
                reader: MsgReader::new(recv_buffer_min_size),
                interested_writable: true,
                pending_connect: Some(pending_connect),
            },
            reactor,
        });
        debug_assert_eq!(key, reactorid.slot());
        Ok(reactorid)
    }

    /// Remove the reactor, deregister and close its socket.
    /// * return false if the reactor doesn't exist.
    /// A reactor still connecting is failed instead, without `on_close`.
    fn close_reactor(&mut self, reactorid: ReactorID) -> bool {
        match self.streams.get(reactorid.slot()) {
            Some(handler) if handler.data.reactorid == reactorid => {}
            _ => return false,
        }
        if self.is_connecting(reactorid) {
            let err = io::Error::new(ErrorKind::ConnectionAborted, "closed before connected");
            self.fail_connect(reactorid, err.into());
            return true;
        }
        let Some(StreamHandler { data, mut reactor }) = self.streams.remove(reactorid.slot()) else {
            return false;
        };
        debug!(
            %reactorid,
            pending_send_bytes = data.sender.pending_bytes(),
            "removing reactor"
        );
        if let Err(err) = self.poller.delete(&data.sock) {
            warn!(%reactorid, error = %err, "failed to deregister socket");
        }
        reactor.on_close(reactorid, &self.cmd_sender);
        true
    }

    /// Issue a non-blocking connect and register the socket. The completion is kept until
    /// `finish_connect` or `fail_connect`; it is handed back if the connect can't even start.
    fn start_connect(
        &mut self,
        remote_addr: SocketAddr,
        recv_buffer_min_size: usize,
        reactor: Box<dyn Reactor>,
        completion: CompletionFn,
    ) -> ConnectStart {
        let sock = match connect_nonblocking(remote_addr) {
            Ok(sock) => sock,
            Err(err) => return Err((err.into(), completion)),
        };
        self.add_stream(recv_buffer_min_size, sock, reactor, completion)
    }

    fn is_connecting(&self, reactorid: ReactorID) -> bool {
        matches!(
            self.streams.get(reactorid.slot()),
            Some(handler) if handler.data.reactorid == reactorid && handler.data.pending_connect.is_some()
        )
    }

    /// Called on the first poll event of a connecting socket.
    fn finish_connect(&mut self, reactorid: ReactorID) {
        let Some(StreamHandler { data, reactor }) = self.streams.get_mut(reactorid.slot()) else {
            return;
        };
        let status = match data.sock.take_error() {
            Ok(Some(err)) | Err(err) => Err(err),
            Ok(None) => match data.sock.peer_addr() {
                Ok(_) => Ok(()),
                Err(err) if err.kind() == ErrorKind::NotConnected => return, // not done yet.
                Err(err) => Err(err),
            },
        };
        if let Err(err) = status {
            self.fail_connect(reactorid, err.into());
            return;
        }
        let Some(completion) = data.pending_connect.take() else {
            return;
        };
        let (mut ctx, _) = data.split(&self.cmd_sender);
        let accepted = reactor
            .on_connected(&mut ctx)
            .and_then(|_| sync_write_interest(&self.poller, data).map_err(Error::from));
        match accepted {
            Ok(()) => {
                debug!(%reactorid, peer = ?data.sock.peer_addr().ok(), "connected");
                completion(Ok(reactorid));
            }
            Err(err) => {
                self.close_reactor(reactorid);
                completion(Err(err));
            }
        }
    }

    /// Drop a connecting reactor without `on_close` and report `err` to its completion.
    fn fail_connect(&mut self, reactorid: ReactorID, err: Error) {
        if !self.is_connecting(reactorid) {
            return;
        }
        let Some(StreamHandler { mut data, .. }) = self.streams.remove(reactorid.slot()) else {
            return;
        };
        debug!(%reactorid, error = %err, "failed to connect");
        if let Err(err) = self.poller.delete(&data.sock) {
            warn!(%reactorid, error = %err, "failed to deregister socket");
        }
        if let Some(completion) = data.pending_connect.take() {
            completion(Err(err));
        }
    }
}

/// Create a non-blocking TCP socket and start connecting it.
fn connect_nonblocking(remote_addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = Socket::new(
        Domain::for_address(remote_addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    socket.set_nonblocking(true)?;
    match socket.connect(&SockAddr::from(remote_addr)) {
        Ok(()) => {}
        Err(err) if connect_in_progress(&err) => {}
        Err(err) => return Err(err),
    }
    let sock = TcpStream::from(socket);
    sock.set_nodelay(true)?;
    Ok(sock)
}

fn connect_in_progress(err: &io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    err.kind() == ErrorKind::WouldBlock
}

impl Drop for ReactorMgr {
    fn drop(&mut self) {
        let streams = std::mem::take(&mut self.streams);
        for handler in streams.into_values() {
            trace!(reactorid = %handler.data.reactorid, "dropping open stream");
            let _ = self.poller.delete(&handler.data.sock);
        }
    }
}

//====================================================================================
//            MsgSender
//====================================================================================

/// MsgSender is a per-socket writer. It tries sending on the non-blocking socket; bytes that
/// cannot be written because of WOULDBLOCK are queued and flushed on the next writable event.
#[derive(Debug, Default)]
pub struct MsgSender {
    buf: Vec<u8>,
    bytes_sent: usize,
    shutdown_requested: bool,
    write_closed: bool,
    close_or_error: bool,
}

/// `SendOrQueResult` is the result of `MsgSender::send_or_que`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOrQueResult {
    /// All bytes were written.
    Complete,
    /// Some bytes are queued.
    InQueue,
}

impl MsgSender {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
    pub fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }
    /// total bytes written to the socket.
    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }
    pub fn close_or_error(&self) -> bool {
        self.close_or_error
    }
    pub fn is_writable(&self) -> bool {
        !self.shutdown_requested && !self.close_or_error
    }

    /// Send the bytes or queue what cannot be written now. Queued bytes keep their order.
    pub fn send_or_que(&mut self, sock: &mut TcpStream, buf: &[u8]) -> Result<SendOrQueResult> {
        if !self.is_writable() {
            return Err(Error::SendAfterShutdown);
        }
        if buf.is_empty() {
            return Ok(SendOrQueResult::Complete);
        }
        if !self.buf.is_empty() {
            self.buf.extend_from_slice(buf);
            return Ok(SendOrQueResult::InQueue);
        }
        let mut remaining = buf;
        while !remaining.is_empty() {
            match sock.write(remaining) {
                Ok(0) => {
                    self.close_or_error = true;
                    return Err(Error::PeerClosed);
                }
                Ok(bytes) => {
                    self.bytes_sent += bytes;
                    remaining = &remaining[bytes..];
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    self.buf.extend_from_slice(remaining);
                    return Ok(SendOrQueResult::InQueue);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.close_or_error = true;
                    return Err(err.into());
                }
            }
        }
        Ok(SendOrQueResult::Complete)
    }

    /// Request a write half-close. It happens now if nothing is queued, otherwise after the queue drains.
    pub fn shutdown(&mut self, sock: &mut TcpStream) -> Result<()> {
        self.shutdown_requested = true;
        if self.buf.is_empty() {
            self.finish_shutdown(sock)?;
        }
        Ok(())
    }

    // Called by the runtime on writable events.
    fn send_queued(&mut self, sock: &mut TcpStream) -> Result<SendOrQueResult> {
        while !self.buf.is_empty() {
            match sock.write(&self.buf) {
                Ok(0) => {
                    self.close_or_error = true;
                    return Err(Error::PeerClosed);
                }
                Ok(bytes) => {
                    self.bytes_sent += bytes;
                    self.buf.drain(..bytes);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(SendOrQueResult::InQueue)
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.close_or_error = true;
                    return Err(err.into());
                }
            }
        }
        self.finish_shutdown(sock)?;
        Ok(SendOrQueResult::Complete)
    }

    fn finish_shutdown(&mut self, sock: &mut TcpStream) -> Result<()> {
        if !self.shutdown_requested || self.write_closed {
            return Ok(());
        }
        self.write_closed = true;
        match sock.shutdown(Shutdown::Write) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotConnected => Ok(()), // peer is gone already.
            Err(err) => {
                self.close_or_error = true;
                Err(err.into())
            }
        }
    }
}

//====================================================================================
//            MsgReader
//====================================================================================

/// `MsgReader` is the per-socket inbound buffer. On a readable event it reads until WOULDBLOCK,
/// then passes the buffered bytes to `Reactor::on_inbound_message`, handling partial and multiple messages.
pub struct MsgReader {
    recv_buffer: Vec<u8>,
    min_reserve: usize,     // min free bytes before each read
    startpos: usize,        // first unprocessed byte
    bufsize: usize,         // bytes from recv_buffer[0] to last read byte
    decoded_msgsize: usize, // from MessageResult::ExpectMsgSize
}

impl MsgReader {
    pub fn new(min_reserved_bytes: usize) -> Self {
        let min_reserve = min_reserved_bytes.max(1);
        Self {
            recv_buffer: vec![0u8; min_reserve],
            min_reserve,
            startpos: 0,
            bufsize: 0,
            decoded_msgsize: 0,
        }
    }

    /// Read until WOULDBLOCK.
    /// return false if the peer closed or the socket failed.
    pub fn try_read_all(&mut self, sock: &mut TcpStream) -> bool {
        loop {
            if self.bufsize + self.min_reserve > self.recv_buffer.len() {
                let newlen = (self.bufsize + self.min_reserve).max(self.recv_buffer.len() * 2);
                self.recv_buffer.resize(newlen, 0);
            }
            match sock.read(&mut self.recv_buffer[self.bufsize..]) {
                Ok(0) => {
                    debug!(?sock, "peer closed");
                    return false;
                }
                Ok(new_bytes) => {
                    self.bufsize += new_bytes;
                    if self.bufsize < self.recv_buffer.len() {
                        return true; // not full, the rest comes with the next readable event.
                    }
                }
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => return true,
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                        debug!(?sock, error = %err, "connection reset");
                        return false;
                    }
                    _ => {
                        warn!(?sock, error = %err, "read failed");
                        return false;
                    }
                },
            }
        }
    }

    /// Dispatch all complete messages in the buffer.
    /// return false if the reactor asked to close or failed.
    pub fn try_dispatch_all(
        &mut self,
        new_bytes: usize,
        ctx: &mut DispatchContext<'_>,
        dispatcher: &mut (impl Reactor + ?Sized),
    ) -> bool {
        let mut new_bytes = new_bytes;
        while self.startpos < self.bufsize
            && (self.decoded_msgsize == 0 || self.startpos + self.decoded_msgsize <= self.bufsize)
        {
            let buffered = self.bufsize - self.startpos;
            match dispatcher.on_inbound_message(
                &mut self.recv_buffer[self.startpos..self.bufsize],
                new_bytes,
                self.decoded_msgsize,
                ctx,
            ) {
                Ok(MessageResult::ExpectMsgSize(msgsize)) => {
                    if msgsize != 0 && msgsize <= buffered {
                        warn!(msgsize, buffered, "expecting a message that is already buffered");
                        return false;
                    }
                    self.decoded_msgsize = msgsize;
                    break;
                }
                Ok(MessageResult::DropMsgSize(msgsize)) => {
                    if msgsize == 0 || msgsize > buffered {
                        warn!(msgsize, buffered, "invalid drop size");
                        return false;
                    }
                    self.startpos += msgsize;
                    self.decoded_msgsize = 0;
                    new_bytes = self.bufsize - self.startpos;
                }
                Ok(MessageResult::Close) => {
                    debug!(reactorid = %ctx.reactorid, "reactor requested close");
                    return false;
                }
                Err(err) => {
                    debug!(reactorid = %ctx.reactorid, error = %err, "reactor failed on inbound message");
                    return false;
                }
            }
        }
        if self.startpos != 0 {
            self.recv_buffer.copy_within(self.startpos..self.bufsize, 0);
            self.bufsize -= self.startpos;
            self.startpos = 0;
        }
        true
    }

    /// Read all until WOULDBLOCK, then dispatch. Bytes read before a peer close are still dispatched.
    pub fn try_read_fast_read(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        dispatcher: &mut (impl Reactor + ?Sized),
    ) -> bool {
        let old_bytes = self.bufsize - self.startpos;
        let open = self.try_read_all(ctx.sock);
        let new_bytes = self.bufsize - self.startpos - old_bytes;
        let dispatched = new_bytes == 0 || self.try_dispatch_all(new_bytes, ctx, dispatcher);
        open && dispatched
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::net::TcpListener;
    use std::rc::Rc;
    use std::thread;

    const RECV_BUFFER_MIN_SIZE: usize = 64;

    fn run_until(runtime: &mut ReactRuntime, millis: u64, mut done: impl FnMut(&ReactRuntime) -> bool) {
        let start = Instant::now();
        while !done(runtime) {
            assert!(
                start.elapsed() < Duration::from_millis(millis),
                "timeout waiting for reactors"
            );
            runtime.process_events().unwrap();
        }
    }

    /// Splits inbound bytes into '\n' terminated lines.
    struct LineReactor {
        lines: Rc<RefCell<Vec<String>>>,
        closed: Rc<RefCell<bool>>,
    }
    impl Reactor for LineReactor {
        fn on_inbound_message(
            &mut self,
            buf: &mut [u8],
            _new_bytes: usize,
            _decoded_msg_size: usize,
            _ctx: &mut DispatchContext<'_>,
        ) -> Result<MessageResult> {
            match buf.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    let line = String::from_utf8_lossy(&buf[..pos]).into_owned();
                    self.lines.borrow_mut().push(line);
                    Ok(MessageResult::DropMsgSize(pos + 1))
                }
                None => Ok(MessageResult::ExpectMsgSize(0)),
            }
        }
        fn on_close(&mut self, _reactorid: ReactorID, _cmd_sender: &CmdSender) {
            *self.closed.borrow_mut() = true;
        }
    }

    #[test]
    pub fn test_partial_messages_are_reassembled() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"hello\nwor").unwrap();
            thread::sleep(Duration::from_millis(50));
            sock.write_all(b"ld\n").unwrap();
        });

        let lines = Rc::new(RefCell::new(Vec::new()));
        let closed = Rc::new(RefCell::new(false));
        let mut runtime = ReactRuntime::new().unwrap();
        runtime
            .get_cmd_sender()
            .send_connect(
                addr,
                RECV_BUFFER_MIN_SIZE,
                LineReactor {
                    lines: Rc::clone(&lines),
                    closed: Rc::clone(&closed),
                },
                Deferred::Immediate,
                |res| assert!(res.is_ok()),
            )
            .unwrap();
        let closed_flag = Rc::clone(&closed);
        run_until(&mut runtime, 2000, move |_| *closed_flag.borrow());
        server.join().unwrap();

        assert_eq!(*lines.borrow(), vec!["hello".to_owned(), "world".to_owned()]);
        assert_eq!(runtime.count_reactors(), 0);
    }

    #[test]
    pub fn test_connect_refused_reports_error() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        }; // listener dropped, nothing accepts on addr.
        let result = Rc::new(RefCell::new(None));
        let mut runtime = ReactRuntime::new().unwrap();
        let res = Rc::clone(&result);
        runtime
            .get_cmd_sender()
            .send_connect(
                addr,
                RECV_BUFFER_MIN_SIZE,
                LineReactor {
                    lines: Rc::new(RefCell::new(Vec::new())),
                    closed: Rc::new(RefCell::new(false)),
                },
                Deferred::Immediate,
                move |completion| *res.borrow_mut() = Some(completion.is_err()),
            )
            .unwrap();
        let res = Rc::clone(&result);
        run_until(&mut runtime, 5000, move |_| res.borrow().is_some());
        assert_eq!(*result.borrow(), Some(true));
        assert_eq!(runtime.count_reactors(), 0);
    }

    /// A listener that never accepts, its accept queue filled so that further connects stall.
    fn stalled_listener() -> (SocketAddr, Socket, Vec<TcpStream>) {
        let listener = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        listener
            .bind(&SockAddr::from("127.0.0.1:0".parse::<SocketAddr>().unwrap()))
            .unwrap();
        listener.listen(1).unwrap();
        let addr = listener.local_addr().unwrap().as_socket().unwrap();
        let mut held = Vec::new();
        for _ in 0..256 {
            match TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
                Ok(sock) => held.push(sock),
                Err(_) => break,
            }
        }
        (addr, listener, held)
    }

    #[test]
    pub fn test_connect_times_out() {
        let (addr, _listener, _held) = stalled_listener();
        let result = Rc::new(RefCell::new(None));
        let mut runtime = ReactRuntime::new().unwrap();
        runtime.set_connect_timeout(Duration::from_millis(100));
        let res = Rc::clone(&result);
        let start = Instant::now();
        runtime
            .get_cmd_sender()
            .send_connect(
                addr,
                RECV_BUFFER_MIN_SIZE,
                LineReactor {
                    lines: Rc::new(RefCell::new(Vec::new())),
                    closed: Rc::new(RefCell::new(false)),
                },
                Deferred::Immediate,
                move |completion| {
                    *res.borrow_mut() = Some(matches!(
                        completion,
                        Err(Error::Io(err)) if err.kind() == ErrorKind::TimedOut
                    ))
                },
            )
            .unwrap();
        let res = Rc::clone(&result);
        run_until(&mut runtime, 2000, move |_| res.borrow().is_some());
        assert_eq!(*result.borrow(), Some(true));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(runtime.count_reactors(), 0);
    }

    #[test]
    pub fn test_stalled_connect_does_not_block_other_reactors() {
        let (stalled_addr, _listener, _held) = stalled_listener();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"hello\n").unwrap();
        });

        let stalled_result = Rc::new(RefCell::new(None));
        let lines = Rc::new(RefCell::new(Vec::new()));
        let closed = Rc::new(RefCell::new(false));
        let mut runtime = ReactRuntime::new().unwrap();
        let cmd_sender = runtime.get_cmd_sender().clone();
        let res = Rc::clone(&stalled_result);
        cmd_sender
            .send_connect(
                stalled_addr,
                RECV_BUFFER_MIN_SIZE,
                LineReactor {
                    lines: Rc::new(RefCell::new(Vec::new())),
                    closed: Rc::new(RefCell::new(false)),
                },
                Deferred::Immediate,
                move |completion| *res.borrow_mut() = Some(completion.is_ok()),
            )
            .unwrap();
        cmd_sender
            .send_connect(
                addr,
                RECV_BUFFER_MIN_SIZE,
                LineReactor {
                    lines: Rc::clone(&lines),
                    closed: Rc::clone(&closed),
                },
                Deferred::Immediate,
                |res| assert!(res.is_ok()),
            )
            .unwrap();
        let closed_flag = Rc::clone(&closed);
        run_until(&mut runtime, 1000, move |_| *closed_flag.borrow());
        server.join().unwrap();

        assert_eq!(*lines.borrow(), vec!["hello".to_owned()]);
        assert_eq!(*stalled_result.borrow(), None); // still connecting.
        assert_eq!(runtime.count_reactors(), 1);
    }

    #[test]
    pub fn test_deferred_quit_stops_run() {
        let mut runtime = ReactRuntime::new().unwrap();
        let start = Instant::now();
        runtime
            .get_cmd_sender()
            .send_quit(Deferred::After(Duration::from_millis(50)))
            .unwrap();
        runtime.run().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(runtime.count_deferred_queue(), 0);
    }

    #[test]
    pub fn test_run_without_work_returns() {
        let mut runtime = ReactRuntime::new().unwrap();
        runtime.run().unwrap();
        assert_eq!(runtime.count_reactors(), 0);
    }

    #[test]
    pub fn test_close_unknown_reactor() {
        let mut runtime = ReactRuntime::new().unwrap();
        let result = Rc::new(RefCell::new(None));
        let res = Rc::clone(&result);
        let unknown = ReactorID { sockslot: 3, ver: 7 };
        runtime
            .get_cmd_sender()
            .send_close(unknown, Deferred::Immediate, move |completion| {
                *res.borrow_mut() = Some(completion.is_err())
            })
            .unwrap();
        runtime.process_events().unwrap();
        assert_eq!(*result.borrow(), Some(true));
        assert!(runtime
            .get_cmd_sender()
            .send_close(INVALID_REACTOR_ID, Deferred::Immediate, |_| {})
            .is_err());
    }

    /// Sends one message and half-closes right away.
    struct PingOnce {
        connected_after_shutdown: Rc<RefCell<Option<bool>>>,
        send_after_shutdown_failed: Rc<RefCell<bool>>,
    }
    impl Reactor for PingOnce {
        fn on_connected(&mut self, ctx: &mut DispatchContext<'_>) -> Result<()> {
            assert!(ctx.connected());
            assert!(ctx.peer_addr().is_some());
            ctx.send_or_que(b"ping")?;
            ctx.shutdown()?;
            *self.connected_after_shutdown.borrow_mut() = Some(ctx.connected());
            *self.send_after_shutdown_failed.borrow_mut() = ctx.send_or_que(b"late").is_err();
            Ok(())
        }
        fn on_inbound_message(
            &mut self,
            buf: &mut [u8],
            _new_bytes: usize,
            _decoded_msg_size: usize,
            _ctx: &mut DispatchContext<'_>,
        ) -> Result<MessageResult> {
            Ok(MessageResult::DropMsgSize(buf.len()))
        }
    }

    #[test]
    pub fn test_graceful_shutdown_flushes_then_half_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            sock.read_to_end(&mut received).unwrap(); // returns on the client's half-close.
            received
        });

        let connected_after_shutdown = Rc::new(RefCell::new(None));
        let send_after_shutdown_failed = Rc::new(RefCell::new(false));
        let mut runtime = ReactRuntime::new().unwrap();
        runtime
            .get_cmd_sender()
            .send_connect(
                addr,
                RECV_BUFFER_MIN_SIZE,
                PingOnce {
                    connected_after_shutdown: Rc::clone(&connected_after_shutdown),
                    send_after_shutdown_failed: Rc::clone(&send_after_shutdown_failed),
                },
                Deferred::Immediate,
                |res| assert!(res.is_ok()),
            )
            .unwrap();
        // the server drops its socket after read_to_end, which closes our reactor.
        run_until(&mut runtime, 2000, |rt| {
            rt.count_received_commands() > 0 && rt.count_reactors() == 0
        });
        assert_eq!(server.join().unwrap(), b"ping".to_vec());
        assert_eq!(*connected_after_shutdown.borrow(), Some(false));
        assert!(*send_after_shutdown_failed.borrow());
    }

    #[test]
    pub fn test_reactor_id_key_roundtrip() {
        let id = ReactorID { sockslot: 12, ver: 5 };
        assert_eq!(ReactorID::from_usize(id.to_usize()), id);
        assert_eq!(id.to_string(), "12:5");
    }
}
