//! In-process servers on ephemeral loopback ports.
#![allow(dead_code)]

use socket2::{Domain, Socket, Type};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

/// How a test server treats each accepted connection.
#[derive(Clone, Copy)]
pub enum ServerMode {
    /// Echo everything until the client closes.
    Echo,
    /// Echo the first read, then close.
    CloseAfterFirst,
    /// Accept, read and never answer.
    Silent,
}

/// Spawn a detached server thread; it lives until the test process exits.
pub fn spawn_server(mode: ServerMode) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for sock in listener.incoming() {
            let Ok(sock) = sock else { break };
            thread::spawn(move || serve(sock, mode));
        }
    });
    addr
}

fn serve(mut sock: TcpStream, mode: ServerMode) {
    let mut buf = [0u8; 1024];
    loop {
        let n = match sock.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        match mode {
            ServerMode::Echo => {
                if sock.write_all(&buf[..n]).is_err() {
                    return;
                }
            }
            ServerMode::CloseAfterFirst => {
                let _ = sock.write_all(&buf[..n]);
                return;
            }
            ServerMode::Silent => {}
        }
    }
}

/// An address nothing listens on.
pub fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// A listener that never accepts, with its accept queue filled up, so that new connects stall.
/// Keep it alive for as long as the address is used.
pub struct StalledListener {
    pub addr: SocketAddr,
    _listener: Socket,
    _held: Vec<TcpStream>,
}

pub fn stalled_listener() -> StalledListener {
    let listener = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    listener
        .bind(&"127.0.0.1:0".parse::<SocketAddr>().unwrap().into())
        .unwrap();
    listener.listen(1).unwrap();
    let addr = listener.local_addr().unwrap().as_socket().unwrap();
    let mut held = Vec::new();
    for _ in 0..256 {
        match TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
            Ok(sock) => held.push(sock),
            Err(_) => break, // queue full, SYNs are dropped now.
        }
    }
    StalledListener {
        addr,
        _listener: listener,
        _held: held,
    }
}
