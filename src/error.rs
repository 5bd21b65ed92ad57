//! Error types for echo-stress.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Failed to resolve target address: {target}")]
    Resolve { target: String },

    #[error("Load generator has already been started")]
    AlreadyStarted,

    #[error("Load generator has not been started")]
    NotStarted,

    #[error("Send on a connection that is shutting down")]
    SendAfterShutdown,

    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Reactor {reactorid} does not exist")]
    UnknownReactor { reactorid: String },

    #[error("Command receiver disconnected")]
    CommandChannelClosed,

    #[error("Failed to initialize logging: {message}")]
    Logging { message: String },

    #[error("Reactor thread failed: {message}")]
    ReactorThread { message: String },
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn resolve(target: impl Into<String>) -> Self {
        Self::Resolve {
            target: target.into(),
        }
    }

    pub fn reactor_thread(message: impl Into<String>) -> Self {
        Self::ReactorThread {
            message: message.into(),
        }
    }
}
