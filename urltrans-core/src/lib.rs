//! Streaming HTTP transfer engine.
//! Host-driven: no I/O; host forwards watcher events and buffer notifications,
//! the engine drives the transfer library and calls back into the host.

pub mod collaborator;
pub mod config;
pub mod diagnostics;
pub mod library;
pub mod ring;
pub mod session;
pub mod watcher;

mod flow;
mod reconnect;

#[cfg(test)]
mod mock;

pub use collaborator::{BufferCallbacks, InfoCallbacks, OutputBuffer, SessionHost};
pub use config::{ConfigError, SessionConfig};
pub use diagnostics::{HandshakeDetector, DEFAULT_HANDSHAKE_ERROR_PATTERN};
pub use library::{
    DebugKind, LibraryCallbacks, LibraryGuard, SocketInterest, TransferLibrary, TransferRequest, WriteOutcome,
};
pub use ring::ByteRing;
pub use session::{SessionError, TransferSession, TransferState, MAX_PUMP_ROUNDS, MIN_LIBRARY_TIMEOUT};
pub use watcher::{
    IoDirection, IoWatcherFactory, Readiness, SocketFd, TimerToken, TimerWatcherFactory, WatcherError, WatcherStatus,
};
