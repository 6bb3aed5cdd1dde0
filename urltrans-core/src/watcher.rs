//! Event watcher seams. The host owns the event loop; the engine only asks it
//! to create, arm and disarm socket and timer watchers, and is told when they fire.

use std::time::Duration;

/// Socket descriptor as reported by the transfer library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketFd(pub i32);

impl SocketFd {
    pub fn raw(self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for SocketFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// Direction an I/O watcher waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoDirection {
    #[default]
    Read,
    Write,
    ReadOrWrite,
}

/// Readiness reported by the host when an I/O watcher fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
    };
}

/// Identifies which engine timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerToken {
    /// Timeout requested by the transfer library.
    TransferTimeout,
    /// Periodic reconnection attempt after a connection loss.
    Reconnect,
}

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("cannot create watcher: {0}")]
    Init(String),
    #[error("cannot arm watcher: {0}")]
    Arm(String),
    #[error("cannot disarm watcher: {0}")]
    Disarm(String),
}

/// Host-provided socket readiness watchers.
pub trait IoWatcherFactory {
    type Io;

    fn io_init(&mut self, socket: SocketFd, direction: IoDirection) -> Result<Self::Io, WatcherError>;
    /// Arm the watcher. Arming an armed watcher must be a no-op.
    fn io_start(&mut self, io: &mut Self::Io) -> Result<(), WatcherError>;
    fn io_stop(&mut self, io: &mut Self::Io) -> Result<(), WatcherError>;
    fn io_destroy(&mut self, io: Self::Io);
}

/// Host-provided timers. `repeat: None` is one-shot.
pub trait TimerWatcherFactory {
    type Timer;

    fn timer_init(&mut self, token: TimerToken) -> Result<Self::Timer, WatcherError>;
    fn timer_start(
        &mut self,
        timer: &mut Self::Timer,
        delay: Duration,
        repeat: Option<Duration>,
    ) -> Result<(), WatcherError>;
    /// Re-arm with the delay and repeat last given to `timer_start`.
    fn timer_restart(&mut self, timer: &mut Self::Timer) -> Result<(), WatcherError>;
    fn timer_stop(&mut self, timer: &mut Self::Timer) -> Result<(), WatcherError>;
    fn timer_destroy(&mut self, timer: Self::Timer);
}

/// Snapshot of which watchers are armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherStatus {
    pub socket: Option<SocketFd>,
    pub io_armed: bool,
    pub transfer_timer_armed: bool,
    pub reconnect_timer_armed: bool,
}

/// The session's single I/O watcher. Bound to one (socket, direction) pair;
/// a different pair destroys it and creates a fresh one.
pub(crate) struct IoWatch<W> {
    handle: Option<W>,
    socket: Option<SocketFd>,
    direction: IoDirection,
    armed: bool,
}

impl<W> IoWatch<W> {
    pub(crate) fn new() -> Self {
        Self {
            handle: None,
            socket: None,
            direction: IoDirection::default(),
            armed: false,
        }
    }

    pub(crate) fn socket(&self) -> Option<SocketFd> {
        self.socket
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed
    }

    pub(crate) fn start<F>(
        &mut self,
        host: &mut F,
        socket: SocketFd,
        direction: IoDirection,
    ) -> Result<(), WatcherError>
    where
        F: IoWatcherFactory<Io = W>,
    {
        if self.handle.is_some() && (self.socket != Some(socket) || self.direction != direction) {
            self.destroy(host);
        }
        self.socket = Some(socket);
        self.direction = direction;
        self.restart(host)
    }

    /// Arm the watcher for the tracked socket, creating it if needed.
    pub(crate) fn restart<F>(&mut self, host: &mut F) -> Result<(), WatcherError>
    where
        F: IoWatcherFactory<Io = W>,
    {
        let Some(socket) = self.socket else {
            return Ok(());
        };
        if self.handle.is_none() {
            self.handle = Some(host.io_init(socket, self.direction)?);
        }
        if let Some(io) = self.handle.as_mut() {
            host.io_start(io)?;
            self.armed = true;
        }
        Ok(())
    }

    pub(crate) fn stop<F>(&mut self, host: &mut F) -> Result<(), WatcherError>
    where
        F: IoWatcherFactory<Io = W>,
    {
        if let (true, Some(io)) = (self.armed, self.handle.as_mut()) {
            host.io_stop(io)?;
        }
        self.armed = false;
        Ok(())
    }

    /// Stop and release the watcher and forget the socket.
    pub(crate) fn destroy<F>(&mut self, host: &mut F)
    where
        F: IoWatcherFactory<Io = W>,
    {
        if let Some(mut io) = self.handle.take() {
            if self.armed {
                if let Err(e) = host.io_stop(&mut io) {
                    tracing::warn!(error = %e, "io watcher stop failed during teardown");
                }
            }
            host.io_destroy(io);
        }
        self.armed = false;
        self.socket = None;
    }
}

/// One engine timer plus its armed flag.
pub(crate) struct TimerWatch<T> {
    handle: Option<T>,
    token: TimerToken,
    armed: bool,
}

impl<T> TimerWatch<T> {
    pub(crate) fn init<F>(host: &mut F, token: TimerToken) -> Result<Self, WatcherError>
    where
        F: TimerWatcherFactory<Timer = T>,
    {
        Ok(Self {
            handle: Some(host.timer_init(token)?),
            token,
            armed: false,
        })
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed
    }

    /// Arm unless already armed.
    pub(crate) fn start<F>(
        &mut self,
        host: &mut F,
        delay: Duration,
        repeat: Option<Duration>,
    ) -> Result<(), WatcherError>
    where
        F: TimerWatcherFactory<Timer = T>,
    {
        if self.armed {
            return Ok(());
        }
        if let Some(t) = self.handle.as_mut() {
            host.timer_start(t, delay, repeat)?;
            self.armed = true;
        }
        Ok(())
    }

    pub(crate) fn restart<F>(&mut self, host: &mut F) -> Result<(), WatcherError>
    where
        F: TimerWatcherFactory<Timer = T>,
    {
        if let Some(t) = self.handle.as_mut() {
            host.timer_restart(t)?;
            self.armed = true;
        }
        Ok(())
    }

    pub(crate) fn stop<F>(&mut self, host: &mut F) -> Result<(), WatcherError>
    where
        F: TimerWatcherFactory<Timer = T>,
    {
        if !self.armed {
            return Ok(());
        }
        if let Some(t) = self.handle.as_mut() {
            host.timer_stop(t)?;
        }
        self.armed = false;
        Ok(())
    }

    /// A one-shot timer that fired is no longer armed.
    pub(crate) fn expired(&mut self) {
        self.armed = false;
    }

    pub(crate) fn destroy<F>(&mut self, host: &mut F)
    where
        F: TimerWatcherFactory<Timer = T>,
    {
        if let Some(mut t) = self.handle.take() {
            if self.armed {
                if let Err(e) = host.timer_stop(&mut t) {
                    tracing::warn!(token = ?self.token, error = %e, "timer stop failed during teardown");
                }
            }
            host.timer_destroy(t);
        }
        self.armed = false;
    }
}
