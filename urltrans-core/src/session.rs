//! Host-driven transfer session. The host forwards watcher events and buffer
//! notifications; the session drives the transfer library and answers its
//! callbacks. Nothing here blocks or spawns.

use std::collections::TryReserveError;
use std::time::Duration;

use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::collaborator::SessionHost;
use crate::config::{ConfigError, SessionConfig};
use crate::diagnostics::HandshakeDetector;
use crate::library::{
    DebugKind, LibraryCallbacks, LibraryGuard, SocketInterest, TransferLibrary, TransferRequest, WriteOutcome,
};
use crate::ring::ByteRing;
use crate::watcher::{
    IoDirection, IoWatch, Readiness, SocketFd, TimerToken, TimerWatch, WatcherError, WatcherStatus,
};

/// Upper bound on consecutive drive calls while the library keeps asking to be called again.
pub const MAX_PUMP_ROUNDS: usize = 10_000;

/// Library timeouts shorter than this are rounded up.
pub const MIN_LIBRARY_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Stopped,
    /// Connecting or receiving.
    Transferring,
    Paused,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("cannot allocate {bytes}-byte ring buffer")]
    Allocation {
        bytes: usize,
        #[source]
        source: TryReserveError,
    },
    #[error("transfer library: {0}")]
    Library(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Watcher(#[from] WatcherError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SessionError {
    pub(crate) fn library<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
        SessionError::Library(Box::new(e))
    }
}

/// Mutable engine state, split from the library so library callbacks can borrow it.
pub(crate) struct Engine<H: SessionHost> {
    pub(crate) id: Uuid,
    pub(crate) uri: String,
    pub(crate) user_agent: String,
    pub(crate) connect_timeout: Duration,
    pub(crate) reconnect_interval: Duration,
    pub(crate) state: TransferState,
    pub(crate) ring: ByteRing,
    pub(crate) internal_buffer_size: usize,
    /// Watermark base. Collapses to 0 on first crossing; restored on connection loss.
    pub(crate) internal_buffer_size_initial: usize,
    pub(crate) io: IoWatch<H::Io>,
    pub(crate) transfer_timer: TimerWatch<H::Timer>,
    pub(crate) reconnect_timer: TimerWatch<H::Timer>,
    pub(crate) library_timeout: Option<Duration>,
    pub(crate) handshake: HandshakeDetector,
    /// First watcher failure raised inside a library callback.
    deferred: Option<WatcherError>,
}

impl<H: SessionHost> Engine<H> {
    pub(crate) fn defer(&mut self, result: Result<(), WatcherError>) {
        if let Err(e) = result {
            warn!(session = %self.id, error = %e, "watcher failure inside library callback");
            self.deferred.get_or_insert(e);
        }
    }

    fn take_deferred(&mut self) -> Result<(), WatcherError> {
        match self.deferred.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn on_socket(&mut self, host: &mut H, socket: SocketFd, interest: SocketInterest) {
        debug!(session = %self.id, %socket, ?interest, "socket interest");
        let result = match interest {
            SocketInterest::In => self.io.start(host, socket, IoDirection::Read),
            SocketInterest::Out => self.io.start(host, socket, IoDirection::Write),
            SocketInterest::InOut => self.io.start(host, socket, IoDirection::ReadOrWrite),
            SocketInterest::None => self.io.stop(host),
            SocketInterest::Remove => {
                self.io.destroy(host);
                self.transfer_timer.stop(host)
            }
        };
        self.defer(result);
    }

    fn on_library_timer(&mut self, host: &mut H, timeout: Option<Duration>) {
        debug!(session = %self.id, ?timeout, "library timer");
        let mut result = self.transfer_timer.stop(host);
        self.library_timeout = match timeout {
            None => None,
            Some(d) if d.is_zero() => Some(Duration::ZERO),
            Some(d) => {
                let d = d.max(MIN_LIBRARY_TIMEOUT);
                if result.is_ok() {
                    result = self.transfer_timer.start(host, d, None);
                }
                Some(d)
            }
        };
        self.defer(result);
    }

    /// Soft cap, never above what the ring can hold.
    pub(crate) fn soft_cap(&self) -> usize {
        self.internal_buffer_size.min(self.ring.capacity())
    }

    fn is_stalled(&self) -> bool {
        self.state == TransferState::Transferring
            && !self.io.is_armed()
            && !self.transfer_timer.is_armed()
            && !self.reconnect_timer.is_armed()
    }
}

/// Adapter handed to the library for the duration of one drive call.
struct Dispatch<'a, H: SessionHost> {
    engine: &'a mut Engine<H>,
    host: &'a mut H,
}

impl<H: SessionHost> LibraryCallbacks for Dispatch<'_, H> {
    fn on_header(&mut self, line: &[u8]) {
        self.engine.on_header_line(self.host, line);
    }

    fn on_write(&mut self, chunk: &[u8]) -> WriteOutcome {
        self.engine.on_data_arrived(self.host, chunk)
    }

    fn on_socket(&mut self, socket: SocketFd, interest: SocketInterest) {
        self.engine.on_socket(self.host, socket, interest);
    }

    fn on_timer(&mut self, timeout: Option<Duration>) {
        self.engine.on_library_timer(self.host, timeout);
    }

    fn on_debug(&mut self, kind: DebugKind, text: &[u8]) {
        self.engine.handshake.inspect(kind, text);
    }
}

#[derive(Clone, Copy)]
enum Pump {
    Timeout,
    Socket(SocketFd, Readiness),
}

/// One streaming transfer bound to one host component.
pub struct TransferSession<L: TransferLibrary + 'static, H: SessionHost> {
    pub(crate) library: L,
    pub(crate) engine: Engine<H>,
    _global: LibraryGuard,
}

impl<L: TransferLibrary + 'static, H: SessionHost> TransferSession<L, H> {
    pub fn new(library: L, host: &mut H, uri: &str, config: SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let ring = ByteRing::try_with_capacity(config.store_bytes).map_err(|source| SessionError::Allocation {
            bytes: config.store_bytes,
            source,
        })?;
        let global = LibraryGuard::acquire::<L>().map_err(SessionError::library)?;
        let mut transfer_timer = TimerWatch::init(host, TimerToken::TransferTimeout)?;
        let reconnect_timer = match TimerWatch::init(host, TimerToken::Reconnect) {
            Ok(t) => t,
            Err(e) => {
                transfer_timer.destroy(host);
                return Err(e.into());
            }
        };
        let internal = config.internal_buffer_size();
        let engine = Engine {
            id: Uuid::new_v4(),
            uri: uri.to_string(),
            user_agent: config.user_agent.clone(),
            connect_timeout: config.connect_timeout(),
            reconnect_interval: config.reconnect_interval(),
            state: TransferState::Stopped,
            ring,
            internal_buffer_size: internal,
            internal_buffer_size_initial: internal,
            io: IoWatch::new(),
            transfer_timer,
            reconnect_timer,
            library_timeout: None,
            handshake: HandshakeDetector::new(&config.handshake_error_pattern),
            deferred: None,
        };
        debug!(session = %engine.id, uri, store_bytes = config.store_bytes, internal, "session created");
        Ok(Self {
            library,
            engine,
            _global: global,
        })
    }

    /// Begin a fresh transfer. Legal from Stopped or Paused; ignored otherwise.
    pub fn start(&mut self, host: &mut H) -> Result<(), SessionError> {
        self.trace_op("start");
        if self.engine.state == TransferState::Transferring {
            debug!(session = %self.engine.id, "start ignored: already transferring");
            return Ok(());
        }
        // begin drops the old handle and its socket; the fd number may come back
        self.engine.io.destroy(host);
        self.begin_transfer()?;
        self.engine.handshake.reset();
        let running = self.kickstart(host)?;
        if running == 0 {
            self.engine.connection_lost(host)?;
        }
        self.check_stall();
        Ok(())
    }

    /// Disarm every watcher. State is left as is.
    pub fn pause(&mut self, host: &mut H) -> Result<(), SessionError> {
        self.trace_op("pause");
        self.engine.io.stop(host)?;
        self.engine.transfer_timer.stop(host)?;
        self.engine.reconnect_timer.stop(host)?;
        Ok(())
    }

    pub fn unpause(&mut self, host: &mut H) -> Result<(), SessionError> {
        self.trace_op("unpause");
        if self.engine.library_timeout.is_some_and(|d| !d.is_zero()) {
            self.engine.transfer_timer.restart(host)?;
        }
        self.engine.io.restart(host)?;
        let running = self.kickstart(host)?;
        if running == 0 {
            self.engine.connection_lost(host)?;
        }
        self.check_stall();
        Ok(())
    }

    /// Hard stop: drop the transfer handle and every watcher. The ring is kept.
    pub fn cancel(&mut self, host: &mut H) -> Result<(), SessionError> {
        self.trace_op("cancel");
        self.pause(host)?;
        self.engine.state = TransferState::Stopped;
        self.library.detach();
        self.engine.io.destroy(host);
        self.engine.library_timeout = None;
        Ok(())
    }

    /// Discard buffered bytes.
    pub fn flush_buffer(&mut self) {
        self.trace_op("flush_buffer");
        self.engine.ring.clear();
    }

    /// The consumer has returned buffers.
    pub fn on_buffers_ready(&mut self, host: &mut H) -> Result<(), SessionError> {
        self.trace_op("on_buffers_ready");
        self.engine.drain(host);
        if self.engine.state == TransferState::Paused && self.engine.ring.available() < self.engine.soft_cap() {
            self.resume(host)?;
        }
        Ok(())
    }

    pub fn on_io_ready(&mut self, host: &mut H, socket: SocketFd, readiness: Readiness) -> Result<(), SessionError> {
        self.trace_op("on_io_ready");
        if self.engine.io.socket() != Some(socket) {
            warn!(session = %self.engine.id, %socket, tracked = ?self.engine.io.socket(), "stale socket event ignored");
            return Ok(());
        }
        let running = self.pump(host, Pump::Socket(socket, readiness))?;
        if running == 0 {
            self.engine.connection_lost(host)?;
        } else if self.engine.state == TransferState::Transferring {
            self.engine.io.restart(host)?;
            self.engine.drain(host);
        }
        self.check_stall();
        Ok(())
    }

    pub fn on_timer_ready(&mut self, host: &mut H, token: TimerToken) -> Result<(), SessionError> {
        self.trace_op("on_timer_ready");
        match token {
            TimerToken::TransferTimeout => {
                if !self.engine.transfer_timer.is_armed() {
                    debug!(session = %self.engine.id, "stale transfer timer ignored");
                    return Ok(());
                }
                self.engine.transfer_timer.expired();
                if self.engine.state == TransferState::Transferring {
                    let running = self.kickstart(host)?;
                    if running == 0 {
                        self.engine.connection_lost(host)?;
                    } else if self.engine.state == TransferState::Transferring {
                        self.engine.drain(host);
                    }
                }
            }
            TimerToken::Reconnect => {
                if !self.engine.reconnect_timer.is_armed() {
                    debug!(session = %self.engine.id, "stale reconnect timer ignored");
                    return Ok(());
                }
                self.on_reconnect_timer(host)?;
            }
        }
        self.check_stall();
        Ok(())
    }

    pub fn bytes_available(&self) -> usize {
        self.engine.ring.available()
    }

    pub fn handshake_error_found(&self) -> bool {
        self.engine.handshake.found()
    }

    pub fn state(&self) -> TransferState {
        self.engine.state
    }

    pub fn id(&self) -> Uuid {
        self.engine.id
    }

    pub fn uri(&self) -> &str {
        &self.engine.uri
    }

    /// Current watermark base; 0 once the buffer has caught up with the stream.
    pub fn initial_buffer_size(&self) -> usize {
        self.engine.internal_buffer_size_initial
    }

    pub fn internal_buffer_size(&self) -> usize {
        self.engine.internal_buffer_size
    }

    pub fn watchers(&self) -> WatcherStatus {
        WatcherStatus {
            socket: self.engine.io.socket(),
            io_armed: self.engine.io.is_armed(),
            transfer_timer_armed: self.engine.transfer_timer.is_armed(),
            reconnect_timer_armed: self.engine.reconnect_timer.is_armed(),
        }
    }

    pub fn library(&self) -> &L {
        &self.library
    }

    /// Replace the URI. The current transfer handle is dropped and the session stops.
    pub fn set_uri(&mut self, host: &mut H, uri: &str) -> Result<(), SessionError> {
        self.pause(host)?;
        self.library.detach();
        self.engine.io.destroy(host);
        self.engine.uri = uri.to_string();
        self.engine.state = TransferState::Stopped;
        Ok(())
    }

    /// Applies from the next `start()`.
    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.engine.connect_timeout = timeout;
    }

    /// Set both the soft cap and the watermark base.
    pub fn set_internal_buffer_size(&mut self, bytes: usize) -> Result<(), ConfigError> {
        if bytes == 0 {
            return Err(ConfigError::ZeroInternalBuffer);
        }
        self.engine.internal_buffer_size = bytes;
        self.engine.internal_buffer_size_initial = bytes;
        Ok(())
    }

    /// Tear down watchers and the transfer handle, releasing the library's
    /// process-wide state if this was the last session.
    pub fn destroy(mut self, host: &mut H) {
        self.trace_op("destroy");
        self.library.detach();
        self.engine.io.destroy(host);
        self.engine.transfer_timer.destroy(host);
        self.engine.reconnect_timer.destroy(host);
    }

    /// Ask the library for a new handle. On failure the handle is dropped and state is unchanged.
    pub(crate) fn begin_transfer(&mut self) -> Result<(), SessionError> {
        let request = TransferRequest::streaming(&self.engine.uri, &self.engine.user_agent, self.engine.connect_timeout);
        if let Err(e) = self.library.begin(&request) {
            self.library.detach();
            return Err(SessionError::library(e));
        }
        self.engine.library_timeout = Some(Duration::ZERO);
        self.engine.state = TransferState::Transferring;
        Ok(())
    }

    pub(crate) fn kickstart(&mut self, host: &mut H) -> Result<usize, SessionError> {
        self.pump(host, Pump::Timeout)
    }

    fn resume(&mut self, host: &mut H) -> Result<(), SessionError> {
        debug!(session = %self.engine.id, available = self.engine.ring.available(), "resuming transfer");
        self.engine.state = TransferState::Transferring;
        {
            let mut cb = Dispatch {
                engine: &mut self.engine,
                host: &mut *host,
            };
            self.library.resume(&mut cb).map_err(SessionError::library)?;
        }
        self.engine.take_deferred()?;
        let running = self.kickstart(host)?;
        if running == 0 {
            self.engine.connection_lost(host)?;
        }
        Ok(())
    }

    /// Drive the library until it stops asking to be called again, at most
    /// `MAX_PUMP_ROUNDS` times. Returns the running handle count.
    fn pump(&mut self, host: &mut H, target: Pump) -> Result<usize, SessionError> {
        let mut rounds = MAX_PUMP_ROUNDS;
        let running = loop {
            let mut cb = Dispatch {
                engine: &mut self.engine,
                host: &mut *host,
            };
            let running = match target {
                Pump::Timeout => self.library.drive_timeout(&mut cb),
                Pump::Socket(socket, readiness) => self.library.drive_socket(socket, readiness, &mut cb),
            }
            .map_err(SessionError::library)?;
            self.engine.take_deferred()?;
            rounds -= 1;
            if self.engine.library_timeout != Some(Duration::ZERO) || rounds == 0 {
                break running;
            }
        };
        if rounds == 0 {
            let next = self.library.next_timeout().map_err(SessionError::library)?;
            warn!(session = %self.engine.id, ?next, "library kept asking to be driven; falling back to its timeout");
            self.engine.on_library_timer(host, next.map(|d| d.max(MIN_LIBRARY_TIMEOUT)));
            self.engine.take_deferred()?;
        }
        Ok(running)
    }

    fn check_stall(&self) {
        if self.engine.is_stalled() {
            warn!(session = %self.engine.id, "transferring with no watcher armed");
        }
    }

    fn trace_op(&self, op: &'static str) {
        let e = &self.engine;
        trace!(
            session = %e.id,
            op,
            state = ?e.state,
            socket = ?e.io.socket(),
            available = e.ring.available(),
            timeout = ?e.library_timeout,
            io = e.io.is_armed(),
            transfer_timer = e.transfer_timer.is_armed(),
            reconnect_timer = e.reconnect_timer.is_armed(),
            "session op"
        );
    }
}
