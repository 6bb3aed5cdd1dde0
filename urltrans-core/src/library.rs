//! Contract with the non-blocking transfer library. The library owns sockets
//! and protocol state; it calls back into the session synchronously from
//! inside its drive calls.

use std::any::TypeId;
use std::sync::Mutex;
use std::time::Duration;

use crate::watcher::{Readiness, SocketFd};

/// Maximum redirects followed per transfer.
pub const MAX_REDIRECTS: u32 = 5;

/// Status line accepted as success from Shoutcast-style servers.
pub const ICY_OK_ALIAS: &str = "ICY 200 OK";

/// Disables in-band ICY metadata; the engine passes audio through untouched.
pub const ICY_METADATA_OFF: &str = "Icy-MetaData:0";

/// Socket interest as reported by the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketInterest {
    None,
    In,
    Out,
    InOut,
    /// Socket is going away.
    Remove,
}

/// Result of delivering a body chunk to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// All bytes were taken.
    Accepted,
    /// The transfer must pause. Only `consumed` leading bytes were taken;
    /// the library holds the rest and re-delivers it on resume.
    Paused { consumed: usize },
}

/// Kind of verbose diagnostic emitted by the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugKind {
    Text,
    HeaderIn,
    HeaderOut,
    DataIn,
    DataOut,
}

/// Everything needed to begin one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: String,
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub verify_tls: bool,
    pub follow_redirects: bool,
    pub max_redirects: u32,
    /// Treat HTTP status >= 400 as a transfer failure.
    pub fail_on_error: bool,
    /// Non-standard status lines to accept as `200 OK`.
    pub ok_status_aliases: Vec<String>,
    /// Extra request headers, `Name:value`.
    pub headers: Vec<String>,
    pub verbose: bool,
}

impl TransferRequest {
    /// Request shaped for long-running audio streams.
    pub fn streaming(url: &str, user_agent: &str, connect_timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            user_agent: user_agent.to_string(),
            connect_timeout,
            verify_tls: false,
            follow_redirects: true,
            max_redirects: MAX_REDIRECTS,
            fail_on_error: true,
            ok_status_aliases: vec![ICY_OK_ALIAS.to_string()],
            headers: vec![ICY_METADATA_OFF.to_string()],
            verbose: true,
        }
    }
}

/// Callbacks the library invokes while being driven.
pub trait LibraryCallbacks {
    fn on_header(&mut self, line: &[u8]);
    fn on_write(&mut self, chunk: &[u8]) -> WriteOutcome;
    fn on_socket(&mut self, socket: SocketFd, interest: SocketInterest);
    /// `None`: no timer. `Some(ZERO)`: due now.
    fn on_timer(&mut self, timeout: Option<Duration>);
    fn on_debug(&mut self, kind: DebugKind, text: &[u8]);
}

/// Non-blocking multi-socket transfer library.
pub trait TransferLibrary {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Process-wide setup, run when the first session of this library type is created.
    fn global_init() -> Result<(), Self::Error>
    where
        Self: Sized,
    {
        Ok(())
    }

    /// Process-wide teardown, run when the last session is destroyed.
    fn global_cleanup()
    where
        Self: Sized,
    {
    }

    /// Create a fresh handle for `request` and attach it. Any previous handle is dropped.
    fn begin(&mut self, request: &TransferRequest) -> Result<(), Self::Error>;

    /// Drop the current handle without callbacks.
    fn detach(&mut self);

    /// Make progress on `socket`. Returns the number of running transfers.
    fn drive_socket(
        &mut self,
        socket: SocketFd,
        readiness: Readiness,
        callbacks: &mut dyn LibraryCallbacks,
    ) -> Result<usize, Self::Error>;

    /// Make progress on timeouts. Returns the number of running transfers.
    fn drive_timeout(&mut self, callbacks: &mut dyn LibraryCallbacks) -> Result<usize, Self::Error>;

    /// Lift a pause; held bytes may be re-delivered before this returns.
    fn resume(&mut self, callbacks: &mut dyn LibraryCallbacks) -> Result<(), Self::Error>;

    /// Timeout the library currently wants, if any.
    fn next_timeout(&mut self) -> Result<Option<Duration>, Self::Error>;
}

static GLOBAL_USERS: Mutex<Vec<(TypeId, usize)>> = Mutex::new(Vec::new());

/// Holds one reference to a library type's process-wide state.
/// Cleanup runs when the last guard for that type drops.
pub struct LibraryGuard {
    type_id: TypeId,
    cleanup: fn(),
}

impl LibraryGuard {
    pub fn acquire<L: TransferLibrary + 'static>() -> Result<Self, L::Error> {
        let type_id = TypeId::of::<L>();
        let mut users = GLOBAL_USERS.lock().unwrap_or_else(|e| e.into_inner());
        match users.iter_mut().find(|(id, _)| *id == type_id) {
            Some((_, count)) => *count += 1,
            None => {
                L::global_init()?;
                users.push((type_id, 1));
            }
        }
        Ok(Self {
            type_id,
            cleanup: L::global_cleanup,
        })
    }

    /// Live guards for `L`.
    pub fn users<L: TransferLibrary + 'static>() -> usize {
        let users = GLOBAL_USERS.lock().unwrap_or_else(|e| e.into_inner());
        users
            .iter()
            .find(|(id, _)| *id == TypeId::of::<L>())
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

impl Drop for LibraryGuard {
    fn drop(&mut self) {
        let mut users = GLOBAL_USERS.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = users.iter().position(|(id, _)| *id == self.type_id) {
            users[pos].1 -= 1;
            if users[pos].1 == 0 {
                users.swap_remove(pos);
                (self.cleanup)();
            }
        }
    }
}

impl std::fmt::Debug for LibraryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static INITS: AtomicUsize = AtomicUsize::new(0);
    static CLEANUPS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, thiserror::Error)]
    #[error("never")]
    struct Never;

    struct Counted;

    impl TransferLibrary for Counted {
        type Error = Never;

        fn global_init() -> Result<(), Never> {
            INITS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn global_cleanup() {
            CLEANUPS.fetch_add(1, Ordering::SeqCst);
        }
        fn begin(&mut self, _: &TransferRequest) -> Result<(), Never> {
            Ok(())
        }
        fn detach(&mut self) {}
        fn drive_socket(
            &mut self,
            _: SocketFd,
            _: Readiness,
            _: &mut dyn LibraryCallbacks,
        ) -> Result<usize, Never> {
            Ok(0)
        }
        fn drive_timeout(&mut self, _: &mut dyn LibraryCallbacks) -> Result<usize, Never> {
            Ok(0)
        }
        fn resume(&mut self, _: &mut dyn LibraryCallbacks) -> Result<(), Never> {
            Ok(())
        }
        fn next_timeout(&mut self) -> Result<Option<Duration>, Never> {
            Ok(None)
        }
    }

    #[test]
    fn global_state_is_reference_counted() {
        let a = LibraryGuard::acquire::<Counted>().unwrap();
        let b = LibraryGuard::acquire::<Counted>().unwrap();
        assert_eq!(INITS.load(Ordering::SeqCst), 1);
        assert_eq!(LibraryGuard::users::<Counted>(), 2);
        drop(a);
        assert_eq!(CLEANUPS.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(CLEANUPS.load(Ordering::SeqCst), 1);
        assert_eq!(LibraryGuard::users::<Counted>(), 0);
    }

    #[test]
    fn streaming_request_defaults() {
        let r = TransferRequest::streaming("http://radio.example/stream", "urltrans", Duration::from_secs(5));
        assert!(!r.verify_tls);
        assert!(r.follow_redirects);
        assert_eq!(r.max_redirects, 5);
        assert_eq!(r.ok_status_aliases, vec!["ICY 200 OK".to_string()]);
        assert_eq!(r.headers, vec!["Icy-MetaData:0".to_string()]);
    }
}
