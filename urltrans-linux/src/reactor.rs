//! Watchers on the tokio runtime: `AsyncFd` for sockets, `Sleep` for timers.
//! The session arms and disarms them; `next_wakeup` reports the next one to fire.

use std::collections::HashMap;
use std::future::{poll_fn, Future};
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::time::{Instant, Sleep};
use urltrans_core::{IoDirection, IoWatcherFactory, Readiness, SocketFd, TimerToken, TimerWatcherFactory, WatcherError};

/// Descriptor owned by the transfer library; never closed here.
struct WatchedFd(RawFd);

impl AsRawFd for WatchedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Handle to a registered socket watcher.
#[derive(Debug)]
pub struct IoKey(u64);

/// Handle to a registered timer.
#[derive(Debug)]
pub struct TimerKey(u64);

struct IoSlot {
    socket: SocketFd,
    direction: IoDirection,
    fd: AsyncFd<WatchedFd>,
    armed: bool,
}

struct TimerSlot {
    token: TimerToken,
    delay: Duration,
    repeat: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    Io(SocketFd, Readiness),
    Timer(TimerToken),
}

#[derive(Default)]
pub struct Reactor {
    next_key: u64,
    io: HashMap<u64, IoSlot>,
    timers: HashMap<u64, TimerSlot>,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }

    /// Resolves when an armed watcher fires. Pending forever if none is armed.
    pub async fn next_wakeup(&mut self) -> Wakeup {
        poll_fn(|cx| self.poll_wakeup(cx)).await
    }

    pub fn poll_wakeup(&mut self, cx: &mut Context<'_>) -> Poll<Wakeup> {
        for slot in self.io.values() {
            if !slot.armed {
                continue;
            }
            if let Some(readiness) = poll_io(slot, cx) {
                return Poll::Ready(Wakeup::Io(slot.socket, readiness));
            }
        }
        for slot in self.timers.values_mut() {
            let Some(sleep) = slot.sleep.as_mut() else {
                continue;
            };
            if sleep.as_mut().poll(cx).is_ready() {
                match slot.repeat {
                    Some(every) => sleep.as_mut().reset(Instant::now() + every),
                    None => slot.sleep = None,
                }
                return Poll::Ready(Wakeup::Timer(slot.token));
            }
        }
        Poll::Pending
    }
}

/// Readiness of an armed socket. Readiness is cleared here; the transfer
/// library reads or writes until it would block.
fn poll_io(slot: &IoSlot, cx: &mut Context<'_>) -> Option<Readiness> {
    let mut readiness = Readiness::default();
    if matches!(slot.direction, IoDirection::Read | IoDirection::ReadOrWrite) {
        match slot.fd.poll_read_ready(cx) {
            Poll::Ready(Ok(mut guard)) => {
                guard.clear_ready();
                readiness.readable = true;
            }
            // surface the error through the library's next read
            Poll::Ready(Err(_)) => readiness.readable = true,
            Poll::Pending => {}
        }
    }
    if matches!(slot.direction, IoDirection::Write | IoDirection::ReadOrWrite) {
        match slot.fd.poll_write_ready(cx) {
            Poll::Ready(Ok(mut guard)) => {
                guard.clear_ready();
                readiness.writable = true;
            }
            Poll::Ready(Err(_)) => readiness.writable = true,
            Poll::Pending => {}
        }
    }
    (readiness != Readiness::default()).then_some(readiness)
}

impl IoWatcherFactory for Reactor {
    type Io = IoKey;

    fn io_init(&mut self, socket: SocketFd, direction: IoDirection) -> Result<IoKey, WatcherError> {
        let interest = match direction {
            IoDirection::Read => Interest::READABLE,
            IoDirection::Write => Interest::WRITABLE,
            IoDirection::ReadOrWrite => Interest::READABLE.add(Interest::WRITABLE),
        };
        let fd = AsyncFd::with_interest(WatchedFd(socket.raw()), interest)
            .map_err(|e| WatcherError::Init(format!("{socket}: {e}")))?;
        let key = self.key();
        self.io.insert(
            key,
            IoSlot {
                socket,
                direction,
                fd,
                armed: false,
            },
        );
        Ok(IoKey(key))
    }

    fn io_start(&mut self, io: &mut IoKey) -> Result<(), WatcherError> {
        let slot = self
            .io
            .get_mut(&io.0)
            .ok_or_else(|| WatcherError::Arm(format!("unknown io watcher {}", io.0)))?;
        slot.armed = true;
        Ok(())
    }

    fn io_stop(&mut self, io: &mut IoKey) -> Result<(), WatcherError> {
        if let Some(slot) = self.io.get_mut(&io.0) {
            slot.armed = false;
        }
        Ok(())
    }

    fn io_destroy(&mut self, io: IoKey) {
        self.io.remove(&io.0);
    }
}

impl TimerWatcherFactory for Reactor {
    type Timer = TimerKey;

    fn timer_init(&mut self, token: TimerToken) -> Result<TimerKey, WatcherError> {
        let key = self.key();
        self.timers.insert(
            key,
            TimerSlot {
                token,
                delay: Duration::ZERO,
                repeat: None,
                sleep: None,
            },
        );
        Ok(TimerKey(key))
    }

    fn timer_start(
        &mut self,
        timer: &mut TimerKey,
        delay: Duration,
        repeat: Option<Duration>,
    ) -> Result<(), WatcherError> {
        let slot = self
            .timers
            .get_mut(&timer.0)
            .ok_or_else(|| WatcherError::Arm(format!("unknown timer {}", timer.0)))?;
        slot.delay = delay;
        slot.repeat = repeat;
        slot.sleep = Some(Box::pin(tokio::time::sleep(delay)));
        Ok(())
    }

    fn timer_restart(&mut self, timer: &mut TimerKey) -> Result<(), WatcherError> {
        let slot = self
            .timers
            .get_mut(&timer.0)
            .ok_or_else(|| WatcherError::Arm(format!("unknown timer {}", timer.0)))?;
        slot.sleep = Some(Box::pin(tokio::time::sleep(slot.delay)));
        Ok(())
    }

    fn timer_stop(&mut self, timer: &mut TimerKey) -> Result<(), WatcherError> {
        if let Some(slot) = self.timers.get_mut(&timer.0) {
            slot.sleep = None;
        }
        Ok(())
    }

    fn timer_destroy(&mut self, timer: TimerKey) {
        self.timers.remove(&timer.0);
    }
}
