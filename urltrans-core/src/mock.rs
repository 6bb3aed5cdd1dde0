//! Scripted transfer library and recording host for unit tests.

use std::collections::VecDeque;
use std::time::Duration;

use crate::collaborator::{BufferCallbacks, InfoCallbacks, OutputBuffer};
use crate::library::{DebugKind, LibraryCallbacks, SocketInterest, TransferLibrary, TransferRequest, WriteOutcome};
use crate::watcher::{IoDirection, IoWatcherFactory, Readiness, SocketFd, TimerToken, TimerWatcherFactory, WatcherError};

#[derive(Debug, thiserror::Error)]
#[error("mock library failure")]
pub struct MockError;

/// One callback the library performs during a drive call.
#[derive(Debug, Clone)]
pub enum Step {
    Socket(SocketFd, SocketInterest),
    Timer(Option<Duration>),
    Header(Vec<u8>),
    Data(Vec<u8>),
    Debug(DebugKind, Vec<u8>),
    /// The transfer ends; running handles drop to zero.
    Finish,
}

/// Each drive call consumes one round of steps.
#[derive(Default)]
pub struct MockLibrary {
    pub rounds: VecDeque<Vec<Step>>,
    pub running: usize,
    pub paused: bool,
    pub held: Vec<u8>,
    pub begins: Vec<TransferRequest>,
    pub detaches: usize,
    pub drives: usize,
    pub socket_drives: Vec<(SocketFd, Readiness)>,
    pub resumes: usize,
    pub fail_begin: bool,
    pub next_timeout: Option<Duration>,
}

impl MockLibrary {
    pub fn round(&mut self, steps: Vec<Step>) -> &mut Self {
        self.rounds.push_back(steps);
        self
    }

    fn deliver(&mut self, data: &[u8], cb: &mut dyn LibraryCallbacks) {
        if self.paused {
            self.held.extend_from_slice(data);
            return;
        }
        if let WriteOutcome::Paused { consumed } = cb.on_write(data) {
            self.held.extend_from_slice(&data[consumed..]);
            self.paused = true;
        }
    }

    fn play(&mut self, cb: &mut dyn LibraryCallbacks) -> usize {
        self.drives += 1;
        if let Some(round) = self.rounds.pop_front() {
            for step in round {
                match step {
                    Step::Socket(fd, interest) => cb.on_socket(fd, interest),
                    Step::Timer(t) => cb.on_timer(t),
                    Step::Header(line) => cb.on_header(&line),
                    Step::Data(data) => self.deliver(&data, cb),
                    Step::Debug(kind, text) => cb.on_debug(kind, &text),
                    Step::Finish => self.running = 0,
                }
            }
        }
        self.running
    }
}

impl TransferLibrary for MockLibrary {
    type Error = MockError;

    fn begin(&mut self, request: &TransferRequest) -> Result<(), MockError> {
        if self.fail_begin {
            return Err(MockError);
        }
        self.begins.push(request.clone());
        self.running = 1;
        self.paused = false;
        self.held.clear();
        Ok(())
    }

    fn detach(&mut self) {
        self.detaches += 1;
        self.running = 0;
    }

    fn drive_socket(
        &mut self,
        socket: SocketFd,
        readiness: Readiness,
        cb: &mut dyn LibraryCallbacks,
    ) -> Result<usize, MockError> {
        self.socket_drives.push((socket, readiness));
        Ok(self.play(cb))
    }

    fn drive_timeout(&mut self, cb: &mut dyn LibraryCallbacks) -> Result<usize, MockError> {
        Ok(self.play(cb))
    }

    fn resume(&mut self, cb: &mut dyn LibraryCallbacks) -> Result<(), MockError> {
        self.resumes += 1;
        self.paused = false;
        let held = std::mem::take(&mut self.held);
        if !held.is_empty() {
            self.deliver(&held, cb);
        }
        Ok(())
    }

    fn next_timeout(&mut self) -> Result<Option<Duration>, MockError> {
        Ok(self.next_timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    IoInit(u32, SocketFd, IoDirection),
    IoStart(u32),
    IoStop(u32),
    IoDestroy(u32),
    TimerInit(TimerToken),
    TimerStart(TimerToken, Duration, Option<Duration>),
    TimerRestart(TimerToken),
    TimerStop(TimerToken),
    TimerDestroy(TimerToken),
}

/// Records watcher traffic and plays the consumer side.
pub struct MockHost {
    pub events: Vec<HostEvent>,
    next_io: u32,
    pub free: Vec<OutputBuffer>,
    pub delivered: Vec<u8>,
    pub headers: Vec<Vec<u8>>,
    pub pause_on_data: bool,
    pub auto_reconnect: bool,
    pub lost: usize,
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            next_io: 0,
            free: Vec::new(),
            delivered: Vec::new(),
            headers: Vec::new(),
            pause_on_data: false,
            auto_reconnect: true,
            lost: 0,
        }
    }

    pub fn give_buffers(&mut self, count: usize, size: usize) {
        for _ in 0..count {
            self.free.push(OutputBuffer::with_capacity(size));
        }
    }

    pub fn count(&self, event: &HostEvent) -> usize {
        self.events.iter().filter(|e| *e == event).count()
    }

    pub fn last_timer_start(&self, token: TimerToken) -> Option<(Duration, Option<Duration>)> {
        self.events.iter().rev().find_map(|e| match e {
            HostEvent::TimerStart(t, d, r) if *t == token => Some((*d, *r)),
            _ => None,
        })
    }
}

impl BufferCallbacks for MockHost {
    fn buffer_emptied(&mut self) -> Option<OutputBuffer> {
        self.free.pop()
    }

    fn buffer_filled(&mut self, buffer: OutputBuffer) {
        self.delivered.extend_from_slice(buffer.filled());
    }
}

impl InfoCallbacks for MockHost {
    fn on_header(&mut self, line: &[u8]) {
        self.headers.push(line.to_vec());
    }

    fn on_data(&mut self, _chunk: &[u8]) -> bool {
        self.pause_on_data
    }

    fn on_connection_lost(&mut self) -> bool {
        self.lost += 1;
        self.auto_reconnect
    }
}

impl IoWatcherFactory for MockHost {
    type Io = u32;

    fn io_init(&mut self, socket: SocketFd, direction: IoDirection) -> Result<u32, WatcherError> {
        self.next_io += 1;
        self.events.push(HostEvent::IoInit(self.next_io, socket, direction));
        Ok(self.next_io)
    }
    fn io_start(&mut self, io: &mut u32) -> Result<(), WatcherError> {
        self.events.push(HostEvent::IoStart(*io));
        Ok(())
    }
    fn io_stop(&mut self, io: &mut u32) -> Result<(), WatcherError> {
        self.events.push(HostEvent::IoStop(*io));
        Ok(())
    }
    fn io_destroy(&mut self, io: u32) {
        self.events.push(HostEvent::IoDestroy(io));
    }
}

impl TimerWatcherFactory for MockHost {
    type Timer = TimerToken;

    fn timer_init(&mut self, token: TimerToken) -> Result<TimerToken, WatcherError> {
        self.events.push(HostEvent::TimerInit(token));
        Ok(token)
    }
    fn timer_start(
        &mut self,
        timer: &mut TimerToken,
        delay: Duration,
        repeat: Option<Duration>,
    ) -> Result<(), WatcherError> {
        self.events.push(HostEvent::TimerStart(*timer, delay, repeat));
        Ok(())
    }
    fn timer_restart(&mut self, timer: &mut TimerToken) -> Result<(), WatcherError> {
        self.events.push(HostEvent::TimerRestart(*timer));
        Ok(())
    }
    fn timer_stop(&mut self, timer: &mut TimerToken) -> Result<(), WatcherError> {
        self.events.push(HostEvent::TimerStop(*timer));
        Ok(())
    }
    fn timer_destroy(&mut self, timer: TimerToken) {
        self.events.push(HostEvent::TimerDestroy(timer));
    }
}
