//! The fetch loop: one session, one reactor, one sink, all on the current thread.

use std::io::{self, BufWriter, Write};
use std::time::Duration;

use anyhow::Context as _;
use tracing::info;
use urltrans_core::{
    BufferCallbacks, InfoCallbacks, IoDirection, IoWatcherFactory, OutputBuffer, SessionConfig, SocketFd,
    TimerToken, TimerWatcherFactory, TransferSession, TransferState, WatcherError, DEFAULT_HANDSHAKE_ERROR_PATTERN,
};

use crate::config::Config;
use crate::http::{HttpMulti, TLS_HANDSHAKE_FAILED};
use crate::reactor::{IoKey, Reactor, TimerKey, Wakeup};
use crate::sink::Sink;

/// Watchers from the reactor, callbacks from the sink.
pub struct Host {
    pub reactor: Reactor,
    pub sink: Sink,
}

impl BufferCallbacks for Host {
    fn buffer_emptied(&mut self) -> Option<OutputBuffer> {
        self.sink.buffer_emptied()
    }
    fn buffer_filled(&mut self, buffer: OutputBuffer) {
        self.sink.buffer_filled(buffer)
    }
}

impl InfoCallbacks for Host {
    fn on_header(&mut self, line: &[u8]) {
        self.sink.on_header(line)
    }
    fn on_data(&mut self, chunk: &[u8]) -> bool {
        self.sink.on_data(chunk)
    }
    fn on_connection_lost(&mut self) -> bool {
        self.sink.on_connection_lost()
    }
}

impl IoWatcherFactory for Host {
    type Io = IoKey;

    fn io_init(&mut self, socket: SocketFd, direction: IoDirection) -> Result<IoKey, WatcherError> {
        self.reactor.io_init(socket, direction)
    }
    fn io_start(&mut self, io: &mut IoKey) -> Result<(), WatcherError> {
        self.reactor.io_start(io)
    }
    fn io_stop(&mut self, io: &mut IoKey) -> Result<(), WatcherError> {
        self.reactor.io_stop(io)
    }
    fn io_destroy(&mut self, io: IoKey) {
        self.reactor.io_destroy(io)
    }
}

impl TimerWatcherFactory for Host {
    type Timer = TimerKey;

    fn timer_init(&mut self, token: TimerToken) -> Result<TimerKey, WatcherError> {
        self.reactor.timer_init(token)
    }
    fn timer_start(
        &mut self,
        timer: &mut TimerKey,
        delay: Duration,
        repeat: Option<Duration>,
    ) -> Result<(), WatcherError> {
        self.reactor.timer_start(timer, delay, repeat)
    }
    fn timer_restart(&mut self, timer: &mut TimerKey) -> Result<(), WatcherError> {
        self.reactor.timer_restart(timer)
    }
    fn timer_stop(&mut self, timer: &mut TimerKey) -> Result<(), WatcherError> {
        self.reactor.timer_stop(timer)
    }
    fn timer_destroy(&mut self, timer: TimerKey) {
        self.reactor.timer_destroy(timer)
    }
}

type Session = TransferSession<HttpMulti, Host>;

/// Session settings for the rustls backend. The stock handshake pattern is
/// gnutls wording, so it is swapped for this backend's marker.
fn session_config(cfg: &Config) -> SessionConfig {
    let mut session = cfg.session.clone();
    if session.handshake_error_pattern == DEFAULT_HANDSHAKE_ERROR_PATTERN {
        session.handshake_error_pattern = TLS_HANDSHAKE_FAILED.to_string();
    }
    session
}

pub async fn run(cfg: Config, url: String, probe: Option<usize>) -> anyhow::Result<()> {
    let out = open_output(&cfg.output)?;
    let mut host = Host {
        reactor: Reactor::new(),
        sink: Sink::new(out, &cfg, probe),
    };
    let mut session = TransferSession::new(HttpMulti::new(), &mut host, &url, session_config(&cfg))
        .context("cannot create transfer session")?;
    let result = serve(&mut session, &mut host).await;
    session.destroy(&mut host);
    host.sink.flush().context("flushing output")?;

    let info = host.sink.info();
    info!(
        bytes = host.sink.written(),
        coding = ?info.coding,
        station = ?info.station,
        bitrate_kbps = ?info.bitrate_kbps,
        "transfer finished"
    );
    if probe.is_some() {
        println!(
            "content-type: {}\ncoding: {}\nstation: {}",
            info.content_type.as_deref().unwrap_or("unknown"),
            info.coding.map(|c| c.to_string()).unwrap_or_else(|| "unknown".into()),
            info.station.as_deref().unwrap_or("-"),
        );
    }
    result
}

/// Dispatch wakeups into the session until the sink is done, the TLS
/// handshake is known to be failing, or a shutdown signal arrives.
async fn serve(session: &mut Session, host: &mut Host) -> anyhow::Result<()> {
    info!(url = session.uri(), session = %session.id(), "starting transfer");
    session.start(host)?;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        if let Some(e) = host.sink.take_error() {
            return Err(e).context("writing output");
        }
        if host.sink.finished() {
            break;
        }
        if session.handshake_error_found() && session.state() == TransferState::Stopped {
            anyhow::bail!("TLS handshake with {} failed", session.uri());
        }
        let wakeup = tokio::select! {
            w = host.reactor.next_wakeup() => w,
            r = &mut shutdown => {
                r.context("waiting for shutdown signal")?;
                info!("shutting down");
                break;
            }
        };
        match wakeup {
            Wakeup::Io(socket, readiness) => session.on_io_ready(host, socket, readiness)?,
            Wakeup::Timer(token) => session.on_timer_ready(host, token)?,
        }
        // the sink writes synchronously, so buffers are back already
        session.on_buffers_ready(host)?;
    }
    session.cancel(host)?;
    Ok(())
}

fn open_output(path: &str) -> anyhow::Result<Box<dyn Write>> {
    if path == "-" {
        return Ok(Box::new(io::stdout()));
    }
    let file = std::fs::File::create(path).with_context(|| format!("cannot create {path}"))?;
    Ok(Box::new(BufWriter::new(file)))
}

async fn shutdown_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
