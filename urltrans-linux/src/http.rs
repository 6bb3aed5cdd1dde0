//! HTTP/1.0 and HTTPS transfer library over non-blocking sockets.
//!
//! One transfer at a time. Every drive call pushes the transfer as far as it
//! can go without blocking: resolve, connect, TLS handshake, send the request,
//! read the response head, then stream the body through the write callback
//! until EOF. Shoutcast `ICY 200 OK` status lines are accepted through the
//! request's alias list.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use url::{Host, Url};
use urltrans_core::{
    DebugKind, LibraryCallbacks, Readiness, SocketFd, SocketInterest, TransferLibrary, TransferRequest, WriteOutcome,
};

const MAX_HEAD_BYTES: usize = 16 * 1024;
const READ_CHUNK: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;
/// Linux errno for a non-blocking connect still in progress.
const EINPROGRESS: i32 = 115;
/// How often a pending name lookup is checked.
const RESOLVE_POLL: Duration = Duration::from_millis(10);

/// Leading text of the diagnostic emitted when the TLS handshake fails.
pub const TLS_HANDSHAKE_FAILED: &str = "TLS handshake failed";

type Lookup = oneshot::Receiver<io::Result<Vec<SocketAddr>>>;

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("invalid URL {0}")]
    InvalidUrl(String),
    #[error("protocol \"{0}\" not supported")]
    UnsupportedScheme(String),
    #[error("could not resolve host {0}")]
    Resolve(String),
    #[error("connection timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("connection closed before the response head was complete")]
    ConnectionClosed,
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(rustls::Error),
    #[error("malformed response head")]
    InvalidResponse,
    #[error("response head larger than 16 KiB")]
    HeadTooLarge,
    #[error("the requested URL returned error: {0}")]
    HttpStatus(u16),
    #[error("maximum ({0}) redirects followed")]
    TooManyRedirects(u32),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Resolve,
    Resolving,
    Connect,
    Connecting,
    Handshake,
    Sending,
    Head,
    Body,
    Done,
}

struct Transfer {
    request: TransferRequest,
    url: Url,
    redirects: u32,
    phase: Phase,
    lookup: Option<Lookup>,
    addrs: VecDeque<SocketAddr>,
    socket: Option<(Socket, SocketFd)>,
    tls: Option<Box<ClientConnection>>,
    /// Covers resolve, connect and TLS handshake.
    deadline: Option<Instant>,
    out: Vec<u8>,
    sent: usize,
    head: Vec<u8>,
    held: Vec<u8>,
    paused: bool,
    /// Last interest reported, so unchanged interest is not re-reported.
    reported: Option<(SocketFd, SocketInterest)>,
    scratch: Box<[u8]>,
}

/// Status code and redirect target from a response head.
#[derive(Debug, PartialEq, Eq)]
pub struct ResponseHead {
    pub code: u16,
    pub location: Option<String>,
}

/// The transfer library the Linux host drives.
#[derive(Default)]
pub struct HttpMulti {
    transfer: Option<Transfer>,
}

impl HttpMulti {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transfers still in progress: 0 or 1.
    pub fn running_handles(&self) -> usize {
        usize::from(self.transfer.is_some())
    }

    fn progress(&mut self, cb: &mut dyn LibraryCallbacks) -> usize {
        let Some(t) = self.transfer.as_mut() else {
            return 0;
        };
        if let Err(e) = t.step(cb) {
            t.fail(cb, e);
        }
        if t.phase == Phase::Done {
            self.transfer = None;
            return 0;
        }
        1
    }
}

impl TransferLibrary for HttpMulti {
    type Error = HttpError;

    fn begin(&mut self, request: &TransferRequest) -> Result<(), HttpError> {
        let url = Url::parse(&request.url).map_err(|e| HttpError::InvalidUrl(format!("{}: {e}", request.url)))?;
        self.transfer = Some(Transfer {
            request: request.clone(),
            url,
            redirects: 0,
            phase: Phase::Resolve,
            lookup: None,
            addrs: VecDeque::new(),
            socket: None,
            tls: None,
            deadline: None,
            out: Vec::new(),
            sent: 0,
            head: Vec::new(),
            held: Vec::new(),
            paused: false,
            reported: None,
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
        });
        Ok(())
    }

    fn detach(&mut self) {
        self.transfer = None;
    }

    fn drive_socket(
        &mut self,
        _socket: SocketFd,
        _readiness: Readiness,
        callbacks: &mut dyn LibraryCallbacks,
    ) -> Result<usize, HttpError> {
        Ok(self.progress(callbacks))
    }

    fn drive_timeout(&mut self, callbacks: &mut dyn LibraryCallbacks) -> Result<usize, HttpError> {
        Ok(self.progress(callbacks))
    }

    fn resume(&mut self, callbacks: &mut dyn LibraryCallbacks) -> Result<(), HttpError> {
        let Some(t) = self.transfer.as_mut() else {
            return Ok(());
        };
        if !t.paused {
            return Ok(());
        }
        t.paused = false;
        // interest must be re-announced: the session disarmed its watcher on pause
        t.reported = None;
        let held = std::mem::take(&mut t.held);
        if !held.is_empty() {
            deliver(&mut t.held, &mut t.paused, callbacks, &held);
        }
        Ok(())
    }

    fn next_timeout(&mut self) -> Result<Option<Duration>, HttpError> {
        let Some(t) = self.transfer.as_ref() else {
            return Ok(None);
        };
        let left = t.deadline.map(|d| d.saturating_duration_since(Instant::now()));
        Ok(match t.phase {
            Phase::Resolving => Some(left.map_or(RESOLVE_POLL, |l| l.min(RESOLVE_POLL))),
            _ => left,
        })
    }
}

impl Transfer {
    fn step(&mut self, cb: &mut dyn LibraryCallbacks) -> Result<(), HttpError> {
        loop {
            let advanced = match self.phase {
                Phase::Resolve => self.resolve(cb)?,
                Phase::Resolving => self.poll_lookup(cb)?,
                Phase::Connect => self.connect(cb)?,
                Phase::Connecting => self.poll_connect(cb)?,
                Phase::Handshake => self.handshake(cb)?,
                Phase::Sending => self.send(cb)?,
                Phase::Head => self.read_head(cb)?,
                Phase::Body => {
                    self.read_body(cb)?;
                    false
                }
                Phase::Done => false,
            };
            if !advanced {
                return Ok(());
            }
        }
    }

    fn host(&self) -> Result<String, HttpError> {
        self.url
            .host_str()
            .map(str::to_string)
            .ok_or_else(|| HttpError::InvalidUrl(self.url.to_string()))
    }

    fn time_left(&self) -> Result<Option<Duration>, HttpError> {
        let Some(d) = self.deadline else {
            return Ok(None);
        };
        let now = Instant::now();
        if now >= d {
            return Err(HttpError::ConnectTimeout(self.request.connect_timeout));
        }
        Ok(Some(d - now))
    }

    /// Literal addresses connect straight away; names are looked up on the
    /// runtime's blocking pool so the driving thread never waits on DNS.
    fn resolve(&mut self, cb: &mut dyn LibraryCallbacks) -> Result<bool, HttpError> {
        match self.url.scheme() {
            "http" | "https" => {}
            other => return Err(HttpError::UnsupportedScheme(other.into())),
        }
        let port = self.url.port_or_known_default().unwrap_or(80);
        self.deadline = Some(Instant::now() + self.request.connect_timeout);
        let literal = match self.url.host() {
            Some(Host::Ipv4(ip)) => IpAddr::V4(ip),
            Some(Host::Ipv6(ip)) => IpAddr::V6(ip),
            Some(Host::Domain(name)) => {
                let name = name.to_string();
                let handle = tokio::runtime::Handle::try_current()
                    .map_err(|_| HttpError::Resolve(format!("{name} (no runtime for the lookup)")))?;
                let (tx, rx) = oneshot::channel::<io::Result<Vec<SocketAddr>>>();
                let query = name.clone();
                handle.spawn_blocking(move || {
                    let found = (query.as_str(), port).to_socket_addrs().map(|a| a.collect());
                    // the transfer may be gone by now
                    let _ = tx.send(found);
                });
                self.text(cb, &format!("Resolving {name}..."));
                self.lookup = Some(rx);
                self.phase = Phase::Resolving;
                cb.on_timer(Some(RESOLVE_POLL));
                return Ok(false);
            }
            None => return Err(HttpError::InvalidUrl(self.url.to_string())),
        };
        self.addrs = VecDeque::from([SocketAddr::new(literal, port)]);
        self.phase = Phase::Connect;
        cb.on_timer(Some(self.request.connect_timeout));
        Ok(true)
    }

    fn poll_lookup(&mut self, cb: &mut dyn LibraryCallbacks) -> Result<bool, HttpError> {
        let host = self.host()?;
        let Some(rx) = self.lookup.as_mut() else {
            return Err(HttpError::Resolve(host));
        };
        match rx.try_recv() {
            Ok(Ok(addrs)) if !addrs.is_empty() => {
                self.lookup = None;
                self.addrs = addrs.into();
                self.phase = Phase::Connect;
                let left = self.time_left()?;
                cb.on_timer(left);
                Ok(true)
            }
            Ok(_) | Err(oneshot::error::TryRecvError::Closed) => Err(HttpError::Resolve(host)),
            Err(oneshot::error::TryRecvError::Empty) => {
                let left = self.time_left()?;
                cb.on_timer(Some(left.map_or(RESOLVE_POLL, |l| l.min(RESOLVE_POLL))));
                Ok(false)
            }
        }
    }

    /// Open a socket to the next candidate address.
    fn connect(&mut self, cb: &mut dyn LibraryCallbacks) -> Result<bool, HttpError> {
        let mut last = None;
        while let Some(addr) = self.addrs.pop_front() {
            self.text(cb, &format!("Trying {addr}..."));
            match open_socket(addr) {
                Ok(socket) => {
                    let fd = SocketFd(socket.as_raw_fd());
                    self.socket = Some((socket, fd));
                    self.phase = Phase::Connecting;
                    self.watch(cb, SocketInterest::Out);
                    return Ok(true);
                }
                Err(e) => {
                    self.text(cb, &format!("connect to {addr} failed: {e}"));
                    last = Some(e);
                }
            }
        }
        match last {
            Some(e) => Err(e.into()),
            None => Err(HttpError::Resolve(self.host()?)),
        }
    }

    fn poll_connect(&mut self, cb: &mut dyn LibraryCallbacks) -> Result<bool, HttpError> {
        let Some((socket, _)) = self.socket.as_ref() else {
            return Err(HttpError::ConnectionClosed);
        };
        if let Some(e) = socket.take_error()? {
            if self.addrs.is_empty() {
                return Err(e.into());
            }
            self.text(cb, &format!("connect failed: {e}"));
            self.close(cb);
            self.phase = Phase::Connect;
            return Ok(true);
        }
        match socket.peer_addr() {
            Ok(peer) => {
                let peer = peer.as_socket().map(|a| a.to_string()).unwrap_or_default();
                self.text(cb, &format!("Connected to {} ({peer})", self.url.host_str().unwrap_or_default()));
                if self.url.scheme() == "https" {
                    self.tls = Some(Box::new(self.client_connection()?));
                    self.phase = Phase::Handshake;
                    return Ok(true);
                }
                self.deadline = None;
                cb.on_timer(None);
                self.start_request(cb);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                let left = self.time_left()?;
                if left.is_some() {
                    cb.on_timer(left);
                }
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn client_connection(&self) -> Result<ClientConnection, HttpError> {
        let name = match self.url.host() {
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => self.host()?,
        };
        let server_name = ServerName::try_from(name).map_err(|e| HttpError::InvalidUrl(format!("{}: {e}", self.url)))?;
        let config = tls_config(self.request.verify_tls).map_err(HttpError::TlsHandshake)?;
        ClientConnection::new(config, server_name).map_err(HttpError::TlsHandshake)
    }

    fn handshake(&mut self, cb: &mut dyn LibraryCallbacks) -> Result<bool, HttpError> {
        let left = self.time_left()?;
        let (Some((socket, _)), Some(tls)) = (self.socket.as_mut(), self.tls.as_deref_mut()) else {
            return Err(HttpError::ConnectionClosed);
        };
        let blocked = loop {
            if tls.wants_write() {
                match tls.write_tls(&mut *socket) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Some(SocketInterest::Out),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            if !tls.is_handshaking() {
                break None;
            }
            match tls.read_tls(&mut *socket) {
                Ok(0) => return Err(HttpError::ConnectionClosed),
                Ok(_) => {
                    if let Err(e) = tls.process_new_packets() {
                        // best effort: let the server see our alert
                        let _ = tls.write_tls(&mut *socket);
                        return Err(HttpError::TlsHandshake(e));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Some(SocketInterest::In),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        };
        if let Some(interest) = blocked {
            self.watch(cb, interest);
            if left.is_some() {
                cb.on_timer(left);
            }
            return Ok(false);
        }
        if let Some(version) = self.tls.as_ref().and_then(|t| t.protocol_version()) {
            self.text(cb, &format!("TLS connection using {version:?}"));
        }
        self.deadline = None;
        cb.on_timer(None);
        self.start_request(cb);
        Ok(true)
    }

    fn start_request(&mut self, cb: &mut dyn LibraryCallbacks) {
        self.out = build_request(&self.url, &self.request);
        self.sent = 0;
        if self.request.verbose {
            cb.on_debug(DebugKind::HeaderOut, &self.out);
        }
        self.phase = Phase::Sending;
    }

    fn send(&mut self, cb: &mut dyn LibraryCallbacks) -> Result<bool, HttpError> {
        let Some((socket, _)) = self.socket.as_mut() else {
            return Err(HttpError::ConnectionClosed);
        };
        let done = match self.tls.as_deref_mut() {
            Some(tls) => {
                if self.sent < self.out.len() {
                    tls.writer().write_all(&self.out[self.sent..])?;
                    self.sent = self.out.len();
                }
                flush_tls(tls, socket)?
            }
            None => loop {
                if self.sent == self.out.len() {
                    break true;
                }
                match socket.write(&self.out[self.sent..]) {
                    Ok(0) => return Err(HttpError::ConnectionClosed),
                    Ok(n) => self.sent += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break false,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e.into()),
                }
            },
        };
        if !done {
            self.watch(cb, SocketInterest::Out);
            return Ok(false);
        }
        self.phase = Phase::Head;
        self.head.clear();
        self.watch(cb, SocketInterest::In);
        Ok(true)
    }

    /// Read decrypted or plain bytes into the scratch buffer. 0 is EOF.
    fn read_some(&mut self) -> io::Result<usize> {
        let Some((socket, _)) = self.socket.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        match self.tls.as_deref_mut() {
            Some(tls) => read_plaintext(tls, socket, &mut self.scratch),
            None => socket.read(&mut self.scratch),
        }
    }

    fn read_head(&mut self, cb: &mut dyn LibraryCallbacks) -> Result<bool, HttpError> {
        loop {
            let n = match self.read_some() {
                Ok(0) => return Err(HttpError::ConnectionClosed),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.head.extend_from_slice(&self.scratch[..n]);
            if let Some(end) = find_head_end(&self.head) {
                let body = self.head.split_off(end);
                let head = std::mem::take(&mut self.head);
                self.on_head(cb, &head, &body)?;
                return Ok(true);
            }
            if self.head.len() > MAX_HEAD_BYTES {
                return Err(HttpError::HeadTooLarge);
            }
        }
    }

    fn on_head(&mut self, cb: &mut dyn LibraryCallbacks, head: &[u8], body: &[u8]) -> Result<(), HttpError> {
        if self.request.verbose {
            cb.on_debug(DebugKind::HeaderIn, head);
        }
        let parsed = parse_head(head, &self.request.ok_status_aliases)?;
        for line in head_lines(head) {
            cb.on_header(line);
        }
        debug!(url = %self.url, code = parsed.code, "response head");

        if (300..400).contains(&parsed.code) && self.request.follow_redirects {
            if let Some(location) = parsed.location {
                return self.redirect(cb, &location);
            }
        }
        if parsed.code >= 400 && self.request.fail_on_error {
            return Err(HttpError::HttpStatus(parsed.code));
        }
        self.phase = Phase::Body;
        if !body.is_empty() {
            deliver(&mut self.held, &mut self.paused, cb, body);
        }
        Ok(())
    }

    fn redirect(&mut self, cb: &mut dyn LibraryCallbacks, location: &str) -> Result<(), HttpError> {
        self.redirects += 1;
        if self.redirects > self.request.max_redirects {
            return Err(HttpError::TooManyRedirects(self.request.max_redirects));
        }
        let next = self
            .url
            .join(location)
            .map_err(|e| HttpError::InvalidUrl(format!("{location}: {e}")))?;
        self.text(cb, &format!("Issue another request to this URL: '{next}'"));
        self.close(cb);
        self.url = next;
        self.phase = Phase::Resolve;
        Ok(())
    }

    fn read_body(&mut self, cb: &mut dyn LibraryCallbacks) -> Result<(), HttpError> {
        if self.paused {
            return Ok(());
        }
        self.watch(cb, SocketInterest::In);
        loop {
            match self.read_some() {
                Ok(0) => {
                    self.text(cb, "Connection closed by server");
                    self.finish(cb);
                    return Ok(());
                }
                Ok(n) => {
                    if !deliver(&mut self.held, &mut self.paused, cb, &self.scratch[..n]) {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn watch(&mut self, cb: &mut dyn LibraryCallbacks, interest: SocketInterest) {
        let Some((_, fd)) = self.socket.as_ref() else {
            return;
        };
        let fd = *fd;
        if self.reported != Some((fd, interest)) {
            self.reported = Some((fd, interest));
            cb.on_socket(fd, interest);
        }
    }

    /// Verbose text diagnostic, newline terminated.
    fn text(&self, cb: &mut dyn LibraryCallbacks, msg: &str) {
        if !self.request.verbose {
            return;
        }
        let mut line = msg.as_bytes().to_vec();
        line.push(b'\n');
        cb.on_debug(DebugKind::Text, &line);
    }

    /// Announce removal and close the socket.
    fn close(&mut self, cb: &mut dyn LibraryCallbacks) {
        if let Some((_, fd)) = self.socket.as_ref() {
            cb.on_socket(*fd, SocketInterest::Remove);
        }
        self.socket = None;
        self.tls = None;
        self.reported = None;
    }

    fn finish(&mut self, cb: &mut dyn LibraryCallbacks) {
        self.close(cb);
        self.lookup = None;
        self.deadline = None;
        cb.on_timer(None);
        self.phase = Phase::Done;
    }

    fn fail(&mut self, cb: &mut dyn LibraryCallbacks, e: HttpError) {
        warn!(url = %self.url, error = %e, "transfer failed");
        self.text(cb, &e.to_string());
        self.finish(cb);
    }
}

fn open_socket(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => Ok(socket),
        Err(e) if e.raw_os_error() == Some(EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock => Ok(socket),
        Err(e) => Err(e),
    }
}

/// Write pending TLS records. False when the socket would block.
fn flush_tls(tls: &mut ClientConnection, socket: &mut Socket) -> io::Result<bool> {
    while tls.wants_write() {
        match tls.write_tls(&mut *socket) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Plaintext from a TLS connection. A peer that closes without
/// `close_notify` is treated as a normal end of stream.
fn read_plaintext(tls: &mut ClientConnection, socket: &mut Socket, buf: &mut [u8]) -> io::Result<usize> {
    let mut eof = false;
    loop {
        match tls.reader().read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock && eof => return Ok(0),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        if tls.read_tls(&mut *socket)? == 0 {
            eof = true;
        }
        tls.process_new_packets().map_err(io::Error::other)?;
        flush_tls(tls, &mut *socket)?;
    }
}

fn tls_config(verify: bool) -> Result<Arc<ClientConfig>, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider).with_safe_default_protocol_versions()?;
    let config = if verify {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth()
    };
    Ok(Arc::new(config))
}

/// Stream servers often run self-signed or mismatched certificates.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Hand `data` to the write callback. Returns false once the transfer is paused.
fn deliver(held: &mut Vec<u8>, paused: &mut bool, cb: &mut dyn LibraryCallbacks, data: &[u8]) -> bool {
    if *paused {
        held.extend_from_slice(data);
        return false;
    }
    match cb.on_write(data) {
        WriteOutcome::Accepted => true,
        WriteOutcome::Paused { consumed } => {
            held.extend_from_slice(&data[consumed.min(data.len())..]);
            *paused = true;
            false
        }
    }
}

pub fn build_request(url: &Url, request: &TransferRequest) -> Vec<u8> {
    let path = &url[url::Position::BeforePath..url::Position::AfterQuery];
    let path = if path.is_empty() { "/" } else { path };
    let host = url.host_str().unwrap_or_default();
    let host = match url.port() {
        Some(p) => format!("{host}:{p}"),
        None => host.to_string(),
    };
    let mut out = format!(
        "GET {path} HTTP/1.0\r\nHost: {host}\r\nUser-Agent: {}\r\nAccept: */*\r\n",
        request.user_agent
    );
    for h in &request.headers {
        out.push_str(h);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out.into_bytes()
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Split a head into lines, each keeping its CRLF, the closing blank line included.
fn head_lines(head: &[u8]) -> impl Iterator<Item = &[u8]> {
    head.split_inclusive(|&b| b == b'\n')
}

/// Parse a complete response head. Status lines starting with one of `aliases`
/// are read as `HTTP/1.0 200 OK`.
pub fn parse_head(head: &[u8], aliases: &[String]) -> Result<ResponseHead, HttpError> {
    let head = normalize_status_line(head, aliases);
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(HttpError::InvalidResponse),
    }
    let code = resp.code.ok_or(HttpError::InvalidResponse)?;
    let location = resp
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("location"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(|v| v.trim().to_string());
    Ok(ResponseHead { code, location })
}

fn normalize_status_line<'a>(head: &'a [u8], aliases: &[String]) -> Cow<'a, [u8]> {
    let line_end = head.iter().position(|&b| b == b'\r' || b == b'\n').unwrap_or(head.len());
    let line = &head[..line_end];
    let aliased = aliases.iter().any(|a| {
        let a = a.as_bytes();
        line.len() >= a.len() && line[..a.len()].eq_ignore_ascii_case(a)
    });
    if !aliased {
        return Cow::Borrowed(head);
    }
    let mut v = b"HTTP/1.0 200 OK".to_vec();
    v.extend_from_slice(&head[line_end..]);
    Cow::Owned(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        headers: Vec<Vec<u8>>,
        body: Vec<u8>,
        sockets: Vec<(SocketFd, SocketInterest)>,
        timers: Vec<Option<Duration>>,
        debug: Vec<String>,
        pause_after: Option<usize>,
    }

    impl LibraryCallbacks for Recorder {
        fn on_header(&mut self, line: &[u8]) {
            self.headers.push(line.to_vec());
        }
        fn on_write(&mut self, chunk: &[u8]) -> WriteOutcome {
            if let Some(limit) = self.pause_after.take() {
                let n = limit.min(chunk.len());
                self.body.extend_from_slice(&chunk[..n]);
                return WriteOutcome::Paused { consumed: n };
            }
            self.body.extend_from_slice(chunk);
            WriteOutcome::Accepted
        }
        fn on_socket(&mut self, socket: SocketFd, interest: SocketInterest) {
            self.sockets.push((socket, interest));
        }
        fn on_timer(&mut self, timeout: Option<Duration>) {
            self.timers.push(timeout);
        }
        fn on_debug(&mut self, _kind: DebugKind, text: &[u8]) {
            self.debug.push(String::from_utf8_lossy(text).into_owned());
        }
    }

    fn request(url: &str) -> TransferRequest {
        TransferRequest::streaming(url, "urltrans-test", Duration::from_secs(2))
    }

    /// Serve one canned response per accepted connection; returns the requests seen.
    fn serve(responses: Vec<Vec<u8>>) -> (u16, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for resp in responses {
                let (mut s, _) = listener.accept().unwrap();
                let mut req = Vec::new();
                let mut b = [0u8; 1024];
                while find_head_end(&req).is_none() {
                    let n = s.read(&mut b).unwrap();
                    if n == 0 {
                        break;
                    }
                    req.extend_from_slice(&b[..n]);
                }
                seen.push(String::from_utf8_lossy(&req).into_owned());
                s.write_all(&resp).unwrap();
            }
            seen
        });
        (port, handle)
    }

    fn drive_until(lib: &mut HttpMulti, rec: &mut Recorder, done: impl Fn(&HttpMulti, &Recorder) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(lib, rec) {
            assert!(Instant::now() < deadline, "transfer did not finish");
            lib.drive_timeout(rec).unwrap();
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn finished(lib: &HttpMulti, _: &Recorder) -> bool {
        lib.running_handles() == 0
    }

    fn body(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn icy_alias_is_read_as_ok() {
        let aliases = vec!["ICY 200 OK".to_string()];
        let head = parse_head(b"ICY 200 OK\r\nicy-name: Test\r\n\r\n", &aliases).unwrap();
        assert_eq!(head.code, 200);
        assert!(parse_head(b"ICY 200 OK\r\n\r\n", &[]).is_err());
    }

    #[test]
    fn redirect_location_is_extracted() {
        let head = parse_head(b"HTTP/1.1 302 Found\r\nLocation:  /next \r\n\r\n", &[]).unwrap();
        assert_eq!(head, ResponseHead { code: 302, location: Some("/next".into()) });
    }

    #[test]
    fn garbage_head_is_rejected() {
        assert!(matches!(parse_head(b"SSH-2.0-OpenSSH\r\n\r\n", &[]), Err(HttpError::InvalidResponse)));
    }

    #[test]
    fn request_carries_host_agent_and_extra_headers() {
        let url = Url::parse("http://radio.example:8000/live?sid=1").unwrap();
        let req = String::from_utf8(build_request(&url, &request(url.as_str()))).unwrap();
        assert!(req.starts_with("GET /live?sid=1 HTTP/1.0\r\n"));
        assert!(req.contains("Host: radio.example:8000\r\n"));
        assert!(req.contains("User-Agent: urltrans-test\r\n"));
        assert!(req.contains("Icy-MetaData:0\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[test]
    fn streams_icy_response_until_eof() {
        let payload = body(40_000);
        let mut resp = b"ICY 200 OK\r\ncontent-type: audio/mpeg\r\nicy-br: 128\r\n\r\n".to_vec();
        resp.extend_from_slice(&payload);
        let (port, server) = serve(vec![resp]);

        let mut lib = HttpMulti::new();
        let mut rec = Recorder::default();
        lib.begin(&request(&format!("http://127.0.0.1:{port}/stream"))).unwrap();
        assert_eq!(lib.running_handles(), 1);
        drive_until(&mut lib, &mut rec, finished);

        assert_eq!(rec.body, payload);
        assert_eq!(rec.headers[0], b"ICY 200 OK\r\n".to_vec());
        assert_eq!(rec.headers.last().unwrap(), &b"\r\n".to_vec());
        assert!(rec.sockets.iter().any(|(_, i)| *i == SocketInterest::Out));
        assert!(rec.sockets.iter().any(|(_, i)| *i == SocketInterest::In));
        assert_eq!(rec.sockets.last().unwrap().1, SocketInterest::Remove);
        assert_eq!(rec.timers.last(), Some(&None));
        let seen = server.join().unwrap();
        assert!(seen[0].contains("Icy-MetaData:0"));
    }

    #[test]
    fn error_status_fails_the_transfer() {
        let (port, server) = serve(vec![b"HTTP/1.0 404 Not Found\r\n\r\nmissing".to_vec()]);
        let mut lib = HttpMulti::new();
        let mut rec = Recorder::default();
        lib.begin(&request(&format!("http://127.0.0.1:{port}/"))).unwrap();
        drive_until(&mut lib, &mut rec, finished);
        assert!(rec.body.is_empty());
        assert!(rec.debug.iter().any(|d| d.contains("404")));
        server.join().unwrap();
    }

    #[test]
    fn follows_redirects() {
        let payload = body(1000);
        let mut ok = b"HTTP/1.0 200 OK\r\n\r\n".to_vec();
        ok.extend_from_slice(&payload);
        let (target, second) = serve(vec![ok]);
        let moved = format!("HTTP/1.0 302 Found\r\nLocation: http://127.0.0.1:{target}/next\r\n\r\n");
        let (port, first) = serve(vec![moved.into_bytes()]);

        let mut lib = HttpMulti::new();
        let mut rec = Recorder::default();
        lib.begin(&request(&format!("http://127.0.0.1:{port}/old"))).unwrap();
        drive_until(&mut lib, &mut rec, finished);
        assert_eq!(rec.body, payload);
        assert!(second.join().unwrap()[0].starts_with("GET /next "));
        first.join().unwrap();
    }

    /// Self-signed TLS server answering one request; returns the request seen.
    fn serve_tls(response: Vec<u8>) -> (u16, thread::JoinHandle<Option<String>>) {
        use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let chain = vec![CertificateDer::from(cert.serialize_der().unwrap())];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));
        let config = rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (tcp, _) = listener.accept().ok()?;
            let conn = rustls::ServerConnection::new(Arc::new(config)).ok()?;
            let mut tls = rustls::StreamOwned::new(conn, tcp);
            let mut req = Vec::new();
            let mut b = [0u8; 1024];
            while find_head_end(&req).is_none() {
                let n = tls.read(&mut b).ok()?;
                if n == 0 {
                    return None;
                }
                req.extend_from_slice(&b[..n]);
            }
            tls.write_all(&response).ok()?;
            tls.conn.send_close_notify();
            tls.flush().ok()?;
            Some(String::from_utf8_lossy(&req).into_owned())
        });
        (port, handle)
    }

    #[test]
    fn streams_over_tls_with_self_signed_certificate() {
        let payload = body(50_000);
        let mut resp = b"ICY 200 OK\r\ncontent-type: audio/aac\r\n\r\n".to_vec();
        resp.extend_from_slice(&payload);
        let (port, server) = serve_tls(resp);

        let mut lib = HttpMulti::new();
        let mut rec = Recorder::default();
        lib.begin(&request(&format!("https://127.0.0.1:{port}/live"))).unwrap();
        drive_until(&mut lib, &mut rec, finished);

        assert_eq!(rec.body, payload);
        assert_eq!(rec.headers[0], b"ICY 200 OK\r\n".to_vec());
        assert!(rec.debug.iter().any(|d| d.starts_with("TLS connection using")));
        let seen = server.join().unwrap().unwrap();
        assert!(seen.starts_with("GET /live HTTP/1.0\r\n"));
    }

    #[test]
    fn verified_tls_rejects_self_signed_certificate() {
        let (port, _server) = serve_tls(b"HTTP/1.0 200 OK\r\n\r\nnever".to_vec());
        let mut lib = HttpMulti::new();
        let mut rec = Recorder::default();
        let mut req = request(&format!("https://127.0.0.1:{port}/"));
        req.verify_tls = true;
        lib.begin(&req).unwrap();
        drive_until(&mut lib, &mut rec, finished);
        assert!(rec.body.is_empty());
        assert!(rec.headers.is_empty());
        assert!(rec.debug.iter().any(|d| d.starts_with(TLS_HANDSHAKE_FAILED)));
    }

    #[test]
    fn handshake_error_text_starts_with_the_marker() {
        let e = HttpError::TlsHandshake(rustls::Error::HandshakeNotComplete);
        assert!(e.to_string().starts_with(TLS_HANDSHAKE_FAILED));
    }

    #[test]
    fn unknown_scheme_is_refused() {
        let mut lib = HttpMulti::new();
        let mut rec = Recorder::default();
        lib.begin(&request("ftp://radio.example/live")).unwrap();
        assert_eq!(lib.drive_timeout(&mut rec).unwrap(), 0);
        assert!(rec.debug.iter().any(|d| d.contains("\"ftp\" not supported")));
        assert_eq!(rec.timers, vec![None]);
    }

    #[tokio::test]
    async fn names_are_resolved_off_the_driving_thread() {
        let payload = body(2000);
        let mut resp = b"HTTP/1.0 200 OK\r\n\r\n".to_vec();
        resp.extend_from_slice(&payload);
        let (port, server) = serve(vec![resp]);

        let mut lib = HttpMulti::new();
        let mut rec = Recorder::default();
        lib.begin(&request(&format!("http://localhost:{port}/"))).unwrap();
        // the first drive only starts the lookup and asks to be polled
        assert_eq!(lib.drive_timeout(&mut rec).unwrap(), 1);
        assert_eq!(rec.timers, vec![Some(RESOLVE_POLL)]);
        assert!(rec.sockets.is_empty());
        assert_eq!(lib.next_timeout().unwrap(), Some(RESOLVE_POLL));

        drive_until(&mut lib, &mut rec, finished);
        assert_eq!(rec.body, payload);
        server.join().unwrap();
    }

    #[test]
    fn name_lookup_needs_a_runtime() {
        let mut lib = HttpMulti::new();
        let mut rec = Recorder::default();
        lib.begin(&request("http://radio.example/live")).unwrap();
        assert_eq!(lib.drive_timeout(&mut rec).unwrap(), 0);
        assert!(rec.debug.iter().any(|d| d.contains("could not resolve host")));
    }

    #[test]
    fn quiet_request_emits_no_diagnostics() {
        let mut resp = b"HTTP/1.0 200 OK\r\n\r\n".to_vec();
        resp.extend_from_slice(&body(100));
        let (port, server) = serve(vec![resp]);
        let mut lib = HttpMulti::new();
        let mut rec = Recorder::default();
        let mut req = request(&format!("http://127.0.0.1:{port}/"));
        req.verbose = false;
        lib.begin(&req).unwrap();
        drive_until(&mut lib, &mut rec, finished);
        assert_eq!(rec.body.len(), 100);
        assert!(rec.debug.is_empty());
        server.join().unwrap();
    }

    #[test]
    fn invalid_url_fails_to_begin() {
        let mut lib = HttpMulti::new();
        assert!(matches!(lib.begin(&request("not a url")), Err(HttpError::InvalidUrl(_))));
        assert_eq!(lib.running_handles(), 0);
    }

    #[test]
    fn paused_write_holds_tail_until_resume() {
        let payload = body(20_000);
        let mut resp = b"HTTP/1.0 200 OK\r\n\r\n".to_vec();
        resp.extend_from_slice(&payload);
        let (port, server) = serve(vec![resp]);

        let mut lib = HttpMulti::new();
        let mut rec = Recorder {
            pause_after: Some(10),
            ..Recorder::default()
        };
        lib.begin(&request(&format!("http://127.0.0.1:{port}/"))).unwrap();
        drive_until(&mut lib, &mut rec, |_, r| !r.body.is_empty());
        assert_eq!(rec.body.len(), 10);

        // nothing moves while paused
        lib.drive_timeout(&mut rec).unwrap();
        assert_eq!(rec.body.len(), 10);
        assert_eq!(lib.running_handles(), 1);

        lib.resume(&mut rec).unwrap();
        drive_until(&mut lib, &mut rec, finished);
        assert_eq!(rec.body, payload);
        server.join().unwrap();
    }

    #[test]
    fn connect_timeout_is_reported_as_a_timer() {
        let (port, server) = serve(vec![b"HTTP/1.0 200 OK\r\n\r\n".to_vec()]);
        let mut lib = HttpMulti::new();
        let mut rec = Recorder::default();
        lib.begin(&request(&format!("http://127.0.0.1:{port}/"))).unwrap();
        lib.drive_timeout(&mut rec).unwrap();
        assert_eq!(rec.timers.first(), Some(&Some(Duration::from_secs(2))));
        drive_until(&mut lib, &mut rec, finished);
        server.join().unwrap();
    }
}
