//! Consumer side: a fixed pool of output buffers written to a file or stdout,
//! plus stream information gathered from the response headers.

use std::fmt;
use std::io::{self, Write};

use tracing::{debug, info, warn};
use urltrans_core::{BufferCallbacks, InfoCallbacks, OutputBuffer};

use crate::config::Config;

/// Audio coding inferred from `Content-Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCoding {
    Mp3,
    Aac,
    Ogg,
    Opus,
    Flac,
}

impl AudioCoding {
    pub fn from_content_type(value: &str) -> Option<Self> {
        let mime = value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
        match mime.as_str() {
            "audio/mpeg" | "audio/mp3" | "audio/mpeg3" | "audio/x-mpeg" => Some(AudioCoding::Mp3),
            "audio/aac" | "audio/aacp" | "audio/x-aac" => Some(AudioCoding::Aac),
            "application/ogg" | "audio/ogg" | "audio/x-ogg" | "audio/vorbis" => Some(AudioCoding::Ogg),
            "audio/opus" => Some(AudioCoding::Opus),
            "audio/flac" | "audio/x-flac" => Some(AudioCoding::Flac),
            _ => None,
        }
    }
}

impl fmt::Display for AudioCoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AudioCoding::Mp3 => "mp3",
            AudioCoding::Aac => "aac",
            AudioCoding::Ogg => "ogg",
            AudioCoding::Opus => "opus",
            AudioCoding::Flac => "flac",
        };
        f.write_str(s)
    }
}

/// What the response headers told us about the stream.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub content_type: Option<String>,
    pub coding: Option<AudioCoding>,
    pub station: Option<String>,
    pub genre: Option<String>,
    pub bitrate_kbps: Option<u32>,
}

pub struct Sink {
    out: Box<dyn Write>,
    free: Vec<OutputBuffer>,
    written: u64,
    write_error: Option<io::Error>,
    failed: bool,
    info: StreamInfo,
    probe_bytes: Option<usize>,
    seen: usize,
    auto_reconnect: bool,
    max_reconnects: u32,
    reconnects: u32,
    finished: bool,
}

impl Sink {
    pub fn new(out: Box<dyn Write>, cfg: &Config, probe_bytes: Option<usize>) -> Self {
        let free = (0..cfg.buffer_count.max(1))
            .map(|_| OutputBuffer::with_capacity(cfg.buffer_size.max(1)))
            .collect();
        Self {
            out,
            free,
            written: 0,
            write_error: None,
            failed: false,
            info: StreamInfo::default(),
            probe_bytes,
            seen: 0,
            auto_reconnect: cfg.auto_reconnect,
            max_reconnects: cfg.max_reconnects,
            reconnects: 0,
            finished: false,
        }
    }

    /// No more data is wanted.
    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn take_error(&mut self) -> Option<io::Error> {
        self.write_error.take()
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    fn record_header(&mut self, name: &str, value: &str) {
        match name.to_ascii_lowercase().as_str() {
            "content-type" => {
                self.info.content_type = Some(value.to_string());
                self.info.coding = AudioCoding::from_content_type(value);
                match self.info.coding {
                    Some(coding) => info!(%coding, content_type = value, "stream coding detected"),
                    None => warn!(content_type = value, "unrecognised stream content type"),
                }
            }
            "icy-name" => {
                info!(station = value, "station");
                self.info.station = Some(value.to_string());
            }
            "icy-genre" => self.info.genre = Some(value.to_string()),
            "icy-br" => self.info.bitrate_kbps = value.split(',').next().and_then(|v| v.trim().parse().ok()),
            _ => {}
        }
    }
}

impl BufferCallbacks for Sink {
    fn buffer_emptied(&mut self) -> Option<OutputBuffer> {
        if self.failed {
            return None;
        }
        self.free.pop()
    }

    fn buffer_filled(&mut self, mut buffer: OutputBuffer) {
        if let Err(e) = self.out.write_all(buffer.filled()) {
            self.write_error.get_or_insert(e);
            self.failed = true;
            self.finished = true;
        } else {
            self.written += buffer.len() as u64;
        }
        buffer.clear();
        self.free.push(buffer);
    }
}

impl InfoCallbacks for Sink {
    fn on_header(&mut self, line: &[u8]) {
        // the server answered; the retry budget starts over
        self.reconnects = 0;
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end();
        debug!(header = line, "response header");
        if let Some((name, value)) = line.split_once(':') {
            self.record_header(name.trim(), value.trim());
        }
    }

    fn on_data(&mut self, chunk: &[u8]) -> bool {
        let Some(limit) = self.probe_bytes else {
            return false;
        };
        let before = self.seen;
        self.seen += chunk.len();
        if before >= limit {
            self.finished = true;
            return true;
        }
        false
    }

    fn on_connection_lost(&mut self) -> bool {
        if self.finished || !self.auto_reconnect {
            self.finished = true;
            return false;
        }
        if self.max_reconnects > 0 && self.reconnects >= self.max_reconnects {
            warn!(attempts = self.reconnects, "giving up on reconnection");
            self.finished = true;
            return false;
        }
        self.reconnects += 1;
        true
    }
}
