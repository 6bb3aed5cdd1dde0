//! Verbose library output: logged at trace level and scanned for TLS handshake failures.

use crate::library::DebugKind;

/// Diagnostic emitted by GnuTLS when a plain-HTTP server answers a TLS client.
pub const DEFAULT_HANDSHAKE_ERROR_PATTERN: &str =
    "gnutls_handshake() failed: An unexpected TLS packet was received";

/// Sticky detector for handshake failures in diagnostic text.
#[derive(Debug, Clone)]
pub struct HandshakeDetector {
    pattern: Vec<u8>,
    found: bool,
}

impl HandshakeDetector {
    /// An empty pattern disables detection.
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.as_bytes().to_vec(),
            found: false,
        }
    }

    pub fn found(&self) -> bool {
        self.found
    }

    pub fn reset(&mut self) {
        self.found = false;
    }

    pub fn inspect(&mut self, kind: DebugKind, text: &[u8]) {
        match kind {
            DebugKind::Text | DebugKind::HeaderIn | DebugKind::HeaderOut => {
                tracing::trace!(kind = ?kind, "{}", String::from_utf8_lossy(text).trim_end());
                if self.matches(text) {
                    self.found = true;
                }
            }
            DebugKind::DataIn | DebugKind::DataOut => {}
        }
    }

    fn matches(&self, text: &[u8]) -> bool {
        let n = self.pattern.len();
        n > 0 && text.len() >= n && text[..n].eq_ignore_ascii_case(&self.pattern)
    }
}

impl Default for HandshakeDetector {
    fn default() -> Self {
        Self::new(DEFAULT_HANDSHAKE_ERROR_PATTERN)
    }
}
