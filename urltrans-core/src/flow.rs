//! Backpressure: what happens to each chunk the library writes, and how the
//! ring is emptied into consumer buffers.

use tracing::{debug, error, trace};

use crate::collaborator::SessionHost;
use crate::library::WriteOutcome;
use crate::session::{Engine, TransferState};

impl<H: SessionHost> Engine<H> {
    /// Data-arrival callback.
    ///
    /// While the watermark is armed the ring accumulates. The first time the
    /// buffered plus incoming bytes reach half the watermark base, the base
    /// collapses to zero, the ring is drained and the chunk goes straight to
    /// consumer buffers. From then on every chunk is queued. A chunk that would
    /// push the ring past the soft cap is taken only up to the cap and the
    /// transfer pauses; the library keeps the tail.
    pub(crate) fn on_data_arrived(&mut self, host: &mut H, chunk: &[u8]) -> WriteOutcome {
        self.state = TransferState::Transferring;

        if host.on_data(chunk) {
            self.pause_transfer(host);
            return WriteOutcome::Paused { consumed: 0 };
        }

        let mut rest = chunk;
        if self.internal_buffer_size_initial > 0
            && self.ring.available() + rest.len() >= self.internal_buffer_size_initial / 2
        {
            debug!(session = %self.id, available = self.ring.available(), incoming = rest.len(), "watermark reached");
            self.internal_buffer_size_initial = 0;
            self.drain(host);
            // ordering: only bypass the ring once it is empty
            if self.ring.is_empty() {
                rest = self.deliver_direct(host, rest);
            }
        }
        if rest.is_empty() {
            return WriteOutcome::Accepted;
        }

        let cap = self.soft_cap();
        let available = self.ring.available();
        if available + rest.len() > cap {
            let room = cap.saturating_sub(available).min(rest.len());
            let pushed = self.ring.push(&rest[..room]);
            let consumed = chunk.len() - rest.len() + pushed;
            debug!(
                session = %self.id,
                available = self.ring.available(),
                cap,
                held = chunk.len() - consumed,
                "buffer full, pausing transfer"
            );
            self.pause_transfer(host);
            return WriteOutcome::Paused { consumed };
        }

        let pushed = self.ring.push(rest);
        if pushed < rest.len() {
            error!(
                session = %self.id,
                pushed,
                dropped = rest.len() - pushed,
                "ring accepted fewer bytes than offered"
            );
        }
        WriteOutcome::Accepted
    }

    /// Move buffered bytes into consumer buffers until either runs out.
    pub(crate) fn drain(&mut self, host: &mut H) {
        while !self.ring.is_empty() {
            let Some(mut buf) = host.buffer_emptied() else {
                break;
            };
            let mut copied = 0;
            while buf.spare() > 0 && !self.ring.is_empty() {
                let n = buf.fill_from(self.ring.peek_contiguous());
                self.ring.advance(n);
                copied += n;
            }
            trace!(session = %self.id, copied, left = self.ring.available(), "buffer filled from ring");
            host.buffer_filled(buf);
            if copied == 0 {
                break;
            }
        }
    }

    fn deliver_direct<'c>(&mut self, host: &mut H, mut rest: &'c [u8]) -> &'c [u8] {
        while !rest.is_empty() {
            let Some(mut buf) = host.buffer_emptied() else {
                break;
            };
            let n = buf.fill_from(rest);
            rest = &rest[n..];
            host.buffer_filled(buf);
            if n == 0 {
                break;
            }
        }
        rest
    }

    fn pause_transfer(&mut self, host: &mut H) {
        let mut result = self.io.stop(host);
        if result.is_ok() {
            result = self.transfer_timer.stop(host);
        }
        self.defer(result);
        self.state = TransferState::Paused;
    }
}
