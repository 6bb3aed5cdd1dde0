//! Connection loss and fixed-interval reconnection.

use tracing::{debug, info, warn};

use crate::collaborator::SessionHost;
use crate::library::TransferLibrary;
use crate::session::{Engine, SessionError, TransferSession, TransferState};

impl<H: SessionHost> Engine<H> {
    /// Runs whenever a drive reports zero running transfers.
    pub(crate) fn connection_lost(&mut self, host: &mut H) -> Result<(), SessionError> {
        self.transfer_timer.stop(host)?;
        self.state = TransferState::Stopped;
        self.drain(host);
        let auto_reconnect = host.on_connection_lost();
        self.internal_buffer_size_initial = self.internal_buffer_size;
        if auto_reconnect {
            let every = self.reconnect_interval;
            self.reconnect_timer.start(host, every, Some(every))?;
        } else {
            self.reconnect_timer.stop(host)?;
        }
        info!(
            session = %self.id,
            uri = %self.uri,
            buffered = self.ring.available(),
            auto_reconnect,
            "connection lost"
        );
        Ok(())
    }

    /// A header line means the server answered; stop retrying.
    pub(crate) fn on_header_line(&mut self, host: &mut H, line: &[u8]) {
        let result = self.reconnect_timer.stop(host);
        self.defer(result);
        host.on_header(line);
    }
}

impl<L: TransferLibrary + 'static, H: SessionHost> TransferSession<L, H> {
    /// Every tick replaces whatever attempt is in flight; only a header line
    /// or `cancel` stops the cycle.
    pub(crate) fn on_reconnect_timer(&mut self, host: &mut H) -> Result<(), SessionError> {
        if self.engine.state == TransferState::Transferring {
            debug!(session = %self.engine.id, "previous attempt got no answer, starting over");
        }
        info!(
            session = %self.engine.id,
            uri = %self.engine.uri,
            every = ?self.engine.reconnect_interval,
            "reconnecting"
        );
        self.library.detach();
        self.engine.io.destroy(host);
        if let Err(e) = self.begin_transfer() {
            warn!(session = %self.engine.id, error = %e, "reconnect attempt failed to begin");
            return Ok(());
        }
        let running = self.kickstart(host)?;
        if running == 0 {
            self.engine.connection_lost(host)?;
        }
        Ok(())
    }
}
