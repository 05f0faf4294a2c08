//! Broker transport that writes a conversation's chunks to stdout.

use async_trait::async_trait;
use quire_orchestrator::{ConnectionId, DisconnectCallback, StreamEvent, Transport, TransportError};
use std::io::Write;
use tokio::sync::Notify;
use tracing::warn;

/// Prints chunk deltas as they arrive and signals once the stream ends.
#[derive(Debug)]
pub struct StdoutTransport {
    quiet: bool,
    finished: Notify,
}

impl StdoutTransport {
    /// A transport that swallows chunks (used with `--json`) but still signals completion.
    pub fn new(quiet: bool) -> Self {
        Self { quiet, finished: Notify::new() }
    }

    /// Resolves after a terminal event has been written.
    pub async fn finished(&self) {
        self.finished.notified().await;
    }

    fn write_event(&self, event: &StreamEvent) -> std::io::Result<()> {
        let mut stdout = std::io::stdout().lock();
        match event {
            StreamEvent::Chunk { delta, .. } if !self.quiet => {
                write!(stdout, "{delta}")?;
                stdout.flush()
            }
            StreamEvent::Complete { .. } if !self.quiet => writeln!(stdout),
            StreamEvent::Error { code, message, .. } => {
                warn!(code = %code, "Stream ended with error: {message}");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for StdoutTransport {
    async fn send(&self, _connection: &ConnectionId, event: &StreamEvent) -> Result<(), TransportError> {
        let written = self.write_event(event);
        if event.is_terminal() {
            // notify_one keeps a permit if nobody is waiting yet.
            self.finished.notify_one();
        }
        written.map_err(|e| TransportError::Send(e.to_string()))
    }

    // The process owns stdout for its whole lifetime, so it never disconnects.
    fn on_disconnect(&self, _connection: &ConnectionId, _callback: DisconnectCallback) {}
}
