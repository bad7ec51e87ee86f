//! Engine-log output sink.

use crate::connection::YateClient;
use std::fmt;
use tracing::warn;

/// Line-oriented sink forwarding text to the engine log.
///
/// Each line becomes one `%%>output` command; lines queue with the rest of
/// the outbound traffic and park while the link is down. Errors are
/// swallowed (logging must never take the application down), so this is
/// safe to call from handlers and drop-in log targets.
#[derive(Clone)]
pub struct OutputSink {
    client: YateClient,
}

impl OutputSink {
    /// Create a sink on top of an existing client.
    pub fn new(client: &YateClient) -> Self {
        Self {
            client: client.clone(),
        }
    }

    /// Forward text to the engine log, one command per line.
    pub fn write_line(&self, text: &str) {
        if let Err(e) = self.client.output(text) {
            warn!("engine log line dropped: {}", e);
        }
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSink")
            .field("connected", &self.client.is_connected())
            .finish()
    }
}
