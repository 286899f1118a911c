//! Diagnostics for semantic anomalies (spec §7 category 4): conditions that are skipped and
//! warned about, rather than aborting the whole decode.

use dump_utils::HexDump;

/// Accumulates non-fatal anomalies encountered during a decode, and logs each one through
/// `tracing` as it is recorded.
#[derive(Default)]
pub struct Diags {
    messages: Vec<String>,
}

impl Diags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a semantic anomaly: the offending record is skipped and decoding continues.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{message}");
        self.messages.push(message);
    }

    /// Like [`Self::warn`], but also logs a hex dump of the offending bytes at `trace` level.
    pub fn warn_with_bytes(&mut self, message: impl Into<String>, bytes: &[u8]) {
        let message = message.into();
        tracing::warn!("{message}");
        tracing::trace!("{:?}", HexDump::new(bytes).max(256));
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }
}
