//! Traffic counters

use serde::Serialize;

/// Per-handle traffic counters
///
/// A chunk is one complete protocol message: the handshake flags, an option
/// request or reply, a command request with its payload, a simple reply with
/// its payload, or a single structured reply chunk. Counters only grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Bytes written to the transport
    pub bytes_sent: u64,
    /// Messages written to the transport
    pub chunks_sent: u64,
    /// Bytes read from the transport
    pub bytes_received: u64,
    /// Messages read from the transport
    pub chunks_received: u64,
}

impl Stats {
    pub(crate) fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    pub(crate) fn record_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }

    pub(crate) fn chunk_sent(&mut self) {
        self.chunks_sent += 1;
    }

    pub(crate) fn chunk_received(&mut self) {
        self.chunks_received += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let stats = Stats::default();
        assert_eq!(stats.bytes_sent, 0);
        assert_eq!(stats.chunks_received, 0);
    }

    #[test]
    fn test_serializes_all_counters() {
        let mut stats = Stats::default();
        stats.record_sent(28);
        stats.chunk_sent();
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["bytes_sent"], 28);
        assert_eq!(json["chunks_sent"], 1);
        assert_eq!(json["bytes_received"], 0);
    }
}
