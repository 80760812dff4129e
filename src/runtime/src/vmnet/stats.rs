//! Datapath statistics

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Datapath statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatapathStats {
    /// Packets read from the interface
    pub packets_read: u64,

    /// Payload bytes read from the interface
    pub bytes_read: u64,

    /// Packets written to the interface
    pub packets_written: u64,

    /// Payload bytes written to the interface
    pub bytes_written: u64,

    /// Reads that found nothing to return
    pub read_would_block: u64,

    /// Writes that found no room
    pub write_would_block: u64,

    /// Seconds since the interface started
    pub uptime_seconds: u64,
}

/// Lock-free counters updated on every batch.
pub(crate) struct DatapathCounters {
    packets_read: AtomicU64,
    bytes_read: AtomicU64,
    packets_written: AtomicU64,
    bytes_written: AtomicU64,
    read_would_block: AtomicU64,
    write_would_block: AtomicU64,
    start_time: chrono::DateTime<chrono::Utc>,
}

impl DatapathCounters {
    pub(crate) fn new() -> Self {
        Self {
            packets_read: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            packets_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            read_would_block: AtomicU64::new(0),
            write_would_block: AtomicU64::new(0),
            start_time: chrono::Utc::now(),
        }
    }

    pub(crate) fn record_read(&self, packets: usize, bytes: usize) {
        if packets == 0 {
            self.read_would_block.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.packets_read.fetch_add(packets as u64, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, packets: usize, bytes: usize) {
        if packets == 0 {
            self.write_would_block.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.packets_written.fetch_add(packets as u64, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DatapathStats {
        DatapathStats {
            packets_read: self.packets_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            packets_written: self.packets_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            read_would_block: self.read_would_block.load(Ordering::Relaxed),
            write_would_block: self.write_would_block.load(Ordering::Relaxed),
            uptime_seconds: (chrono::Utc::now() - self.start_time).num_seconds().max(0) as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let counters = DatapathCounters::new();
        counters.record_read(3, 300);
        counters.record_read(0, 0);
        counters.record_write(2, 128);
        counters.record_write(0, 0);
        counters.record_write(0, 0);

        let stats = counters.snapshot();
        assert_eq!(stats.packets_read, 3);
        assert_eq!(stats.bytes_read, 300);
        assert_eq!(stats.read_would_block, 1);
        assert_eq!(stats.packets_written, 2);
        assert_eq!(stats.bytes_written, 128);
        assert_eq!(stats.write_would_block, 2);
    }

    #[test]
    fn test_stats_serialization() {
        let stats = DatapathStats {
            packets_read: 1,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"packets_read\":1"));
        let parsed: DatapathStats = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, stats);
    }
}
