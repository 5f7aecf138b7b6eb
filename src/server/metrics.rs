//! Server metrics collection.
//!
//! Aggregate counters across all connections. Destinations are never
//! recorded here; per-connection detail lives in the stats snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server metrics collector.
pub struct ServerMetrics {
    /// Server creation time
    start_time: Instant,
    /// Total connections accepted
    total_connections: AtomicU64,
    /// Current active connections
    active_connections: AtomicU64,
    /// Connections that reached the relay phase
    relayed_connections: AtomicU64,
    /// Bytes relayed client → target
    bytes_in: AtomicU64,
    /// Bytes relayed target → client
    bytes_out: AtomicU64,
    /// Greetings or requests that failed to parse or negotiate
    handshake_errors: AtomicU64,
    /// Targets that could not be reached
    dial_failures: AtomicU64,
    /// BIND / UDP ASSOCIATE requests turned away
    rejected_commands: AtomicU64,
}

impl ServerMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            relayed_connections: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            handshake_errors: AtomicU64::new(0),
            dial_failures: AtomicU64::new(0),
            rejected_commands: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections.
    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections.
    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Increment relayed connection count.
    pub fn increment_relayed(&self) {
        self.relayed_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Add bytes to the client → target counter.
    pub fn add_bytes_in(&self, bytes: u64) {
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add bytes to the target → client counter.
    pub fn add_bytes_out(&self, bytes: u64) {
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Increment handshake error count.
    pub fn increment_handshake_errors(&self) {
        self.handshake_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment dial failure count.
    pub fn increment_dial_failures(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment rejected command count.
    pub fn increment_rejected_commands(&self) {
        self.rejected_commands.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get total connections.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Get active connections.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get relayed connections.
    pub fn relayed_connections(&self) -> u64 {
        self.relayed_connections.load(Ordering::Relaxed)
    }

    /// Get total bytes relayed client → target.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Get total bytes relayed target → client.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            relayed_connections: self.relayed_connections(),
            bytes_in: self.bytes_in(),
            bytes_out: self.bytes_out(),
            handshake_errors: self.handshake_errors.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            rejected_commands: self.rejected_commands.load(Ordering::Relaxed),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let snapshot = self.snapshot();

        format!(
            r#"SOCKS5 Relay Metrics
====================
Uptime: {} seconds

Connections:
  Total:    {}
  Active:   {}
  Relayed:  {}

Traffic:
  In:  {} bytes
  Out: {} bytes

Errors:
  Handshake Errors:  {}
  Dial Failures:     {}
  Rejected Commands: {}
"#,
            snapshot.uptime_secs,
            snapshot.total_connections,
            snapshot.active_connections,
            snapshot.relayed_connections,
            snapshot.bytes_in,
            snapshot.bytes_out,
            snapshot.handshake_errors,
            snapshot.dial_failures,
            snapshot.rejected_commands,
        )
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_connections: u64,
    pub active_connections: u64,
    pub relayed_connections: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub handshake_errors: u64,
    pub dial_failures: u64,
    pub rejected_commands: u64,
}

impl MetricsSnapshot {
    /// Share of accepted connections that reached the relay phase.
    pub fn relay_rate(&self) -> f64 {
        if self.total_connections == 0 {
            0.0
        } else {
            self.relayed_connections as f64 / self.total_connections as f64
        }
    }

    /// Calculate connections per second.
    pub fn connections_per_second(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            self.total_connections as f64 / self.uptime_secs as f64
        }
    }

    /// Calculate throughput in bytes per second.
    pub fn throughput_bps(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            (self.bytes_in + self.bytes_out) as f64 / self.uptime_secs as f64
        }
    }
}
