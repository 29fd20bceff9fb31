use std::sync::atomic::{AtomicU64, Ordering};

/// Per-queue I/O statistics.
#[derive(Debug, Default)]
pub struct VirtqStats {
    pub ops_completed: AtomicU64,
    pub ops_failed: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl VirtqStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, bytes_in: u64, bytes_out: u64) {
        self.ops_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.ops_failed.fetch_add(1, Ordering::Relaxed);
    }
}
