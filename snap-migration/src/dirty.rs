//! Dirty-page map: a growable bitmap, snapshotted on
//! `GET_LOG_SZ` and drained to the host on `REPORT_LOG`, and the
//! `DirtyPageSink` implementation that lets `snap-virtq` feed it.

use parking_lot::Mutex;
use snap_util::bitmap::GrowableBitmap;
use snap_virtq::DirtyPageSink;

/// Per-command `mark_dirty(pa, len)`:
/// `start_page = pa / page_size`, `end_page = ceil((pa+len)/page_size)`,
/// set every bit in `[start_page, end_page)`. Growth is handled by
/// `GrowableBitmap::set` itself.
pub struct DirtyPageMap {
    page_size: u32,
    bitmap: Mutex<GrowableBitmap>,
    logging: std::sync::atomic::AtomicBool,
}

impl DirtyPageMap {
    pub fn new(page_size: u32) -> Self {
        assert!(snap_util::is_pow2(page_size as u64), "page_size must be a power of two");
        DirtyPageMap {
            page_size,
            bitmap: Mutex::new(GrowableBitmap::new()),
            logging: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn start(&self) {
        self.logging.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn stop(&self) {
        self.logging.store(false, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_logging(&self) -> bool {
        self.logging.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn mark_dirty(&self, pa: u64, len: u32) {
        if !self.is_logging() || len == 0 {
            return;
        }
        let start_page = pa / self.page_size as u64;
        let end_page = (pa + len as u64 + self.page_size as u64 - 1) / self.page_size as u64;
        let mut bitmap = self.bitmap.lock();
        for page in start_page..end_page {
            bitmap.set(page);
        }
    }

    /// `GET_LOG_SZ`: snapshots and clears the live bitmap up to its
    /// high-water mark, returning the byte length the snapshot will
    /// occupy on the wire.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bitmap.lock().snapshot_and_clear()
    }
}

impl DirtyPageSink for DirtyPageMap {
    fn mark_dirty(&self, physical_addr: u64, len: u32) {
        DirtyPageMap::mark_dirty(self, physical_addr, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_dirty_is_noop_until_started() {
        let map = DirtyPageMap::new(4096);
        map.mark_dirty(0, 4096);
        assert_eq!(map.snapshot(), Vec::<u8>::new());
    }

    #[test]
    fn mark_dirty_spans_page_boundary() {
        let map = DirtyPageMap::new(4096);
        map.start();
        map.mark_dirty(4000, 200); // spans page 0 and page 1
        let snap = map.snapshot();
        assert!(snap[0] & 0b11 != 0);
    }

    #[test]
    fn snapshot_clears_state() {
        let map = DirtyPageMap::new(4096);
        map.start();
        map.mark_dirty(0, 1);
        let first = map.snapshot();
        assert!(!first.is_empty());
        let second = map.snapshot();
        assert!(second.is_empty());
    }
}
