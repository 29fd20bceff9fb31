//! Firmware virtqueue vtable.
//!
//! The controller drives queues through this trait instead of holding a
//! `Vec<Virtqueue<M>>` directly: `Virtqueue<M>` is generic over its host
//! memory handle, so a controller that needs to own queues of more than
//! one concrete type (or swap in a mock for tests) has to go through an
//! object-safe seam.

use snap_dma::HostMemory;
use snap_virtq::Virtqueue;

pub trait FwVirtq: Send {
    fn id(&self) -> u32;
    fn pg_id(&self) -> u32;
    fn suspend(&mut self);
    fn resume(&mut self);
    fn has_outstanding(&self) -> bool;
    /// Drives one progress pass. Errors are not propagated: a queue that
    /// hits a fatal condition reports it through `is_fatal` instead, so
    /// the controller can keep progressing its siblings.
    fn progress(&mut self);
    fn is_fatal(&self) -> bool;
    fn hw_used_index(&self) -> u16;
    fn ctrl_used_index(&self) -> u16;
    fn hw_available_index(&self) -> u16;
    fn ctrl_available_index(&self) -> u16;
}

impl<M: HostMemory + Send> FwVirtq for Virtqueue<M> {
    fn id(&self) -> u32 {
        self.id
    }

    fn pg_id(&self) -> u32 {
        self.pg_id
    }

    fn suspend(&mut self) {
        Virtqueue::suspend(self)
    }

    fn resume(&mut self) {
        Virtqueue::resume(self)
    }

    fn has_outstanding(&self) -> bool {
        Virtqueue::has_outstanding(self)
    }

    fn progress(&mut self) {
        if let Err(e) = Virtqueue::progress(self) {
            log::error!("virtq {} progress failed: {}", self.id, e);
        }
    }

    fn is_fatal(&self) -> bool {
        Virtqueue::is_fatal(self)
    }

    fn hw_used_index(&self) -> u16 {
        Virtqueue::hw_used_index(self)
    }

    fn ctrl_used_index(&self) -> u16 {
        Virtqueue::ctrl_used_index(self)
    }

    fn hw_available_index(&self) -> u16 {
        Virtqueue::hw_available_index(self)
    }

    fn ctrl_available_index(&self) -> u16 {
        Virtqueue::ctrl_available_index(self)
    }
}
