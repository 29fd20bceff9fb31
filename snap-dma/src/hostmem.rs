//! Host memory access.
//!
//! The real `snap-rdma` DMA queue moves bytes over an RDMA-capable NIC
//! into host DRAM; the NIC, the PCI link, and host-side memory
//! registration are all external collaborators this core does not own.
//! What the core *does* own is the contract: a write/read is addressed
//! by `(addr, rkey)` or `(addr, lkey)`, and a caller must have
//! registered that memory region first.
//!
//! `HostMemory` is that contract as a capability trait.
//! `SimHostMemory` is the one concrete implementation in this crate: a
//! process-local registry of byte buffers, good enough to drive the
//! queue-pair and virtqueue state machines end to end in tests without
//! a real NIC.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{DmaError, DmaResult};

pub trait HostMemory: Send + Sync {
    fn write(&self, addr: u64, rkey: u32, data: &[u8]) -> DmaResult<()>;
    fn read(&self, addr: u64, rkey: u32, len: usize) -> DmaResult<Vec<u8>>;
    fn read_into(&self, addr: u64, rkey: u32, buf: &mut [u8]) -> DmaResult<()>;
}

struct Region {
    buf: parking_lot::RwLock<Vec<u8>>,
}

/// A software stand-in for registered host memory, keyed by region id
/// (the `rkey`/`lkey` in the real protocol). `addr` is an offset into
/// the region's buffer, matching how the virtqueue code always treats
/// host addresses as opaque 64-bit values paired with a key.
#[derive(Clone, Default)]
pub struct SimHostMemory {
    regions: Arc<RwLock<HashMap<u32, Region>>>,
    next_key: Arc<AtomicU32>,
}

impl SimHostMemory {
    pub fn new() -> Self {
        SimHostMemory {
            regions: Arc::new(RwLock::new(HashMap::new())),
            next_key: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Registers `len` bytes of zeroed host memory and returns the key
    /// a caller would use as both lkey and rkey for it.
    pub fn register(&self, len: usize) -> u32 {
        let key = self.next_key.fetch_add(1, Ordering::SeqCst);
        self.regions.write().unwrap().insert(
            key,
            Region {
                buf: parking_lot::RwLock::new(vec![0u8; len]),
            },
        );
        key
    }

    pub fn deregister(&self, key: u32) {
        self.regions.write().unwrap().remove(&key);
    }

    pub fn region_len(&self, key: u32) -> DmaResult<usize> {
        let regions = self.regions.read().unwrap();
        let region = regions.get(&key).ok_or(DmaError::UnknownKey(key))?;
        let len = region.buf.read().len();
        Ok(len)
    }

    fn check_bounds(region_len: u64, addr: u64, len: u64) -> DmaResult<()> {
        if addr.checked_add(len).map(|e| e > region_len).unwrap_or(true) {
            return Err(DmaError::OutOfBounds {
                    offset: addr,
                    len,
                    region_size: region_len,
            });
        }
        Ok(())
    }
}

impl HostMemory for SimHostMemory {
    fn write(&self, addr: u64, rkey: u32, data: &[u8]) -> DmaResult<()> {
        let regions = self.regions.read().unwrap();
        let region = regions.get(&rkey).ok_or(DmaError::UnknownKey(rkey))?;
        let mut buf = region.buf.write();
        Self::check_bounds(buf.len() as u64, addr, data.len() as u64)?;
        let start = addr as usize;
        buf[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, addr: u64, rkey: u32, len: usize) -> DmaResult<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read_into(addr, rkey, &mut out)?;
        Ok(out)
    }

    fn read_into(&self, addr: u64, rkey: u32, out: &mut [u8]) -> DmaResult<()> {
        let regions = self.regions.read().unwrap();
        let region = regions.get(&rkey).ok_or(DmaError::UnknownKey(rkey))?;
        let buf = region.buf.read();
        Self::check_bounds(buf.len() as u64, addr, out.len() as u64)?;
        let start = addr as usize;
        out.copy_from_slice(&buf[start..start + out.len()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips() {
        let mem = SimHostMemory::new();
        let key = mem.register(64);
        mem.write(8, key, b"hello").unwrap();
        let back = mem.read(8, key, 5).unwrap();
        assert_eq!(&back, b"hello");
    }

    #[test]
    fn out_of_bounds_rejected() {
        let mem = SimHostMemory::new();
        let key = mem.register(8);
        assert!(matches!(
                mem.write(4, key, &[0u8; 8]),
                Err(DmaError::OutOfBounds {.. })
        ));
    }

    #[test]
    fn unknown_key_rejected() {
        let mem = SimHostMemory::new();
        assert!(matches!(mem.read(0, 999, 1), Err(DmaError::UnknownKey(999))));
    }
}
