//! Zero-copy fake-address table.
//!
//! When a backend advertises `is_zcopy_aligned`, a command skips the
//! intermediate buffer: the backend is handed a synthetic contiguous
//! address range and calls back into `get_cmd_addr` to translate it to
//! the true host descriptor address when it needs to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Key identifying one in-flight command's fake address range:
/// `(controller_id, queue_id, command_id)`.
pub type FakeIovKey = (u32, u32, u32);

struct Mapping {
    base: u64,
    /// cumulative length of each descriptor, in order, so an offset
    /// into the fake range can be mapped back to `(descriptor_index,
    /// offset_within_descriptor)`.
    descriptor_lens: Vec<u32>,
    true_addrs: Vec<u64>,
}

/// Per-controller fake-address table.
pub struct FakeIovTable {
    next_base: AtomicU64,
    mappings: RwLock<HashMap<FakeIovKey, Mapping>>,
}

impl FakeIovTable {
    /// `base_region_size` is the size of the fake address space carved
    /// out for each command; it must be larger than the largest request
    /// this controller will ever zero-copy.
    const REGION_SIZE: u64 = 1 << 40;

    pub fn new() -> Self {
        FakeIovTable {
            // Start fake addresses far from any real pointer value so a
            // caller can immediately tell a fake address from a real one.
            next_base: AtomicU64::new(0xFFFF_0000_0000_0000),
            mappings: RwLock::new(HashMap::new()),
        }
    }

    /// Registers the descriptor chain for `key` and returns, per
    /// descriptor, the fake `iov_base` the backend should be given.
    pub fn register(&self, key: FakeIovKey, true_addrs: Vec<u64>, lens: Vec<u32>) -> Vec<u64> {
        let base = self.next_base.fetch_add(Self::REGION_SIZE, Ordering::SeqCst);
        let mut fake_bases = Vec::with_capacity(lens.len());
        let mut cursor = 0u64;
        for len in &lens {
            fake_bases.push(base + cursor);
            cursor += *len as u64;
        }
        self.mappings.write().unwrap().insert(
            key,
            Mapping { base, descriptor_lens: lens, true_addrs },
        );
        fake_bases
    }

    pub fn unregister(&self, key: &FakeIovKey) {
        self.mappings.write().unwrap().remove(key);
    }

    /// Maps a `(fake_base, offset)` pair back to the true host
    /// descriptor address the backend actually wants to touch.
    pub fn get_cmd_addr(&self, key: &FakeIovKey, fake_addr: u64, len: u32) -> Option<u64> {
        let mappings = self.mappings.read().unwrap();
        let mapping = mappings.get(key)?;
        if fake_addr < mapping.base {
            return None;
        }
        let mut offset = fake_addr - mapping.base;
        for (i, dlen) in mapping.descriptor_lens.iter().enumerate() {
            if offset < *dlen as u64 {
                if offset + len as u64 > *dlen as u64 {
                    return None; // would span descriptors; caller must split
                }
                return Some(mapping.true_addrs[i] + offset);
            }
            offset -= *dlen as u64;
        }
        None
    }
}

impl Default for FakeIovTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_fake_offsets_back_to_true_addresses() {
        let table = FakeIovTable::new();
        let key = (1, 2, 3);
        let fakes = table.register(key, vec![0x2000, 0x5000], vec![512, 256]);
        assert_eq!(table.get_cmd_addr(&key, fakes[0], 100), Some(0x2000));
        assert_eq!(table.get_cmd_addr(&key, fakes[0] + 10, 50), Some(0x2000 + 10));
        assert_eq!(table.get_cmd_addr(&key, fakes[1], 100), Some(0x5000));
        table.unregister(&key);
        assert_eq!(table.get_cmd_addr(&key, fakes[0], 1), None);
    }

    #[test]
    fn rejects_access_spanning_descriptor_boundary() {
        let table = FakeIovTable::new();
        let key = (1, 1, 1);
        let fakes = table.register(key, vec![0x1000, 0x2000], vec![64, 64]);
        assert_eq!(table.get_cmd_addr(&key, fakes[0] + 32, 64), None);
    }
}
