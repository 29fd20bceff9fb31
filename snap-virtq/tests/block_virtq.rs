//! End-to-end virtio-blk scenarios driven through `Virtqueue`: descriptor chain -> DMA fetch -> backend call ->
//! status write -> tunnel completion.

use std::sync::{Arc, Mutex};

use snap_dma::{DmaQueue, DmaQueueConfig, HostMemory, SimHostMemory};
use snap_virtq::{
    BackendCompletion, BackendStatus, BlockBackend, IoSegment, QueueKind, VirtqAttrs, Virtqueue,
    VqState, VIRTIO_BLK_S_IOERR, VIRTIO_BLK_S_OK, VIRTIO_BLK_S_UNSUPP, SCRATCH_SLOT_SIZE,
};

const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;
const VIRTIO_BLK_T_GET_ID: u32 = 8;

const VRING_DESC_F_NEXT: u16 = 1;
const VRING_DESC_F_WRITE: u16 = 2;

const DESC_TABLE_ADDR: u64 = 0;
const HEADER_ADDR: u64 = 1_000;
const DATA_ADDR: u64 = 2_000;
const STATUS_ADDR: u64 = 16_000;
const QUEUE_SIZE: u16 = 16;

struct MemBlockBackend {
    mem: SimHostMemory,
    disk: Mutex<Vec<u8>>,
    name: String,
}

impl MemBlockBackend {
    fn new(mem: SimHostMemory, disk_size: usize) -> Self {
        MemBlockBackend { mem, disk: Mutex::new(vec![0u8; disk_size]), name: "test0".to_string() }
    }
}

impl BlockBackend for MemBlockBackend {
    fn read(&self, iov: &[IoSegment], offset: u64, len: u32, _pg_id: u32, cb: BackendCompletion) {
        let disk = self.disk.lock().unwrap();
        let start = offset as usize;
        let slice = &disk[start..start + len as usize];
        match self.mem.write(iov[0].addr, iov[0].rkey, slice) {
            Ok(()) => cb(BackendStatus::Success),
            Err(_) => cb(BackendStatus::IoError),
        }
    }

    fn write(&self, iov: &[IoSegment], offset: u64, len: u32, _pg_id: u32, cb: BackendCompletion) {
        let data = match self.mem.read(iov[0].addr, iov[0].rkey, len as usize) {
            Ok(d) => d,
            Err(_) => return cb(BackendStatus::IoError),
        };
        let mut disk = self.disk.lock().unwrap();
        let start = offset as usize;
        disk[start..start + data.len()].copy_from_slice(&data);
        cb(BackendStatus::Success);
    }

    fn flush(&self, _pg_id: u32, cb: BackendCompletion) {
        cb(BackendStatus::Success);
    }

    fn discard(&self, _offset: u64, _len: u32, _pg_id: u32, cb: BackendCompletion) {
        cb(BackendStatus::Success);
    }

    fn write_zeroes(&self, _offset: u64, _len: u32, _pg_id: u32, cb: BackendCompletion) {
        cb(BackendStatus::Success);
    }

    fn num_blocks(&self) -> u64 {
        self.disk.lock().unwrap().len() as u64 / 512
    }

    fn block_size(&self) -> u32 {
        512
    }

    fn bdev_name(&self) -> &str {
        &self.name
    }
}

struct Harness {
    mem: SimHostMemory,
    guest_key: u32,
    vq: Virtqueue<SimHostMemory>,
}

fn blk_header(req_type: u32, sector: u64) -> [u8; 16] {
    let mut h = [0u8; 16];
    h[0..4].copy_from_slice(&req_type.to_le_bytes());
    h[8..16].copy_from_slice(&sector.to_le_bytes());
    h
}

fn write_desc(mem: &SimHostMemory, key: u32, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
    let mut d = [0u8; 16];
    d[0..8].copy_from_slice(&addr.to_le_bytes());
    d[8..12].copy_from_slice(&len.to_le_bytes());
    d[12..14].copy_from_slice(&flags.to_le_bytes());
    d[14..16].copy_from_slice(&next.to_le_bytes());
    mem.write(idx as u64 * 16, key, &d).unwrap();
}

/// Lays out a standard 3-descriptor block chain: header (ro) -> data
/// (`data_flags`) -> status (writable). Returns the harness with the
/// chain already written to guest memory, ready for `arrival`.
fn harness_with_chain(req_type: u32, sector: u64, data_len: u32, data_flags: u16) -> Harness {
    let mem = SimHostMemory::new();
    let guest_key = mem.register(1 << 20);
    let scratch_key = mem.register(QUEUE_SIZE as usize * SCRATCH_SLOT_SIZE as usize);

    mem.write(HEADER_ADDR, guest_key, &blk_header(req_type, sector)).unwrap();
    write_desc(&mem, guest_key, 0, HEADER_ADDR, 16, VRING_DESC_F_NEXT, 1);
    write_desc(&mem, guest_key, 1, DATA_ADDR, data_len, data_flags | VRING_DESC_F_NEXT, 2);
    write_desc(&mem, guest_key, 2, STATUS_ADDR, 1, VRING_DESC_F_WRITE, 0);

    let dma = DmaQueue::create(DmaQueueConfig::default(), mem.clone(), false, false);
    let backend = Arc::new(MemBlockBackend::new(mem.clone(), 1 << 20));
    let attrs = VirtqAttrs {
        desc_table_addr: DESC_TABLE_ADDR,
        device_addr: 100_000,
        size: QUEUE_SIZE,
        msix_vector: 0,
        dma_mkey: guest_key,
    };
    let vq = Virtqueue::new_block(0, 0, attrs, false, false, dma, scratch_key, backend, None);
    Harness { mem, guest_key, vq }
}

fn drain(h: &mut Harness) {
    let mut spins = 0;
    while h.vq.has_outstanding() {
        h.vq.progress().unwrap();
        spins += 1;
        assert!(spins < 1000, "virtqueue command never released");
    }
}

#[test]
fn block_write_4kib() {
    let mut h = harness_with_chain(VIRTIO_BLK_T_OUT, 0, 4096, 0);
    let payload = vec![0xABu8; 4096];
    h.mem.write(DATA_ADDR, h.guest_key, &payload).unwrap();

    h.vq.arrival(0, 3).unwrap();
    drain(&mut h);

    let status = h.mem.read(STATUS_ADDR, h.guest_key, 1).unwrap();
    assert_eq!(status[0], VIRTIO_BLK_S_OK);
    assert_eq!(h.vq.ctrl_used_index(), 1);
    assert_eq!(h.vq.stats().ops_completed.load(std::sync::atomic::Ordering::Relaxed), 1);
}

#[test]
fn block_read_4kib() {
    let mut h = harness_with_chain(VIRTIO_BLK_T_IN, 0, 4096, VRING_DESC_F_WRITE);
    // Poison the guest's data area first so a passing test proves the
    // backend's (zeroed) sector actually overwrote it, not that nothing
    // ran.
    h.mem.write(DATA_ADDR, h.guest_key, &vec![0xFFu8; 4096]).unwrap();

    h.vq.arrival(0, 3).unwrap();
    drain(&mut h);

    let status = h.mem.read(STATUS_ADDR, h.guest_key, 1).unwrap();
    assert_eq!(status[0], VIRTIO_BLK_S_OK);
    let data = h.mem.read(DATA_ADDR, h.guest_key, 4096).unwrap();
    assert_eq!(data, vec![0u8; 4096]);
}

#[test]
fn block_get_id() {
    let mut h = harness_with_chain(VIRTIO_BLK_T_GET_ID, 0, 20, VRING_DESC_F_WRITE);
    h.vq.arrival(0, 3).unwrap();
    drain(&mut h);

    let status = h.mem.read(STATUS_ADDR, h.guest_key, 1).unwrap();
    assert_eq!(status[0], VIRTIO_BLK_S_OK);
    let id = h.mem.read(DATA_ADDR, h.guest_key, 20).unwrap();
    assert!(id.starts_with(b"test0"));
}

#[test]
fn block_flush_with_nonzero_sector_is_rejected() {
    let mut h = harness_with_chain(VIRTIO_BLK_T_FLUSH, 7, 0, 0);
    h.vq.arrival(0, 3).unwrap();
    drain(&mut h);

    let status = h.mem.read(STATUS_ADDR, h.guest_key, 1).unwrap();
    assert_eq!(status[0], VIRTIO_BLK_S_IOERR);
}

#[test]
fn block_flush_with_zero_sector_succeeds() {
    let mut h = harness_with_chain(VIRTIO_BLK_T_FLUSH, 0, 0, 0);
    h.vq.arrival(0, 3).unwrap();
    drain(&mut h);

    let status = h.mem.read(STATUS_ADDR, h.guest_key, 1).unwrap();
    assert_eq!(status[0], VIRTIO_BLK_S_OK);
}

#[test]
fn unsupported_opcode_reports_unsupp_without_touching_backend() {
    let mut h = harness_with_chain(0xDEAD_BEEF, 0, 4096, 0);
    h.vq.arrival(0, 3).unwrap();
    drain(&mut h);

    let status = h.mem.read(STATUS_ADDR, h.guest_key, 1).unwrap();
    assert_eq!(status[0], VIRTIO_BLK_S_UNSUPP);
}

#[test]
fn force_in_order_completes_arrivals_in_sequence() {
    let mem = SimHostMemory::new();
    let guest_key = mem.register(1 << 20);
    let scratch_key = mem.register(QUEUE_SIZE as usize * SCRATCH_SLOT_SIZE as usize);

    // Two independent flush chains (cheapest to complete: no data phase),
    // at descriptor indices 0-1 and 10-11.
    for (head_idx, addr_offset) in [(0u16, 0u64), (10u16, 1000u64)] {
        mem.write(HEADER_ADDR + addr_offset, guest_key, &blk_header(VIRTIO_BLK_T_FLUSH, 0)).unwrap();
        write_desc(&mem, guest_key, head_idx, HEADER_ADDR + addr_offset, 16, VRING_DESC_F_NEXT, head_idx + 1);
        write_desc(&mem, guest_key, head_idx + 1, STATUS_ADDR + addr_offset, 1, VRING_DESC_F_WRITE, 0);
    }

    let dma = DmaQueue::create(DmaQueueConfig::default(), mem.clone(), false, false);
    let backend = Arc::new(MemBlockBackend::new(mem.clone(), 1 << 20));
    let attrs = VirtqAttrs {
        desc_table_addr: DESC_TABLE_ADDR,
        device_addr: 100_000,
        size: QUEUE_SIZE,
        msix_vector: 0,
        dma_mkey: guest_key,
    };
    let mut vq = Virtqueue::new_block(0, 0, attrs, true, false, dma, scratch_key, backend, None);

    vq.arrival(0, 2).unwrap();
    vq.arrival(10, 2).unwrap();
    let mut spins = 0;
    while vq.has_outstanding() {
        vq.progress().unwrap();
        spins += 1;
        assert!(spins < 1000);
    }
    assert_eq!(vq.ctrl_used_index(), 2);
}

#[test]
fn suspended_queue_drops_new_arrivals() {
    let mut h = harness_with_chain(VIRTIO_BLK_T_FLUSH, 0, 0, 0);
    h.vq.suspend();
    assert_eq!(h.vq.state, VqState::Suspended);
    h.vq.arrival(0, 3).unwrap();
    assert!(!h.vq.has_outstanding());
}

#[test]
fn block_queue_kind_is_block() {
    let h = harness_with_chain(VIRTIO_BLK_T_FLUSH, 0, 0, 0);
    assert_eq!(h.vq.kind, QueueKind::Block);
}

/// A 2-descriptor chain (header, status) with no data descriptor at all:
/// `data_descriptors()` must report empty rather than mistaking the
/// status descriptor for payload.
#[test]
fn two_descriptor_header_and_status_only_chain() {
    let mem = SimHostMemory::new();
    let guest_key = mem.register(1 << 20);
    let scratch_key = mem.register(QUEUE_SIZE as usize * SCRATCH_SLOT_SIZE as usize);

    mem.write(HEADER_ADDR, guest_key, &blk_header(VIRTIO_BLK_T_FLUSH, 0)).unwrap();
    write_desc(&mem, guest_key, 0, HEADER_ADDR, 16, VRING_DESC_F_NEXT, 1);
    write_desc(&mem, guest_key, 1, STATUS_ADDR, 1, VRING_DESC_F_WRITE, 0);

    let dma = DmaQueue::create(DmaQueueConfig::default(), mem.clone(), false, false);
    let backend = Arc::new(MemBlockBackend::new(mem.clone(), 1 << 20));
    let attrs = VirtqAttrs {
        desc_table_addr: DESC_TABLE_ADDR,
        device_addr: 100_000,
        size: QUEUE_SIZE,
        msix_vector: 0,
        dma_mkey: guest_key,
    };
    let mut vq = Virtqueue::new_block(0, 0, attrs, false, false, dma, scratch_key, backend, None);

    vq.arrival(0, 2).unwrap();
    let mut h = Harness { mem, guest_key, vq };
    drain(&mut h);

    let status = h.mem.read(STATUS_ADDR, h.guest_key, 1).unwrap();
    assert_eq!(status[0], VIRTIO_BLK_S_OK);
    assert_eq!(h.vq.ctrl_used_index(), 1);
}

/// A zero-byte data descriptor must be skipped without issuing any DMA
/// read/write, and the command still completes successfully.
#[test]
fn zero_length_data_descriptor_issues_no_dma() {
    let mut h = harness_with_chain(VIRTIO_BLK_T_OUT, 0, 0, 0);

    h.vq.arrival(0, 3).unwrap();
    drain(&mut h);

    let status = h.mem.read(STATUS_ADDR, h.guest_key, 1).unwrap();
    assert_eq!(status[0], VIRTIO_BLK_S_OK);
    assert_eq!(h.vq.ctrl_used_index(), 1);
    assert_eq!(h.vq.stats().ops_completed.load(std::sync::atomic::Ordering::Relaxed), 1);
}

/// A descriptor chain whose head sits at the last index of the
/// descriptor table and whose `next` links wrap back to the front: the
/// fetch loop must follow the wraparound exactly like any other link.
#[test]
fn ring_boundary_wraparound_chain_completes() {
    let mem = SimHostMemory::new();
    let guest_key = mem.register(1 << 20);
    let scratch_key = mem.register(QUEUE_SIZE as usize * SCRATCH_SLOT_SIZE as usize);

    let head_idx = QUEUE_SIZE - 2; // 14
    let data_idx = QUEUE_SIZE - 1; // 15
    let status_idx = 0u16;

    mem.write(HEADER_ADDR, guest_key, &blk_header(VIRTIO_BLK_T_OUT, 0)).unwrap();
    write_desc(&mem, guest_key, head_idx, HEADER_ADDR, 16, VRING_DESC_F_NEXT, data_idx);
    write_desc(&mem, guest_key, data_idx, DATA_ADDR, 512, VRING_DESC_F_NEXT, status_idx);
    write_desc(&mem, guest_key, status_idx, STATUS_ADDR, 1, VRING_DESC_F_WRITE, 0);

    let payload = vec![0x42u8; 512];
    mem.write(DATA_ADDR, guest_key, &payload).unwrap();

    let dma = DmaQueue::create(DmaQueueConfig::default(), mem.clone(), false, false);
    let backend = Arc::new(MemBlockBackend::new(mem.clone(), 1 << 20));
    let attrs = VirtqAttrs {
        desc_table_addr: DESC_TABLE_ADDR,
        device_addr: 100_000,
        size: QUEUE_SIZE,
        msix_vector: 0,
        dma_mkey: guest_key,
    };
    let mut vq = Virtqueue::new_block(0, 0, attrs, false, false, dma, scratch_key, backend, None);

    vq.arrival(head_idx, 3).unwrap();
    let mut h = Harness { mem, guest_key, vq };
    drain(&mut h);

    let status = h.mem.read(STATUS_ADDR, h.guest_key, 1).unwrap();
    assert_eq!(status[0], VIRTIO_BLK_S_OK);
    assert_eq!(h.vq.ctrl_used_index(), 1);
}
