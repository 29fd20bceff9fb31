//! Per-command state.

use std::sync::{Arc, Mutex};

use crate::backend::BackendStatus;
use crate::desc::VringDesc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdState {
    Idle,
    FetchDescs,
    ReadHeader,
    ParseHeader,
    ReadData,
    HandleReq,
    OutDataDone,
    InDataDone,
    WriteStatus,
    SendComp,
    SendInOrderComp,
    Release,
    FatalErr,
}

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
pub const VIRTIO_BLK_T_GET_ID: u32 = 8;

pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlkRequestType {
    In,
    Out,
    Flush,
    GetId,
    Unsupported(u32),
}

impl From<u32> for BlkRequestType {
    fn from(v: u32) -> Self {
        match v {
            VIRTIO_BLK_T_IN => BlkRequestType::In,
            VIRTIO_BLK_T_OUT => BlkRequestType::Out,
            VIRTIO_BLK_T_FLUSH => BlkRequestType::Flush,
            VIRTIO_BLK_T_GET_ID => BlkRequestType::GetId,
            other => BlkRequestType::Unsupported(other),
        }
    }
}

/// Parsed virtio-blk request header: `{type:u32, reserved:u32,
/// sector:u64}`, 16 bytes.
#[derive(Debug, Clone, Copy)]
pub struct BlkHeader {
    pub req_type: BlkRequestType,
    pub sector: u64,
}

impl BlkHeader {
    pub const WIRE_SIZE: usize = 16;

    pub fn parse(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= Self::WIRE_SIZE);
        let req_type = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let sector = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        BlkHeader { req_type: req_type.into(), sector }
    }
}

/// What kind of virtqueue this command belongs to; the FSM handlers in
/// `queue.rs` branch on it exactly where says block and fs
/// differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Block,
    /// `is_hiprio`: the fs high-priority queue skips straight to
    /// `HANDLE_REQ` instead of `READ_DATA`.
    Fs { is_hiprio: bool },
}

/// One outstanding command on a virtqueue.
pub struct VirtqCommand {
    pub slot: usize,
    pub descr_head_idx: u16,
    pub num_desc: u16,
    pub state: CmdState,
    pub descriptors: Vec<VringDesc>,
    pub header_buf: Vec<u8>,
    pub data_buf: Vec<u8>,
    pub total_seg_len: u32,
    pub total_in_len: u32,
    pub status_byte: u8,
    /// Sequence number preserving arrival order, used by force-in-order.
    pub arrival_sn: u64,
    pub use_dmem: bool,
    pub use_seg_dmem: bool,
    pub unsupported: bool,
    pub blk_header: Option<BlkHeader>,
    /// Set once the backend call for this command has been issued, so a
    /// re-entry into `HANDLE_REQ` on a later progress pass does not
    /// dispatch the request twice.
    pub backend_dispatched: bool,
    /// Set when the backend call for this command was dispatched through
    /// the zero-copy fake-iov path rather than the scratch bounce buffer.
    pub zcopy: bool,
    /// Written by the backend's completion callback. `None` while the
    /// backend call is still outstanding.
    pub backend_result: Arc<Mutex<Option<BackendStatus>>>,
}

impl VirtqCommand {
    pub fn new_idle(slot: usize) -> Self {
        VirtqCommand {
            slot,
            descr_head_idx: 0,
            num_desc: 0,
            state: CmdState::Idle,
            descriptors: Vec::new(),
            header_buf: Vec::new(),
            data_buf: Vec::new(),
            total_seg_len: 0,
            total_in_len: 0,
            status_byte: VIRTIO_BLK_S_OK,
            arrival_sn: 0,
            use_dmem: false,
            use_seg_dmem: false,
            unsupported: false,
            blk_header: None,
            backend_dispatched: false,
            zcopy: false,
            backend_result: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.state != CmdState::Idle
    }

    pub fn reset(&mut self) {
        self.descriptors.clear();
        self.header_buf.clear();
        self.data_buf.clear();
        self.total_seg_len = 0;
        self.total_in_len = 0;
        self.status_byte = VIRTIO_BLK_S_OK;
        self.use_dmem = false;
        self.use_seg_dmem = false;
        self.unsupported = false;
        self.blk_header = None;
        self.backend_dispatched = false;
        self.zcopy = false;
        self.backend_result = Arc::new(Mutex::new(None));
        self.state = CmdState::Idle;
    }

    /// Descriptors strictly between the header (index 0) and the status
    /// byte (the last descriptor): the payload of the request. Excluding
    /// the status descriptor matters because it also carries
    /// `VRING_DESC_F_WRITE`, so a naive "all writable descriptors" filter
    /// would mistake it for device-writable payload.
    pub fn data_descriptors(&self) -> &[VringDesc] {
        if self.descriptors.len() >= 3 {
            &self.descriptors[1..self.descriptors.len() - 1]
        } else {
            &[]
        }
    }

    pub fn status_descriptor_index(&self) -> Option<usize> {
        if self.descriptors.is_empty() {
            None
        } else {
            Some(self.descriptors.len() - 1)
        }
    }
}
