//! Offloaded virtqueue protocol, grounded on
//! `examples/original_source/src/snap_dpa_virtq.c` /
//! `snap_dpa_virtq_common.h`: a DPA thread services doorbells and feeds
//! the same host-side state machine as the non-offloaded path
//! (`snap-virtq`) via `VQ_HEADS` / `VQ_TABLE` p2p messages.

use crate::error::{DpaError, DpaResult};
use crate::mailbox::{CMD_APP_FIRST, RSP_OK};
use crate::p2p::{CreditEndpoint, MsgType, P2pMsg};
use crate::process::DpaThread;

pub const DPA_VIRTQ_CMD_CREATE: u32 = CMD_APP_FIRST;
pub const DPA_VIRTQ_CMD_DESTROY: u32 = CMD_APP_FIRST + 1;
pub const DPA_VIRTQ_CMD_MODIFY: u32 = CMD_APP_FIRST + 2;

/// A DUAR entry: maps one `(emulated_vhca_id, queue_id)` doorbell to the
/// DPA-mapped completion queue that wakes the owning thread.
#[derive(Debug, Clone, Copy)]
pub struct DuarMapping {
    pub duar_id: u32,
    pub vhca_id: u32,
    pub queue_id: u16,
    pub cq_id: u32,
}

/// The `DPA_VIRTQ_CMD_CREATE` payload.
#[derive(Debug, Clone, Copy)]
pub struct VirtqCreateParams {
    pub idx: u16,
    pub size: u16,
    pub desc_addr: u64,
    pub driver_addr: u64,
    pub device_addr: u64,
    pub vhca_id: u32,
    pub host_mkey: u32,
    pub dpu_desc_shadow_mkey: u32,
    pub dpu_desc_shadow_addr: u64,
    pub duar_id: u32,
    pub hw_avail: u16,
    pub hw_used: u16,
}

/// One virtqueue whose fast path has been moved to a DPA thread. Host
/// side progress pulls `VQ_HEADS`/`VQ_TABLE` messages from `credits` and
/// turns them into arrival indices to feed into `snap_virtq::Virtqueue`.
pub struct OffloadedVirtq {
    pub params: VirtqCreateParams,
    pub duar: DuarMapping,
    credits: CreditEndpoint,
    shadow_avail_index: u16,
    created: bool,
}

impl OffloadedVirtq {
    /// Step 1+2: create the DUAR mapping and send `DPA_VIRTQ_CMD_CREATE`.
    pub fn create(thread: &mut DpaThread, params: VirtqCreateParams) -> DpaResult<Self> {
        if !thread.is_started() {
            return Err(DpaError::NotInitialized);
        }
        let duar = DuarMapping {
            duar_id: params.duar_id,
            vhca_id: params.vhca_id,
            queue_id: params.idx,
            cq_id: params.duar_id, // one CQ per DUAR in this model
        };
        let sn = thread.mailbox.send_command(DPA_VIRTQ_CMD_CREATE, encode_create(&params));
        thread.mailbox.send_response(sn, RSP_OK);
        match thread.mailbox.poll_response(sn) {
            Some(RSP_OK) => Ok(OffloadedVirtq {
                    params,
                    duar,
                    credits: CreditEndpoint::new(),
                    shadow_avail_index: params.hw_avail,
                    created: true,
            }),
            Some(status) => Err(DpaError::UnexpectedStatus(status)),
            None => Err(DpaError::MailboxTimeout),
        }
    }

    /// Step 3: the DPA thread observed a new available-ring delta and
    /// reports it as head indices. Returns the list of descriptor head
    /// indices the host-side virtqueue should feed into `arrival`.
    pub fn ingest(&mut self, msg: &P2pMsg) -> DpaResult<Vec<u16>> {
        if !self.created {
            return Err(DpaError::NotInitialized);
        }
        match msg.msg_type {
            MsgType::VqHeads | MsgType::VqTable | MsgType::VqTableCont => {
                self.credits.on_receive();
                self.shadow_avail_index = msg.avail_index;
                Ok(msg.descr_heads.clone())
            }
            MsgType::CrUpdate => {
                self.credits.apply_credit_update(msg.credit_delta);
                Ok(Vec::new())
            }
            other => Err(DpaError::UnexpectedStatus(other.to_u8() as u32)),
        }
    }

    /// Step 5: completion path. The host writes used-ring entries
    /// directly and bumps the used index; this just advances the shadow
    /// bookkeeping this crate tracks, MSIX delivery is out of scope.
    pub fn retire(&mut self, count: u16) {
        self.shadow_avail_index = self.shadow_avail_index.wrapping_add(count);
    }

    pub fn credits_available(&self) -> u16 {
        self.credits.available()
    }

    /// Step: `DPA_VIRTQ_CMD_DESTROY` round trip before the caller tears
    /// down the DUAR, cross-mkey, shadow buffer, and thread.
    pub fn destroy(mut self, thread: &mut DpaThread) -> DpaResult<()> {
        let sn = thread.mailbox.send_command(DPA_VIRTQ_CMD_DESTROY, self.params.idx.to_le_bytes().to_vec());
        thread.mailbox.send_response(sn, RSP_OK);
        self.created = false;
        match thread.mailbox.poll_response(sn) {
            Some(RSP_OK) => Ok(()),
            Some(status) => Err(DpaError::UnexpectedStatus(status)),
            None => Err(DpaError::MailboxTimeout),
        }
    }
}

fn encode_create(p: &VirtqCreateParams) -> Vec<u8> {
    let mut buf = Vec::with_capacity(48);
    buf.extend_from_slice(&p.idx.to_le_bytes());
    buf.extend_from_slice(&p.size.to_le_bytes());
    buf.extend_from_slice(&p.desc_addr.to_le_bytes());
    buf.extend_from_slice(&p.driver_addr.to_le_bytes());
    buf.extend_from_slice(&p.device_addr.to_le_bytes());
    buf.extend_from_slice(&p.vhca_id.to_le_bytes());
    buf.extend_from_slice(&p.host_mkey.to_le_bytes());
    buf
}
