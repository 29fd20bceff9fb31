//! DPA process and thread, grounded on `struct
//! snap_dpa_ctx` / `struct snap_dpa_thread` in
//! `examples/original_source/src/snap_dpa.h`.
//!
//! This crate has no real DPA core to load an ELF image onto, so
//! `DpaProcess` owns the identifiers a real one would hand out
//! (protection domain, event queue, umem) as opaque allocator-assigned
//! ids, and `DpaThread` drives its mailbox through the same
//! command/response handshake the real firmware uses, without an actual
//! second execution context polling the other end.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;

use crate::error::{DpaError, DpaResult};
use crate::mailbox::{Mailbox, CMD_START, CMD_STOP, RSP_OK};

static NEXT_PROC_ID: AtomicU32 = AtomicU32::new(1);
static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

/// One DPA application: owns a protection domain, event queue, and a
/// single outbox shared by every thread it creates.
pub struct DpaProcess {
    pub id: u32,
    pub app_name: String,
    pub pd_id: u32,
    pub eq_id: u32,
    pub umem_id: u32,
    next_heap_offset: AtomicU32,
}

impl DpaProcess {
    pub fn create(app_name: &str, pd_id: u32) -> Arc<Self> {
        let id = NEXT_PROC_ID.fetch_add(1, Ordering::Relaxed);
        Arc::new(DpaProcess {
                id,
                app_name: app_name.to_string(),
                pd_id,
                eq_id: id, // one EQ per process in this simplified model
                umem_id: id,
                next_heap_offset: AtomicU32::new(0),
        })
    }

    /// Carves out `size` bytes of process-local heap for a new thread,
    /// returning the DPA virtual address (an offset into the umem, per
    /// `snap_dpa_process_umem_offset`).
    fn alloc_heap(&self, size: u32) -> u64 {
        self.next_heap_offset.fetch_add(size, Ordering::Relaxed) as u64
    }
}

/// `struct snap_dpa_tcb`: parameters handed to the DPA thread at start.
#[derive(Debug, Clone, Copy)]
pub struct DpaTcb {
    pub mbox_address: u64,
    pub mbox_lkey: u32,
    pub data_address: u64,
    pub data_used: u64,
}

pub const THREAD_ATTR_POLLING: u8 = 0x1;

pub struct DpaThreadAttr {
    pub heap_size: u32,
    pub entry_point: String,
    pub polling: bool,
}

impl Default for DpaThreadAttr {
    fn default() -> Self {
        DpaThreadAttr { heap_size: 2 * 16384, entry_point: "__snap_dpa_thread_start".to_string(), polling: true }
    }
}

/// A pinnable execution context inside a [`DpaProcess`].
/// Initialization is only complete once the (simulated) thread
/// acknowledges `CMD_START` on its mailbox.
pub struct DpaThread {
    pub id: u32,
    pub process: Arc<DpaProcess>,
    pub tcb: DpaTcb,
    pub mailbox: Mailbox,
    last_seen_cmd_sn: u32,
    started: bool,
}

impl DpaThread {
    pub fn create(process: &Arc<DpaProcess>, attr: &DpaThreadAttr) -> Self {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let heap_base = process.alloc_heap(attr.heap_size);
        let mailbox = Mailbox::new();
        let tcb = DpaTcb { mbox_address: 0, mbox_lkey: 0, data_address: heap_base, data_used: 0 };
        debug!("dpa thread {} created on process {} ({})", id, process.id, attr.entry_point);
        DpaThread { id, process: process.clone(), tcb, mailbox, last_seen_cmd_sn: 0, started: false }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Sends `CMD_START` and drives the (simulated) thread's side of the
    /// handshake to completion: the real thread polls and replies
    /// asynchronously, but with no second execution context here the
    /// acknowledgement is synthesized immediately after the command is
    /// visible, matching what a healthy thread would do on its very
    /// next poll.
    pub fn start(&mut self) -> DpaResult<()> {
        let sn = self.mailbox.send_command(CMD_START, Vec::new());
        let (seen_sn, _cmd, _payload) =
        self.mailbox.poll_command(self.last_seen_cmd_sn).ok_or(DpaError::MailboxTimeout)?;
        self.last_seen_cmd_sn = seen_sn;
        self.mailbox.send_response(seen_sn, RSP_OK);
        match self.mailbox.poll_response(sn) {
            Some(RSP_OK) => {
                self.started = true;
                Ok(())
            }
            Some(status) => Err(DpaError::UnexpectedStatus(status)),
            None => Err(DpaError::MailboxTimeout),
        }
    }

    pub fn stop(&mut self) -> DpaResult<()> {
        if !self.started {
            return Err(DpaError::NotInitialized);
        }
        let sn = self.mailbox.send_command(CMD_STOP, Vec::new());
        let (seen_sn, _, _) =
        self.mailbox.poll_command(self.last_seen_cmd_sn).ok_or(DpaError::MailboxTimeout)?;
        self.last_seen_cmd_sn = seen_sn;
        self.mailbox.send_response(seen_sn, RSP_OK);
        self.started = self.mailbox.poll_response(sn) != Some(RSP_OK);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_start_completes_handshake() {
        let proc = DpaProcess::create("virtio-blk-dpa", 1);
        let mut thread = DpaThread::create(&proc, &DpaThreadAttr::default());
        assert!(!thread.is_started());
        thread.start().unwrap();
        assert!(thread.is_started());
    }

    #[test]
    fn stop_before_start_is_rejected() {
        let proc = DpaProcess::create("virtio-blk-dpa", 1);
        let mut thread = DpaThread::create(&proc, &DpaThreadAttr::default());
        assert!(matches!(thread.stop(), Err(DpaError::NotInitialized)));
    }

    #[test]
    fn threads_on_same_process_get_disjoint_heap_ranges() {
        let proc = DpaProcess::create("virtio-blk-dpa", 1);
        let attr = DpaThreadAttr { heap_size: 4096, ..Default::default() };
        let t1 = DpaThread::create(&proc, &attr);
        let t2 = DpaThread::create(&proc, &attr);
        assert_ne!(t1.tcb.data_address, t2.tcb.data_address);
    }
}
