//! DPA thread mailbox, grounded on
//! `struct snap_dpa_cmd` / `struct snap_dpa_rsp` in
//! `examples/original_source/src/snap_dpa_common.h`.
//!
//! The real mailbox is a 4 KiB DPU-memory window the DPA thread polls
//! over PCIe; this crate has no real DPA core to poll it, so `Mailbox`
//! models the same serial-number handshake as plain shared state both
//! sides touch directly. The sn/poll contract is unchanged: a sender
//! bumps the serial number after writing the payload, a receiver spins
//! until the serial number it last saw changes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

pub const MBOX_LEN: usize = 4096;
pub const MBOX_CMD_OFFSET: usize = 0;
pub const MBOX_RSP_OFFSET: usize = 2048;

pub const CMD_START: u32 = 0x1;
pub const CMD_STOP: u32 = 0x2;
pub const CMD_MR: u32 = 0x10;
pub const CMD_DMA_EP_COPY: u32 = 0x100;
pub const CMD_APP_FIRST: u32 = 0xf000_0000;

pub const RSP_OK: u32 = 0;
pub const RSP_ERR: u32 = 1;

struct MailboxState {
    cmd_sn: AtomicU32,
    cmd_type: AtomicU32,
    cmd_payload: Mutex<Vec<u8>>,
    rsp_sn: AtomicU32,
    rsp_status: AtomicU32,
}

/// A cloneable handle to one thread's mailbox; both the DPU-side command
/// sender and the simulated DPA-side command processor hold one.
#[derive(Clone)]
pub struct Mailbox(Arc<MailboxState>);

impl Mailbox {
    pub fn new() -> Self {
        Mailbox(Arc::new(MailboxState {
                    cmd_sn: AtomicU32::new(0),
                    cmd_type: AtomicU32::new(0),
                    cmd_payload: Mutex::new(Vec::new()),
                    rsp_sn: AtomicU32::new(0),
                    rsp_status: AtomicU32::new(RSP_OK),
        }))
    }

    /// DPU side: writes the command payload, then bumps `cmd_sn` — a
    /// store-fence-then-signal sequence.
    pub fn send_command(&self, cmd_type: u32, payload: Vec<u8>) -> u32 {
        *self.0.cmd_payload.lock() = payload;
        self.0.cmd_type.store(cmd_type, Ordering::Release);
        self.0.cmd_sn.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// DPA side: non-blocking poll. Returns the command once `sn` has
    /// advanced past `last_seen_sn`.
    pub fn poll_command(&self, last_seen_sn: u32) -> Option<(u32, u32, Vec<u8>)> {
        let sn = self.0.cmd_sn.load(Ordering::Acquire);
        if sn == last_seen_sn {
            return None;
        }
        let cmd_type = self.0.cmd_type.load(Ordering::Acquire);
        let payload = self.0.cmd_payload.lock().clone();
        Some((sn, cmd_type, payload))
    }

    /// DPA side: acknowledges the command at `sn` with `status`.
    pub fn send_response(&self, sn: u32, status: u32) {
        self.0.rsp_status.store(status, Ordering::Release);
        self.0.rsp_sn.store(sn, Ordering::Release);
    }

    /// DPU side: non-blocking poll for the response to the command sent
    /// with serial number `cmd_sn`.
    pub fn poll_response(&self, cmd_sn: u32) -> Option<u32> {
        if self.0.rsp_sn.load(Ordering::Acquire) != cmd_sn {
            return None;
        }
        Some(self.0.rsp_status.load(Ordering::Acquire))
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trip() {
        let mbox = Mailbox::new();
        let sn = mbox.send_command(CMD_START, vec![1, 2, 3]);

        let (seen_sn, cmd, payload) = mbox.poll_command(0).expect("command visible");
        assert_eq!(seen_sn, sn);
        assert_eq!(cmd, CMD_START);
        assert_eq!(payload, vec![1, 2, 3]);

        assert!(mbox.poll_response(sn).is_none());
        mbox.send_response(seen_sn, RSP_OK);
        assert_eq!(mbox.poll_response(sn), Some(RSP_OK));
    }

    #[test]
    fn poll_command_is_idempotent_on_same_sn() {
        let mbox = Mailbox::new();
        let sn = mbox.send_command(CMD_MR, vec![]);
        assert!(mbox.poll_command(sn).is_none(), "no new command at the current sn");
        assert!(mbox.poll_command(sn - 1).is_some());
    }
}
