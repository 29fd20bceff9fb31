//! RDMA-CM-like control channel: decodes wire commands,
//! drives the dirty-page map and the controller's migration callbacks,
//! and RDMA-writes results back through the same [`HostMemory`] seam
//! `snap-dma` uses for the data path.

use std::sync::Mutex;

use log::{debug, warn};
use snap_dma::HostMemory;

use crate::dirty::DirtyPageMap;
use crate::wire::{Command, Completion, RawCommand, StatusCode};

/// Controller-side hooks the channel drives.
pub trait MigrationOps: Send {
    fn freeze(&mut self) -> bool;
    fn unfreeze(&mut self) -> bool;
    fn quiesce(&mut self) -> bool;
    fn unquiesce(&mut self) -> bool;
    fn state_size(&self) -> usize;
    fn read_state(&self) -> Vec<u8>;
    fn write_state(&mut self, bytes: &[u8]) -> bool;
}

pub struct MigrationChannel<M: HostMemory, O: MigrationOps> {
    mem: M,
    ops: O,
    dirty: DirtyPageMap,
    /// Set by GET_LOG_SZ, consumed (and freed) by the next REPORT_LOG,
    ///.5's "snapshot is freed on send completion".
    pending_log: Mutex<Option<Vec<u8>>>,
}

impl<M: HostMemory, O: MigrationOps> MigrationChannel<M, O> {
    pub fn new(mem: M, ops: O, default_page_size: u32) -> Self {
        MigrationChannel { mem, ops, dirty: DirtyPageMap::new(default_page_size), pending_log: Mutex::new(None) }
    }

    pub fn dirty_map(&self) -> &DirtyPageMap {
        &self.dirty
    }

    /// Decodes and executes one 64-byte command, returning the 16-byte
    /// completion to send back over the channel.
    pub fn handle_command(&mut self, raw_bytes: &[u8]) -> [u8; 16] {
        let Some(raw) = RawCommand::from_bytes(raw_bytes) else {
            return Completion { command_id: 0, status: StatusCode::InvalidField, result: 0 }.to_bytes();
        };
        let (command_id, status, result) = match Command::parse(&raw) {
            Err((cid, status)) => (cid, status, 0),
            Ok(cmd) => self.execute(cmd),
        };
        Completion { command_id, status, result }.to_bytes()
    }

    fn execute(&mut self, cmd: Command) -> (u16, StatusCode, u64) {
        let cid = cmd.command_id();
        match cmd {
            Command::StartLog { addr: _, length: _, key: _, page_size, .. } => {
                if self.dirty.is_logging() {
                    return (cid, StatusCode::AlreadyStartedLog, 0);
                }
                if page_size != self.dirty.page_size() {
                    debug!("migration channel: start-log page size {} != configured {}", page_size, self.dirty.page_size());
                }
                self.dirty.start();
                (cid, StatusCode::Success, 0)
            }
            Command::StopLog {.. } => {
                if !self.dirty.is_logging() {
                    return (cid, StatusCode::AlreadyStoppedLog, 0);
                }
                self.dirty.stop();
                (cid, StatusCode::Success, 0)
            }
            Command::GetLogSz {.. } => {
                let snap = self.dirty.snapshot();
                let len = snap.len() as u64;
                *self.pending_log.lock().unwrap() = Some(snap);
                (cid, StatusCode::Success, len)
            }
            Command::ReportLog { addr, length, key, .. } => {
                let Some(snap) = self.pending_log.lock().unwrap().take() else {
                    warn!("REPORT_LOG with no pending snapshot (GET_LOG_SZ not called first)");
                    return (cid, StatusCode::InvalidField, 0);
                };
                let n = (length as usize).min(snap.len());
                match self.mem.write(addr, key, &snap[..n]) {
                    Ok(()) => (cid, StatusCode::Success, n as u64),
                    Err(_) => (cid, StatusCode::DataXferError, 0),
                }
            }
            Command::FreezeDev {.. } => {
                (cid, if self.ops.freeze() { StatusCode::Success } else { StatusCode::Internal }, 0)
            }
            Command::UnfreezeDev {.. } => {
                (cid, if self.ops.unfreeze() { StatusCode::Success } else { StatusCode::Internal }, 0)
            }
            Command::QuiesceDev {.. } => {
                (cid, if self.ops.quiesce() { StatusCode::Success } else { StatusCode::Internal }, 0)
            }
            Command::UnquiesceDev {.. } => {
                (cid, if self.ops.unquiesce() { StatusCode::Success } else { StatusCode::Internal }, 0)
            }
            Command::GetStateSz {.. } => (cid, StatusCode::Success, self.ops.state_size() as u64),
            Command::ReadState { addr, length, key, .. } => {
                let state = self.ops.read_state();
                let n = (length as usize).min(state.len());
                match self.mem.write(addr, key, &state[..n]) {
                    Ok(()) => (cid, StatusCode::Success, n as u64),
                    Err(_) => (cid, StatusCode::DataXferError, 0),
                }
            }
            Command::WriteState { addr, length, key, .. } => match self.mem.read(addr, key, length as usize) {
                Ok(bytes) => {
                    let ok = self.ops.write_state(&bytes);
                    (cid, if ok { StatusCode::Success } else { StatusCode::Internal }, bytes.len() as u64)
                }
                Err(_) => (cid, StatusCode::DataXferError, 0),
            },
        }
    }
}
