//! The virtio controller: turns BAR changes into queue
//! lifecycle calls and drives every assigned queue's progress loop.

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::bar::{diff, BarChange, BarSnapshot, QueueAttr, VIRTIO_CONFIG_S_RESET};
use crate::error::{CtrlError, CtrlResult};
use crate::fw_queue::FwVirtq;
use crate::lifecycle::{self, CtrlState};
use crate::migration_state::{MigrationState, PciCommonCfg, QueueCfg};

/// Per-type callbacks the controller invokes around lifecycle
/// transitions, and the factory that turns an enabled queue index into a
/// concrete `FwVirtq`.
pub trait ControllerCallbacks<Q: FwVirtq> {
    fn validate(&mut self, bar: &BarSnapshot) -> bool;
    fn create_queue(&mut self, index: u16, attr: &QueueAttr, pg_id: u32) -> Q;
    fn start(&mut self) {}
    fn stop(&mut self) {}
    fn pre_flr(&mut self) {}
    fn post_flr(&mut self) {}
}

/// Round-robins queue assignment across `npgs` polling groups, the same
/// balance-by-least-loaded strategy as `snap_virtq::PollingGroupPool`
/// but kept local here since the controller is the one thing that knows
/// both the queue count and the group count at creation time.
fn next_pg(npgs: u32, counts: &mut [u32]) -> u32 {
    let (idx, _) =
    counts.iter().enumerate().min_by_key(|&(_, c)| *c).expect("npgs is at least 1");
    counts[idx] += 1;
    idx as u32
}

pub struct Controller<Q: FwVirtq, C: ControllerCallbacks<Q>> {
    pub id: u32,
    state: CtrlState,
    npgs: u32,
    pg_counts: Vec<u32>,
    bar_prev: BarSnapshot,
    bar_curr: BarSnapshot,
    queues: HashMap<u16, Q>,
    pub force_in_order: bool,
    pub log_writes_to_host: bool,
    callbacks: C,
    /// Set while a suspend is draining outstanding I/O; cleared once
    /// every queue reports no outstanding commands.
    suspend_in_flight: bool,
}

impl<Q: FwVirtq, C: ControllerCallbacks<Q>> Controller<Q, C> {
    pub fn new(id: u32, npgs: u32, num_queues: usize, callbacks: C) -> Self {
        assert!(npgs > 0, "a controller needs at least one polling group");
        Controller {
            id,
            state: CtrlState::Stopped,
            npgs,
            pg_counts: vec![0; npgs as usize],
            bar_prev: BarSnapshot::with_num_queues(num_queues),
            bar_curr: BarSnapshot::with_num_queues(num_queues),
            queues: HashMap::new(),
            force_in_order: false,
            log_writes_to_host: false,
            callbacks,
            suspend_in_flight: false,
        }
    }

    pub fn state(&self) -> CtrlState {
        self.state
    }

    pub fn bar_mut(&mut self) -> &mut BarSnapshot {
        &mut self.bar_curr
    }

    pub fn queue(&self, index: u16) -> Option<&Q> {
        self.queues.get(&index)
    }

    /// One controller progress pass: diff the BAR, react to changes,
    /// then progress every live queue.
    pub fn progress(&mut self) -> CtrlResult<()> {
        let changes = diff(&self.bar_prev, &self.bar_curr);
        self.bar_prev = self.bar_curr.clone();
        for change in changes {
            self.handle_bar_change(change)?;
        }

        if self.suspend_in_flight {
            self.poll_suspend()?;
        }

        if self.state == CtrlState::Started {
            for q in self.queues.values_mut() {
                q.progress();
                if q.is_fatal() {
                    warn!("ctrl {} queue {} went fatal, suspending controller", self.id, q.id());
                }
            }
        }
        Ok(())
    }

    fn handle_bar_change(&mut self, change: BarChange) -> CtrlResult<()> {
        match change {
            BarChange::DriverOk => self.start()?,
            BarChange::Reset => self.handle_reset(),
            BarChange::QueueEnabled(idx) => self.create_queue(idx)?,
            BarChange::QueueDisabled(idx) => self.destroy_queue(idx),
        }
        Ok(())
    }

    /// STARTED transition: validate, create every enabled
    /// queue, attach to a polling group, call the type's `start`.
    pub fn start(&mut self) -> CtrlResult<()> {
        if !self.callbacks.validate(&self.bar_curr) {
            warn!("ctrl {} bar validation failed, staying stopped", self.id);
            return Ok(());
        }
        lifecycle::transition(&mut self.state, CtrlState::Started)?;
        for idx in 0..self.bar_curr.queues.len() as u16 {
            if self.bar_curr.queues[idx as usize].enabled && !self.queues.contains_key(&idx) {
                self.create_queue(idx)?;
            }
        }
        self.callbacks.start();
        info!("ctrl {} started with {} queues", self.id, self.queues.len());
        Ok(())
    }

    fn create_queue(&mut self, index: u16) -> CtrlResult<()> {
        if self.queues.contains_key(&index) {
            return Err(CtrlError::QueueAlreadyExists(index));
        }
        let attr = self
        .bar_curr
        .queues
        .get(index as usize)
        .copied()
        .ok_or(CtrlError::QueueIndexOutOfRange(index))?;
        let pg_id = next_pg(self.npgs, &mut self.pg_counts);
        let q = self.callbacks.create_queue(index, &attr, pg_id);
        debug!("ctrl {} created queue {} on pg {}", self.id, index, pg_id);
        self.queues.insert(index, q);
        Ok(())
    }

    fn destroy_queue(&mut self, index: u16) {
        if let Some(q) = self.queues.remove(&index) {
            let pg = q.pg_id() as usize;
            if let Some(c) = self.pg_counts.get_mut(pg) {
                *c = c.saturating_sub(1);
            }
        }
    }

    fn handle_reset(&mut self) {
        self.queues.clear();
        self.pg_counts.iter_mut().for_each(|c| *c = 0);
        let _ = lifecycle::transition(&mut self.state, CtrlState::Stopped);
        self.callbacks.stop();
    }

    /// Begins a suspend: moves to SUSPENDING and asks every queue to
    /// stop accepting new arrivals; the move to SUSPENDED itself happens
    /// once `poll_suspend` observes every queue idle.
    pub fn begin_suspend(&mut self) -> CtrlResult<()> {
        lifecycle::transition(&mut self.state, CtrlState::Suspending)?;
        for q in self.queues.values_mut() {
            q.suspend();
        }
        self.suspend_in_flight = true;
        Ok(())
    }

    fn poll_suspend(&mut self) -> CtrlResult<()> {
        if self.queues.values().any(|q| q.has_outstanding()) {
            return Ok(());
        }
        lifecycle::transition(&mut self.state, CtrlState::Suspended)?;
        self.suspend_in_flight = false;
        Ok(())
    }

    /// Synchronous resume (: "Reverse operation (resume) is
    /// a sync operation").
    pub fn resume(&mut self) -> CtrlResult<()> {
        lifecycle::transition(&mut self.state, CtrlState::Started)?;
        for q in self.queues.values_mut() {
            q.resume();
        }
        Ok(())
    }

    /// Unsafe direct stop: does not wait for outstanding I/O. Callers
    /// wanting a safe shutdown should `begin_suspend` first.
    pub fn stop(&mut self) -> CtrlResult<()> {
        lifecycle::transition(&mut self.state, CtrlState::Stopped)?;
        self.queues.clear();
        self.callbacks.stop();
        Ok(())
    }

    pub fn pre_flr(&mut self) {
        self.callbacks.pre_flr();
    }

    pub fn post_flr(&mut self) {
        self.callbacks.post_flr();
        self.bar_curr.device_status = VIRTIO_CONFIG_S_RESET;
        self.handle_reset();
    }

    /// Snapshots migration state.
    pub fn snapshot_migration_state(&self, device_cfg: Vec<u8>) -> MigrationState {
        let pci_common_cfg = PciCommonCfg {
            device_feature_select: self.bar_curr.device_feature_select,
            device_feature: 0,
            driver_feature_select: self.bar_curr.driver_feature_select,
            driver_feature: 0,
            msix_config: 0,
            num_queues: self.bar_curr.queues.len() as u16,
            device_status: self.bar_curr.device_status,
            config_generation: 0,
            ctrl_state: self.state,
        };
        let queue_cfg = self
        .bar_curr
        .queues
        .iter()
        .enumerate()
        .map(|(idx, attr)| {
                let (avail, used) = self
                .queues
                .get(&(idx as u16))
                .map(|q| (q.hw_available_index(), q.hw_used_index()))
                .unwrap_or((0, 0));
                QueueCfg { attr: *attr, hw_available_index: avail, hw_used_index: used }
        })
        .collect();
        MigrationState { pci_common_cfg, queue_cfg, device_cfg }
    }

    /// Restores from a snapshot: restore requires the controller to have
    /// been created in the SUSPENDED state, and queues are only
    /// instantiated on first resume, using the restored indexes. This
    /// method applies the BAR/index state; actual queue instantiation
    /// happens through the normal `resume` -> `start` path using
    /// `bar_curr`, which this call populates.
    pub fn restore_migration_state(&mut self, state: &MigrationState) -> CtrlResult<()> {
        if self.state != CtrlState::Suspended {
            return Err(CtrlError::RestoreRequiresSuspended);
        }
        if state.queue_cfg.len() != self.bar_curr.queues.len() {
            return Err(CtrlError::SectionMismatch {
                    expected: self.bar_curr.queues.len(),
                    got: state.queue_cfg.len(),
            });
        }
        self.bar_curr.device_status = state.pci_common_cfg.device_status;
        self.bar_curr.device_feature_select = state.pci_common_cfg.device_feature_select;
        self.bar_curr.driver_feature_select = state.pci_common_cfg.driver_feature_select;
        for (idx, qcfg) in state.queue_cfg.iter().enumerate() {
            self.bar_curr.queues[idx] = qcfg.attr;
        }
        self.bar_prev = self.bar_curr.clone();
        Ok(())
    }
}
