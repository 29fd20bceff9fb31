//! BAR snapshot and diff.
//!
//! The controller keeps a "previous" and "current" copy of the subset of
//! the virtio common config space it cares about, and diffs them once
//! per progress pass rather than reacting to individual register writes
//! (which, over the tunnel transport, don't arrive as discrete events).

use serde::{Deserialize, Serialize};

pub const VIRTIO_CONFIG_S_RESET: u8 = 0;
pub const VIRTIO_CONFIG_S_ACKNOWLEDGE: u8 = 1;
pub const VIRTIO_CONFIG_S_DRIVER: u8 = 2;
pub const VIRTIO_CONFIG_S_DRIVER_OK: u8 = 4;
pub const VIRTIO_CONFIG_S_FEATURES_OK: u8 = 8;
pub const VIRTIO_CONFIG_S_NEEDS_RESET: u8 = 64;
pub const VIRTIO_CONFIG_S_FAILED: u8 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueAttr {
    pub enabled: bool,
    pub size: u16,
    pub desc_addr: u64,
    pub driver_addr: u64,
    pub device_addr: u64,
    pub msix_vector: u16,
}

/// The fields of `struct snap_virtio_device_attr` the controller reacts
/// to.
#[derive(Debug, Clone, Default)]
pub struct BarSnapshot {
    pub device_status: u8,
    pub device_feature_select: u32,
    pub driver_feature_select: u32,
    pub queues: Vec<QueueAttr>,
}

impl BarSnapshot {
    pub fn with_num_queues(num_queues: usize) -> Self {
        BarSnapshot { queues: vec![QueueAttr::default(); num_queues], ..Default::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarChange {
    /// `device_status` gained `DRIVER_OK` that it didn't have before.
    DriverOk,
    /// The live `device_status` dropped to `RESET` (0).
    Reset,
    /// `queue_enable` went false -> true for this index: create it.
    QueueEnabled(u16),
    /// `queue_enable` went true -> false for this index: destroy it.
    QueueDisabled(u16),
}

/// Diffs `prev` against `curr`, producing the list of changes the
/// controller should react to, in a stable, deterministic order.
pub fn diff(prev: &BarSnapshot, curr: &BarSnapshot) -> Vec<BarChange> {
    let mut changes = Vec::new();

    let prev_driver_ok = prev.device_status & VIRTIO_CONFIG_S_DRIVER_OK != 0;
    let curr_driver_ok = curr.device_status & VIRTIO_CONFIG_S_DRIVER_OK != 0;
    if !prev_driver_ok && curr_driver_ok {
        changes.push(BarChange::DriverOk);
    }
    if curr.device_status == VIRTIO_CONFIG_S_RESET && prev.device_status != VIRTIO_CONFIG_S_RESET {
        changes.push(BarChange::Reset);
    }

    for idx in 0..curr.queues.len() {
        let was_enabled = prev.queues.get(idx).map(|q| q.enabled).unwrap_or(false);
        let is_enabled = curr.queues[idx].enabled;
        if !was_enabled && is_enabled {
            changes.push(BarChange::QueueEnabled(idx as u16));
        } else if was_enabled && !is_enabled {
            changes.push(BarChange::QueueDisabled(idx as u16));
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_ok_transition_is_detected_once() {
        let mut prev = BarSnapshot::with_num_queues(1);
        let mut curr = BarSnapshot::with_num_queues(1);
        curr.device_status = VIRTIO_CONFIG_S_DRIVER_OK;
        assert_eq!(diff(&prev, &curr), vec![BarChange::DriverOk]);

        prev = curr.clone();
        assert_eq!(diff(&prev, &curr), vec![]);
    }

    #[test]
    fn queue_enable_toggle_is_create_then_destroy() {
        let mut prev = BarSnapshot::with_num_queues(2);
        let mut curr = prev.clone();
        curr.queues[1].enabled = true;
        assert_eq!(diff(&prev, &curr), vec![BarChange::QueueEnabled(1)]);

        prev = curr.clone();
        curr.queues[1].enabled = false;
        assert_eq!(diff(&prev, &curr), vec![BarChange::QueueDisabled(1)]);
    }

    #[test]
    fn reset_detected_from_nonzero_status() {
        let mut prev = BarSnapshot::with_num_queues(1);
        prev.device_status = VIRTIO_CONFIG_S_DRIVER_OK;
        let curr = BarSnapshot::with_num_queues(1);
        assert_eq!(diff(&prev, &curr), vec![BarChange::Reset]);
    }
}
