//! Bit-exact live-migration state layout:
//! `<global_hdr> (<section_hdr> <section>)*` with three mandatory
//! sections, `pci_common_cfg`, `queue_cfg[num_queues]`, `device_cfg`.
//!
//! The wire format itself is owned by `snap-migration` (§4.5 READ_STATE /
//! WRITE_STATE); this module only defines the sections' shape and how
//! they're produced from / applied to a controller, matching the
//! original's `snap_virtio_ctrl_state` / `snap_virtio_ctrl_queue_state`
//! split between controller-wide and per-queue fields.

use serde::{Deserialize, Serialize};

use crate::bar::QueueAttr;
use crate::lifecycle::CtrlState;

/// Controller-wide config space plus the state enum, serialized once per
/// migration state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PciCommonCfg {
    pub device_feature_select: u32,
    pub device_feature: u32,
    pub driver_feature_select: u32,
    pub driver_feature: u32,
    pub msix_config: u16,
    pub num_queues: u16,
    pub device_status: u8,
    pub config_generation: u8,
    pub ctrl_state: CtrlState,
}

/// Per-queue BAR attributes plus the two indexes the hardware (or, in
/// this crate, `Virtqueue`) actually observed, so a restore can replay
/// exactly the descriptors the driver thinks are still outstanding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueCfg {
    pub attr: QueueAttr,
    pub hw_available_index: u16,
    pub hw_used_index: u16,
}

/// Type-specific payload (e.g. virtio-blk's `capacity`/`blk_size`); this
/// crate treats it as an opaque byte blob owned by the caller.
pub type DeviceCfg = Vec<u8>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationState {
    pub pci_common_cfg: PciCommonCfg,
    pub queue_cfg: Vec<QueueCfg>,
    pub device_cfg: DeviceCfg,
}

impl Serialize for CtrlState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
    S: serde::Serializer,
    {
        let tag: u8 = match self {
            CtrlState::Stopped => 0,
            CtrlState::Started => 1,
            CtrlState::Suspending => 2,
            CtrlState::Suspended => 3,
        };
        serializer.serialize_u8(tag)
    }
}

impl<'de> Deserialize<'de> for CtrlState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
    D: serde::Deserializer<'de>,
    {
        let tag = u8::deserialize(deserializer)?;
        match tag {
            0 => Ok(CtrlState::Stopped),
            1 => Ok(CtrlState::Started),
            2 => Ok(CtrlState::Suspending),
            3 => Ok(CtrlState::Suspended),
            other => Err(serde::de::Error::custom(format!("unknown ctrl state tag {other}"))),
        }
    }
}

impl MigrationState {
    /// Serializes to the bytes that go over `READ_STATE`'s RDMA write.
    /// The wire format is JSON rather than the original's packed C
    /// struct layout: the byte-for-byte layout is owned by the transport
    /// (`snap-migration`), this type only needs a stable, round-trippable
    /// encoding of the three sections.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("migration state sections are always serializable")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MigrationState {
        MigrationState {
            pci_common_cfg: PciCommonCfg {
                device_feature_select: 0,
                device_feature: 0x7,
                driver_feature_select: 0,
                driver_feature: 0x7,
                msix_config: 0,
                num_queues: 2,
                device_status: 0x0f,
                config_generation: 1,
                ctrl_state: CtrlState::Suspended,
            },
            queue_cfg: vec![
                QueueCfg { attr: QueueAttr::default(), hw_available_index: 3, hw_used_index: 3 },
                QueueCfg { attr: QueueAttr::default(), hw_available_index: 0, hw_used_index: 0 },
            ],
            device_cfg: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn round_trips_through_bytes() {
        let state = sample();
        let bytes = state.to_bytes();
        let restored = MigrationState::from_bytes(&bytes).unwrap();
        assert_eq!(restored.pci_common_cfg.ctrl_state, CtrlState::Suspended);
        assert_eq!(restored.queue_cfg.len(), 2);
        assert_eq!(restored.queue_cfg[0].hw_available_index, 3);
        assert_eq!(restored.device_cfg, vec![1, 2, 3, 4]);
    }

    #[test]
    fn rejects_garbage_bytes() {
        assert!(MigrationState::from_bytes(b"not json").is_err());
    }
}
