//! Virtio controller lifecycle, BAR diffing, and migration-state layout.

pub mod bar;
pub mod controller;
pub mod error;
pub mod fw_queue;
pub mod lifecycle;
pub mod migration_state;

pub use bar::{BarChange, BarSnapshot, QueueAttr};
pub use controller::{Controller, ControllerCallbacks};
pub use error::{CtrlError, CtrlResult};
pub use fw_queue::FwVirtq;
pub use lifecycle::CtrlState;
pub use migration_state::{DeviceCfg, MigrationState, PciCommonCfg, QueueCfg};
