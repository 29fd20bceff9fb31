//! Virtqueue state machines and the polling-group scheduler.

pub mod backend;
pub mod command;
pub mod desc;
pub mod dirty;
pub mod error;
pub mod poll_group;
pub mod queue;
pub mod stats;
pub mod zcopy;

pub use backend::{BackendCompletion, BackendStatus, BlockBackend, FsBackend, IoSegment};
pub use command::{
    BlkHeader, BlkRequestType, CmdState, QueueKind, VirtqCommand, VIRTIO_BLK_S_IOERR,
    VIRTIO_BLK_S_OK, VIRTIO_BLK_S_UNSUPP,
};
pub use desc::{TunnelComp, TunnelReqHeader, VringDesc};
pub use dirty::{used_ring_dirty_len, DirtyPageSink, NullDirtySink};
pub use error::{VirtqError, VirtqResult};
pub use poll_group::{PollingGroupCtx, PollingGroupPool};
pub use queue::{VirtqAttrs, Virtqueue, VqState, SCRATCH_SLOT_SIZE};
pub use stats::VirtqStats;
pub use zcopy::{FakeIovKey, FakeIovTable};
