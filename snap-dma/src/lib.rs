//! DMA queue and queue-pair primitives: the
//! machinery every virtqueue in `snap-virtq` uses to move bytes between
//! DPU and host memory.

pub mod completion;
pub mod config;
pub mod dma_queue;
pub mod error;
pub mod hostmem;
pub mod qp;
pub mod umr;

pub use completion::{retire_one, Completion, CompletionHandle};
pub use config::{DmaQueueConfig, DoorbellMode, QpMode};
pub use dma_queue::DmaQueue;
pub use error::{DmaError, DmaResult};
pub use hostmem::{HostMemory, SimHostMemory};
