use thiserror::Error;

/// Error taxonomy for the DMA queue, mirroring the negative-errno contract
/// of `snap_dma_q_write`/`snap_dma_q_read`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DmaError {
    /// No send credit for this operation; caller should retry once a
    /// completion frees one up. Maps to `-EAGAIN`.
    #[error("no tx credit available")]
    Again,

    /// Malformed argument (oversized inline payload, zero length, etc).
    /// Maps to `-EINVAL`.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// The active backend cannot perform this operation. Maps to
    /// `-ENOTSUP`.
    #[error("operation not supported by backend")]
    NotSupported,

    /// A WQE failed after a prior WQE on the same chain succeeded and the
    /// error cannot be retried. The owning queue is marked fatal.
    #[error("fatal queue-pair error: {0}")]
    Fatal(String),

    /// The referenced rkey/lkey has no registered host-memory region.
    #[error("unknown memory key {0}")]
    UnknownKey(u32),

    /// Attempted to access memory outside the bounds of a registered
    /// region.
    #[error("out-of-bounds access at offset {offset} len {len} region size {region_size}")]
    OutOfBounds {
        offset: u64,
        len: u64,
        region_size: u64,
    },
}

pub type DmaResult<T> = Result<T, DmaError>;
