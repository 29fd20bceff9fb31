use thiserror::Error;

#[derive(Debug, Error)]
pub enum CtrlError {
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: crate::lifecycle::CtrlState, to: crate::lifecycle::CtrlState },
    #[error("queue index {0} out of range")]
    QueueIndexOutOfRange(u16),
    #[error("queue {0} already exists")]
    QueueAlreadyExists(u16),
    #[error("restore attempted outside the suspended state")]
    RestoreRequiresSuspended,
    #[error("migration state is malformed: {0}")]
    MalformedState(#[from] serde_json::Error),
    #[error("migration state section count mismatch: expected {expected} queues, got {got}")]
    SectionMismatch { expected: usize, got: usize },
    #[error("virtqueue error: {0}")]
    Virtq(#[from] snap_virtq::VirtqError),
}

pub type CtrlResult<T> = Result<T, CtrlError>;
