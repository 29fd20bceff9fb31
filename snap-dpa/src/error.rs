use thiserror::Error;

#[derive(Debug, Error)]
pub enum DpaError {
    #[error("mailbox command timed out waiting for acknowledgement")]
    MailboxTimeout,
    #[error("p2p channel out of credits")]
    OutOfCredits,
    #[error("dpa thread not initialized")]
    NotInitialized,
    #[error("unexpected response status {0}")]
    UnexpectedStatus(u32),
    #[error("virtqueue offload error: {0}")]
    Virtq(#[from] snap_virtq::VirtqError),
}

pub type DpaResult<T> = Result<T, DpaError>;
