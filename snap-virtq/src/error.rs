use thiserror::Error;

#[derive(Debug, Error)]
pub enum VirtqError {
    #[error("no free command slot")]
    NoFreeSlot,
    #[error("descriptor chain too long: {0} descriptors")]
    ChainTooLong(usize),
    #[error("dma error: {0}")]
    Dma(#[from] snap_dma::DmaError),
    #[error("virtqueue is fatal")]
    Fatal,
    #[error("unsupported request opcode {0}")]
    UnsupportedOpcode(u32),
}

pub type VirtqResult<T> = Result<T, VirtqError>;
