use serde::{Deserialize, Serialize};

/// Replaces the `SNAP_DMA_Q_OPMODE` environment variable with an explicit, serializable choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QpMode {
    /// Pick `Gga` if the hardware DMA engine reports qp-support, else
    /// `Dv`, else `Verbs`.
    Autoselect,
    /// Standard verbs API: safest, slowest.
    Verbs,
    /// Direct hardware access to the WQE/CQE rings: faster than verbs.
    DirectVerbs,
    /// Direct-verbs plus the hardware DMA (GGA) engine for bulk
    /// read/write: fastest, best bandwidth.
    Gga,
}

impl Default for QpMode {
    fn default() -> Self {
        QpMode::Autoselect
    }
}

/// Doorbell ringing strategy. `Batch` defers the doorbell write until an
/// explicit flush or until a WQE requests a CQ update, matching the
/// original `RING_BATCH` behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DoorbellMode {
    PerWqe,
    Batch,
}

impl Default for DoorbellMode {
    fn default() -> Self {
        DoorbellMode::PerWqe
    }
}

/// Creation-time configuration for a [`crate::dma_queue::DmaQueue`].
///
/// This is the explicit replacement for the env-var driven defaults
/// (`SNAP_ENV_REG_ENV_VARIABLE`) the original source used; every knob
/// here has a documented default matching the original env var's
/// default behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmaQueueConfig {
    /// Send queue depth of the software QP.
    pub tx_qsize: u32,
    /// Size in bytes of one completion/tunnel message.
    pub tx_elem_size: u32,
    /// Receive queue depth of the software QP.
    pub rx_qsize: u32,
    /// Size in bytes of one receive element.
    pub rx_elem_size: u32,
    pub mode: QpMode,
    pub doorbell_mode: DoorbellMode,
    /// Enables UMR-based scatter/gather key construction (C3).
    pub iov_enable: bool,
    /// Enables the crypto-BSF attachment path on UMR WQEs.
    pub crypto_enable: bool,
    /// Whether a completion channel (event-driven `arm()`/notify) is
    /// requested; otherwise the queue is pure-polling.
    pub comp_channel: bool,
}

impl Default for DmaQueueConfig {
    fn default() -> Self {
        DmaQueueConfig {
            tx_qsize: 256,
            tx_elem_size: 64,
            rx_qsize: 256,
            rx_elem_size: 64,
            mode: QpMode::default(),
            doorbell_mode: DoorbellMode::default(),
            iov_enable: false,
            crypto_enable: false,
            comp_channel: false,
        }
    }
}
