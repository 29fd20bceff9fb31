//! Queue-pair / CQ abstraction.
//!
//! The real object here is a pair of mlx5 SQ/RQ/CQ/doorbell-record
//! structures created through one of three firmware paths (plain verbs,
//! direct-verbs/devx, or GGA). Those creation paths differ only in how
//! the WQE and CQE rings are mapped and rung, not in the data they carry,
//! so we model them as one `QueuePairAttrs` struct tagged with the
//! method that built it.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpCreationMethod {
    Verbs,
    DirectVerbs,
    Devx,
}

static NEXT_QP_NUM: AtomicU32 = AtomicU32::new(1);

/// Low-level attributes of one queue pair: WQE ring depths, the method
/// used to create it, and the QP number a firmware object needs in
/// order to address it.
#[derive(Debug, Clone, Copy)]
pub struct QueuePairAttrs {
    pub qp_num: u32,
    pub sq_wqe_count: u32,
    pub rq_wqe_count: u32,
    pub creation_method: QpCreationMethod,
}

fn next_qp_num() -> u32 {
    NEXT_QP_NUM.fetch_add(1, Ordering::Relaxed)
}

pub fn create_queue_pair(
    method: QpCreationMethod,
    sq_wqe_count: u32,
    rq_wqe_count: u32,
) -> QueuePairAttrs {
    QueuePairAttrs {
        qp_num: next_qp_num(),
        sq_wqe_count,
        rq_wqe_count,
        creation_method: method,
    }
}

/// A connected pair: the software QP drives the data plane and is owned
/// by the [`crate::dma_queue::DmaQueue`]; the firmware QP is handed to
/// the virtio emulation object so the device can tunnel requests to us.
#[derive(Debug, Clone, Copy)]
pub struct QueuePairHandles {
    pub sw_qp: QueuePairAttrs,
    pub fw_qp: QueuePairAttrs,
}

pub fn create_queue_pair_pair(
    method: QpCreationMethod,
    sq_wqe_count: u32,
    rq_wqe_count: u32,
) -> QueuePairHandles {
    QueuePairHandles {
        sw_qp: create_queue_pair(method, sq_wqe_count, rq_wqe_count),
        fw_qp: create_queue_pair(method, sq_wqe_count, rq_wqe_count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qp_numbers_are_unique() {
        let a = create_queue_pair(QpCreationMethod::Verbs, 128, 128);
        let b = create_queue_pair(QpCreationMethod::Verbs, 128, 128);
        assert_ne!(a.qp_num, b.qp_num);
    }
}
