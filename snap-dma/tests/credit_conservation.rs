//! Property test for testable property #1: credit
//! conservation. For any sequence of writes interleaved with progress
//! calls, `tx_available + outstanding == sq_wqe_count` must hold.

use proptest::prelude::*;
use snap_dma::{DmaQueue, DmaQueueConfig, SimHostMemory};

fn new_queue(qsize: u32) -> DmaQueue<SimHostMemory> {
    let mut cfg = DmaQueueConfig::default();
    cfg.tx_qsize = qsize;
    DmaQueue::create(cfg, SimHostMemory::new(), false, false)
}

proptest! {
    #[test]
    fn credit_conservation_holds(ops in prop::collection::vec(0u8..3, 0..200)) {
        let qsize = 16u32;
        let mut q = new_queue(qsize);
        let key = q.host_memory().register(4096);
        for op in ops {
            match op {
                0 => {
                    // best-effort write; ignore backpressure (-EAGAIN)
                    let _ = q.write(b"x", 0, key, None);
                }
                1 => {
                    q.progress();
                }
                _ => {
                    q.flush();
                }
            }
            prop_assert_eq!(q.tx_available() + q.outstanding(), qsize as i32);
        }
    }
}
