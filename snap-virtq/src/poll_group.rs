//! Polling-group scheduler.
//!
//! Each polling group is one worker thread's progress loop; virtqueues
//! are assigned to a group once, at creation, and ride with it for their
//! whole lifetime. Assignment only needs to balance load and be cheap —
//! actually running the per-group thread loop (`loop { for vq in
//! assigned { vq.progress() } }`) belongs to the controller that owns
//! the concrete virtqueue types (`snap-ctrl`), since `Virtqueue<M>` is
//! generic and a pool can't hold a `Vec<Virtqueue<M>>` for an unknown
//! `M`/backend pair.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

pub struct PollingGroupCtx {
    pub id: u32,
    queue_count: AtomicUsize,
}

impl PollingGroupCtx {
    pub fn load(&self) -> usize {
        self.queue_count.load(Ordering::Relaxed)
    }
}

/// A fixed pool of `N` polling groups, one per worker thread. `assign`
/// hands new virtqueues to whichever group currently has the fewest,
/// which is what "round-robin assignment" degenerates to once groups
/// can also lose queues via `release`.
pub struct PollingGroupPool {
    groups: Vec<PollingGroupCtx>,
    // Guards the multi-step "find min, then increment" read-modify-write
    // so two concurrent assigns can't both land on the same group.
    lock: Mutex<()>,
}

impl PollingGroupPool {
    pub fn new(num_groups: u32) -> Self {
        assert!(num_groups > 0, "a polling group pool needs at least one group");
        PollingGroupPool {
            groups: (0..num_groups)
            .map(|id| PollingGroupCtx { id, queue_count: AtomicUsize::new(0) })
            .collect(),
            lock: Mutex::new(()),
        }
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn assign(&self) -> u32 {
        let _guard = self.lock.lock();
        let group = self
        .groups
        .iter()
        .min_by_key(|g| g.load())
        .expect("pool has at least one group");
        group.queue_count.fetch_add(1, Ordering::Relaxed);
        group.id
    }

    pub fn release(&self, pg_id: u32) {
        let _guard = self.lock.lock();
        if let Some(group) = self.groups.iter().find(|g| g.id == pg_id) {
            group.queue_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn load(&self, pg_id: u32) -> Option<usize> {
        self.groups.iter().find(|g| g.id == pg_id).map(|g| g.load())
    }
}
