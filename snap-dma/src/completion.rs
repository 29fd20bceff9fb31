use std::sync::{Arc, Mutex};

/// A user-provided handle attached to one or more outstanding DMA
/// operations. Every operation that references a [`Completion`]
/// decrements `count` by one on retirement; the callback fires exactly
/// once, when `count` reaches zero.
///
/// Invariant: `count > 0` while any operation referencing this
/// completion is in flight; the callback never fires twice.
pub struct Completion {
    count: i32,
    callback: Option<Box<dyn FnMut(i32) + Send>>,
}

/// Shared ownership handle: a completion may be attached to multiple
/// outstanding operations across different DMA queues.
pub type CompletionHandle = Arc<Mutex<Completion>>;

impl Completion {
    /// `count` must be positive: it is the number of operations that
    /// must retire before the callback fires.
    pub fn new(count: i32, callback: impl FnMut(i32) + Send + 'static) -> CompletionHandle {
        assert!(count > 0, "completion count must start positive");
        Arc::new(Mutex::new(Completion {
                    count,
                    callback: Some(Box::new(callback)),
        }))
    }

    pub fn remaining(&self) -> i32 {
        self.count
    }
}

/// Retires one operation against `handle` with the given hardware
/// status (0 == success, matching `IBV_WC_SUCCESS`). Fires the callback
/// exactly once when the refcount reaches zero.
pub fn retire_one(handle: &CompletionHandle, status: i32) {
    let mut guard = handle.lock().unwrap();
    debug_assert!(guard.count > 0, "completion retired more times than it was charged");
    guard.count -= 1;
    if guard.count == 0 {
        if let Some(mut cb) = guard.callback.take() {
            // Drop the lock before invoking the callback: it is documented
            // as safe to start new DMA operations from within it, which
            // may re-enter this module.
            drop(guard);
            cb(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_once_when_count_reaches_zero() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let comp = Completion::new(3, move |_status| {
                fired2.fetch_add(1, Ordering::SeqCst);
        });
        retire_one(&comp, 0);
        retire_one(&comp, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        retire_one(&comp, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn single_completion_shared_across_operations() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let comp = Completion::new(2, move |status| {
                assert_eq!(status, 0);
                fired2.fetch_add(1, Ordering::SeqCst);
        });
        let comp_a = comp.clone();
        let comp_b = comp.clone();
        retire_one(&comp_a, 0);
        retire_one(&comp_b, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
