//! Completion handoff from the device's own thread to the scheduler thread.
//!
//! The device callback does exactly one thing: `signal_complete(event)`. The
//! scheduler is the only waiter. The slot is guarded by a mutex + condvar so a
//! signal that lands before the wait begins is never lost, and `abort()` wakes a
//! waiter that would otherwise sleep on a frame that is never coming.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Outcome of a wait on the bridge.
#[derive(Debug, PartialEq, Eq)]
pub enum Wakeup<T> {
    /// A completion was pending; it has been taken out of the slot.
    Completed(T),
    /// `abort()` was called and no completion was pending.
    Aborted,
    /// The bounded wait elapsed with nothing to report.
    TimedOut,
}

#[derive(Debug)]
struct Slot<T> {
    pending: Option<T>,
    aborted: bool,
}

#[derive(Debug)]
pub struct CompletionBridge<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Default for CompletionBridge<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CompletionBridge<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                pending: None,
                aborted: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Publish one completion and wake the waiter.
    ///
    /// At most one request is in flight, so an unconsumed completion being
    /// replaced means the scheduler fell behind; the newer event wins.
    pub fn signal_complete(&self, event: T) {
        let mut slot = self.lock();
        if slot.pending.is_some() {
            log::warn!("completion bridge: replacing an unconsumed completion");
        }
        slot.pending = Some(event);
        drop(slot);
        self.ready.notify_one();
    }

    /// Wake the waiter without a frame. Sticky until the bridge is dropped.
    pub fn abort(&self) {
        let mut slot = self.lock();
        slot.aborted = true;
        drop(slot);
        self.ready.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    /// Block until a completion is pending or the bridge is aborted.
    ///
    /// A pending completion is preferred over an abort so an event that already
    /// arrived is never silently dropped.
    pub fn wait_for_complete(&self) -> Wakeup<T> {
        let mut slot = self.lock();
        loop {
            if let Some(event) = slot.pending.take() {
                return Wakeup::Completed(event);
            }
            if slot.aborted {
                return Wakeup::Aborted;
            }
            slot = self
                .ready
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Like [`wait_for_complete`](Self::wait_for_complete) but gives up after `timeout`.
    pub fn wait_for_complete_timeout(&self, timeout: Duration) -> Wakeup<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            if let Some(event) = slot.pending.take() {
                return Wakeup::Completed(event);
            }
            if slot.aborted {
                return Wakeup::Aborted;
            }
            let now = Instant::now();
            if now >= deadline {
                return Wakeup::TimedOut;
            }
            slot = self
                .ready
                .wait_timeout(slot, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Wait up to `grace` for a pending completion, ignoring any abort.
    ///
    /// Used during teardown to let the last in-flight request resolve.
    pub fn settle(&self, grace: Duration) -> Option<T> {
        let deadline = Instant::now() + grace;
        let mut slot = self.lock();
        loop {
            if let Some(event) = slot.pending.take() {
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = self
                .ready
                .wait_timeout(slot, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_before_wait_is_not_lost() {
        let bridge = CompletionBridge::new();
        bridge.signal_complete(7u32);
        let start = Instant::now();
        assert_eq!(bridge.wait_for_complete(), Wakeup::Completed(7));
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn wait_clears_the_flag() {
        let bridge = CompletionBridge::new();
        bridge.signal_complete(1u32);
        assert_eq!(bridge.wait_for_complete(), Wakeup::Completed(1));
        assert_eq!(
            bridge.wait_for_complete_timeout(Duration::from_millis(20)),
            Wakeup::TimedOut
        );
    }

    #[test]
    fn signal_from_other_thread_wakes_waiter() {
        let bridge = Arc::new(CompletionBridge::new());
        let signaller = bridge.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            signaller.signal_complete("frame");
        });
        assert_eq!(bridge.wait_for_complete(), Wakeup::Completed("frame"));
        handle.join().unwrap();
    }

    #[test]
    fn abort_wakes_waiter_without_frame() {
        let bridge: Arc<CompletionBridge<u32>> = Arc::new(CompletionBridge::new());
        let aborter = bridge.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            aborter.abort();
        });
        let start = Instant::now();
        assert_eq!(bridge.wait_for_complete(), Wakeup::Aborted);
        assert!(start.elapsed() < Duration::from_secs(1));
        handle.join().unwrap();
        assert!(bridge.is_aborted());
    }

    #[test]
    fn pending_completion_wins_over_abort() {
        let bridge = CompletionBridge::new();
        bridge.signal_complete(3u32);
        bridge.abort();
        assert_eq!(bridge.wait_for_complete(), Wakeup::Completed(3));
        assert_eq!(bridge.wait_for_complete(), Wakeup::Aborted);
    }

    #[test]
    fn settle_ignores_abort_and_is_bounded() {
        let bridge: CompletionBridge<u32> = CompletionBridge::new();
        bridge.abort();
        let start = Instant::now();
        assert_eq!(bridge.settle(Duration::from_millis(40)), None);
        assert!(start.elapsed() >= Duration::from_millis(40));

        bridge.signal_complete(9);
        assert_eq!(bridge.settle(Duration::from_millis(40)), Some(9));
    }
}
