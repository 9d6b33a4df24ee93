//! Single-flight admission gates.
//!
//! A gate admits at most one holder at a time and never blocks: callers that
//! lose the race get `None` back immediately and fall back to cached output
//! (canvas execution) or a busy rejection (matting). Release happens when the
//! permit drops, so early returns and panics cannot wedge the gate shut.

use std::sync::atomic::{AtomicBool, Ordering};

pub struct ExecutionGate {
    busy: AtomicBool,
}

impl ExecutionGate {
    pub const fn new() -> Self {
        Self { busy: AtomicBool::new(false) }
    }

    /// Attempt to enter. `None` means another holder is active.
    pub fn try_enter(&self) -> Option<ExecutionPermit<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ExecutionPermit { gate: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Default for ExecutionGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for the duration of the admitted work; releases the gate on drop.
pub struct ExecutionPermit<'a> {
    gate: &'a ExecutionGate,
}

impl Drop for ExecutionPermit<'_> {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    #[test]
    fn second_entry_is_refused_until_release() {
        let gate = ExecutionGate::new();
        let permit = gate.try_enter().expect("gate starts open");
        assert!(gate.is_busy());
        assert!(gate.try_enter().is_none());

        drop(permit);
        assert!(!gate.is_busy());
        assert!(gate.try_enter().is_some());
    }

    #[test]
    fn exactly_one_thread_wins_the_race() {
        const THREADS: usize = 8;
        let gate = ExecutionGate::new();
        let admitted = AtomicUsize::new(0);
        let barrier = Barrier::new(THREADS);

        std::thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    barrier.wait();
                    if let Some(_permit) = gate.try_enter() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                        // Hold long enough that every loser has tried.
                        std::thread::sleep(std::time::Duration::from_millis(50));
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn permit_releases_on_panic() {
        let gate = ExecutionGate::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _permit = gate.try_enter().unwrap();
            panic!("worker failed");
        }));
        assert!(result.is_err());
        assert!(!gate.is_busy());
    }
}
