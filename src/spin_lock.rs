// SPDX-License-Identifier: MIT
//
// Adapted from the teacher's `spin_lock.rs` (itself a port of cpp-ipc's
// `ipc::spin_lock`). Backs the cooperative per-channel mutex (spec §4.4's
// `acquire`/`release`), which is explicitly *not* the interrupt-masking
// critical section — it serializes application-level multi-step
// sequences on the same channel and has plain `acquire`/`release` calls
// rather than an RAII guard, matching spec §4.4's API shape.

use std::sync::atomic::{AtomicU32, Ordering};

/// Adaptive backoff: busy spin, then CPU pause, then thread yield, then sleep.
#[inline]
fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(std::time::Duration::from_millis(1));
        return;
    }
    *k += 1;
}

/// A simple spin lock with adaptive backoff and explicit `acquire`/`release`
/// calls (no RAII guard — the channel mutex API in spec §4.4 is
/// acquire/release, not a scope-bound lock).
pub struct ChannelMutex {
    lc: AtomicU32,
}

impl ChannelMutex {
    pub const fn new() -> Self {
        Self { lc: AtomicU32::new(0) }
    }

    pub fn acquire(&self) {
        let mut k = 0u32;
        while self.lc.swap(1, Ordering::Acquire) != 0 {
            adaptive_yield(&mut k);
        }
    }

    pub fn release(&self) {
        self.lc.store(0, Ordering::Release);
    }
}

impl Default for ChannelMutex {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: ChannelMutex is designed for concurrent access from any thread.
unsafe impl Send for ChannelMutex {}
unsafe impl Sync for ChannelMutex {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn acquire_release_round_trip() {
        let m = ChannelMutex::new();
        m.acquire();
        m.release();
        m.acquire();
        m.release();
    }

    #[test]
    fn excludes_concurrent_critical_sections() {
        let m = Arc::new(ChannelMutex::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = Arc::clone(&m);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    m.acquire();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    m.release();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 8000);
    }
}
