//! Single-holder lock gate with a safety-timeout release.
//!
//! Mutating driver operations take the gate before entering the driver and
//! the event ingress releases it when the confirming lifecycle event lands.
//! Some drivers never deliver that event; the safety timer guarantees the
//! agent cannot wedge.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

struct LockState {
    locked: bool,
    release: Option<JoinHandle<()>>,
}

/// The per-VM mutual-exclusion guard around mutating operations.
///
/// Deliberately a single boolean with a timeout, not a counting semaphore;
/// the mutual-exclusion invariant depends on it.
pub struct LockGate {
    weak: Weak<LockGate>,
    max_hold: Duration,
    state: Mutex<LockState>,
}

impl LockGate {
    pub fn new(max_hold: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            max_hold,
            state: Mutex::new(LockState {
                locked: false,
                release: None,
            }),
        })
    }

    /// Acquire the gate unconditionally and schedule the safety release.
    pub fn lock(&self) {
        info!("acquiring lock");
        let mut state = self.state.lock().expect("lock state poisoned");
        if let Some(previous) = state.release.take() {
            previous.abort();
        }
        state.locked = true;
        state.release = Some(self.spawn_release());
    }

    /// Atomically check-and-acquire. Returns false when already held.
    pub fn try_lock(&self) -> bool {
        let mut state = self.state.lock().expect("lock state poisoned");
        if state.locked {
            return false;
        }
        info!("acquiring lock");
        state.locked = true;
        state.release = Some(self.spawn_release());
        true
    }

    /// Release the gate and cancel the pending safety release.
    pub fn unlock(&self) {
        let mut state = self.state.lock().expect("lock state poisoned");
        if state.locked {
            info!("releasing lock");
        }
        state.locked = false;
        if let Some(release) = state.release.take() {
            release.abort();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().expect("lock state poisoned").locked
    }

    fn spawn_release(&self) -> JoinHandle<()> {
        let gate = self.weak.clone();
        let max_hold = self.max_hold;
        tokio::spawn(async move {
            tokio::time::sleep(max_hold).await;
            if let Some(gate) = gate.upgrade() {
                warn!(
                    max_hold_secs = max_hold.as_secs(),
                    "lock held past the safety timeout, releasing"
                );
                gate.unlock();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn lock_and_unlock() {
        let gate = LockGate::new(Duration::from_secs(30));
        assert!(!gate.is_locked());

        gate.lock();
        assert!(gate.is_locked());

        gate.unlock();
        assert!(!gate.is_locked());
    }

    #[tokio::test]
    async fn try_lock_refuses_while_held() {
        let gate = LockGate::new(Duration::from_secs(30));
        assert!(gate.try_lock());
        assert!(!gate.try_lock());

        gate.unlock();
        assert!(gate.try_lock());
    }

    #[tokio::test(start_paused = true)]
    async fn safety_timer_releases_the_gate() {
        let gate = LockGate::new(Duration::from_secs(30));
        gate.lock();
        settle().await;

        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;

        assert!(!gate.is_locked());
        assert!(gate.try_lock());
    }

    #[tokio::test(start_paused = true)]
    async fn unlock_cancels_the_safety_timer() {
        let gate = LockGate::new(Duration::from_secs(30));
        gate.lock();
        gate.unlock();

        // re-acquire and make sure the first (cancelled) timer cannot
        // release the second hold early
        gate.lock();
        settle().await;
        tokio::time::advance(Duration::from_secs(15)).await;
        settle().await;
        assert!(gate.is_locked());

        tokio::time::advance(Duration::from_secs(16)).await;
        settle().await;
        assert!(!gate.is_locked());
    }
}
