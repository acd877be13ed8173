// Copyright (c) 2023 Espresso Systems (espressosys.com)
// This file is part of the sequencer-example-l2 repository.

// You should have received a copy of the MIT License
// along with the sequencer-example-l2 repository. If not, see <https://mit-license.org/>.

//! The single lock that serializes every operation touching a service's in-memory ledger.
//!
//! Waiters are served strictly in arrival order: on release the permit is handed directly to the
//! oldest waiter instead of being put up for grabs, so no caller starves under sustained load.
//! The guard is held across L1 and HTTP calls; callers suspend on [`Gate::acquire`] without
//! occupying a worker thread.

use async_std::sync::{Mutex, MutexGuard};
use futures::channel::oneshot;
use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    sync::{Mutex as SyncMutex, MutexGuard as SyncMutexGuard, PoisonError},
};

#[derive(Debug, Default)]
struct Permits {
    busy: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// A fair, non-reentrant async lock owning the data it protects.
#[derive(Debug)]
pub struct Gate<T> {
    permits: SyncMutex<Permits>,
    // Never contended: only the permit holder locks it.
    data: Mutex<T>,
}

impl<T> Gate<T> {
    pub fn new(data: T) -> Self {
        Self {
            permits: SyncMutex::new(Permits::default()),
            data: Mutex::new(data),
        }
    }

    /// Non-blocking probe used by periodic tasks to skip a tick instead of piling up.
    pub fn is_busy(&self) -> bool {
        self.permits().busy
    }

    pub async fn acquire(&self) -> GateGuard<'_, T> {
        loop {
            let rx = {
                let mut permits = self.permits();
                if !permits.busy {
                    permits.busy = true;
                    break;
                }
                let (tx, rx) = oneshot::channel();
                permits.waiters.push_back(tx);
                rx
            };
            let mut ticket = Ticket {
                gate: self,
                rx,
                granted: false,
            };
            if ticket.wait().await {
                break;
            }
        }
        // From here on the permit is ours, even if this future is dropped mid-lock.
        let permit = Permit { gate: self };
        GateGuard {
            data: self.data.lock().await,
            _permit: permit,
        }
    }

    fn permits(&self) -> SyncMutexGuard<'_, Permits> {
        self.permits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands the permit to the oldest live waiter, or frees it.
    fn release(&self) {
        let mut permits = self.permits();
        while let Some(waiter) = permits.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return;
            }
        }
        permits.busy = false;
    }
}

/// A queued acquisition. Dropping it before the permit arrives (e.g. a cancelled request)
/// leaves the queue; if the permit was already handed over it is passed on.
struct Ticket<'a, T> {
    gate: &'a Gate<T>,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl<T> Ticket<'_, T> {
    async fn wait(&mut self) -> bool {
        self.granted = (&mut self.rx).await.is_ok();
        self.granted
    }
}

impl<T> Drop for Ticket<'_, T> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.rx.close();
        if let Ok(Some(())) = self.rx.try_recv() {
            self.gate.release();
        }
    }
}

/// Exclusive access to the gated data. Dropping the guard releases the gate on every exit
/// path, including early returns through `?`.
pub struct GateGuard<'a, T> {
    // Declared first so the data is unlocked before the permit moves on.
    data: MutexGuard<'a, T>,
    _permit: Permit<'a, T>,
}

struct Permit<'a, T> {
    gate: &'a Gate<T>,
}

impl<T> Drop for Permit<'_, T> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

impl<T> Deref for GateGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for GateGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::{sync::Arc, task};
    use futures::FutureExt;
    use std::time::Duration;

    #[async_std::test]
    async fn test_is_busy_and_release() {
        let gate = Gate::new(0u32);
        assert!(!gate.is_busy());
        {
            let mut guard = gate.acquire().await;
            *guard += 1;
            assert!(gate.is_busy());
        }
        assert!(!gate.is_busy());
        assert_eq!(*gate.acquire().await, 1);
    }

    #[async_std::test]
    async fn test_waiters_are_served_in_arrival_order() {
        let gate = Arc::new(Gate::new(Vec::new()));
        let guard = gate.acquire().await;

        let mut handles = vec![];
        for i in 0..5 {
            let task_gate = gate.clone();
            handles.push(task::spawn(async move {
                task_gate.acquire().await.push(i);
            }));
            // Let the task enqueue itself before spawning the next one.
            while gate.permits().waiters.len() <= i {
                task::sleep(Duration::from_millis(1)).await;
            }
        }
        drop(guard);
        for handle in handles {
            handle.await;
        }
        assert_eq!(*gate.acquire().await, vec![0, 1, 2, 3, 4]);
    }

    #[async_std::test]
    async fn test_cancelled_waiter_does_not_leak_permit() {
        let gate = Gate::new(());
        let guard = gate.acquire().await;
        {
            // Poll once so the waiter is queued, then drop it.
            let mut pending = Box::pin(gate.acquire());
            assert!((&mut pending).now_or_never().is_none());
        }
        drop(guard);
        assert!(!gate.is_busy());
        let _guard = gate.acquire().await;
        assert!(gate.is_busy());
    }

    #[async_std::test]
    async fn test_released_on_error_path() {
        async fn failing(gate: &Gate<u8>) -> Result<(), &'static str> {
            let _guard = gate.acquire().await;
            Err::<(), _>("boom")?;
            Ok(())
        }
        let gate = Gate::new(0);
        assert!(failing(&gate).await.is_err());
        assert!(!gate.is_busy());
    }
}
