//! Bounded concurrency for downloads, with queue positions reported to waiters.

use super::PipelineError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Receives the number of requests ahead of the waiter
pub type PositionCallback = Arc<dyn Fn(usize) + Send + Sync>;

struct Waiter {
    id: u64,
    on_position: PositionCallback,
}

/// Limits how many downloads run at once.
///
/// Requests that cannot start immediately wait in FIFO order; every change of
/// the waiting line is reported to each waiter as its new position.
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    pool_size: usize,
    waiters: Arc<Mutex<VecDeque<Waiter>>>,
    next_id: AtomicU64,
}

impl AdmissionController {
    /// Create a controller admitting `pool_size` concurrent holders (at least one)
    #[must_use]
    pub fn new(pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            waiters: Arc::new(Mutex::new(VecDeque::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Wait for a slot.
    ///
    /// `on_position` is invoked with the number of requests ahead whenever it
    /// changes, and is never invoked if a slot is free right away.
    ///
    /// # Errors
    ///
    /// Returns `Canceled` if `cancel` fires first (the waiter leaves the line),
    /// or `Closed` if the controller was closed.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
        on_position: PositionCallback,
    ) -> Result<AdmissionSlot, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Canceled);
        }
        // no overtaking while others wait
        if self.waiters.lock().is_empty() {
            if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
                return Ok(AdmissionSlot::new(permit));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.waiters.lock().push_back(Waiter { id, on_position });
        let _guard = WaitGuard {
            id,
            waiters: Arc::clone(&self.waiters),
        };
        broadcast_positions(&self.waiters);
        debug!(waiter = id, "Download slot busy, waiting");

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(PipelineError::Canceled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map(AdmissionSlot::new).map_err(|_| PipelineError::Closed)
            }
        }
    }

    /// Number of requests waiting for a slot
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Number of free slots
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Configured pool size
    #[must_use]
    pub const fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Refuse all pending and future waiters
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// Removes a waiter from the line however `acquire` ends
struct WaitGuard {
    id: u64,
    waiters: Arc<Mutex<VecDeque<Waiter>>>,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        let removed = {
            let mut waiters = self.waiters.lock();
            let before = waiters.len();
            waiters.retain(|w| w.id != self.id);
            before != waiters.len()
        };
        if removed {
            broadcast_positions(&self.waiters);
        }
    }
}

fn broadcast_positions(waiters: &Mutex<VecDeque<Waiter>>) {
    let snapshot: Vec<(usize, PositionCallback)> = waiters
        .lock()
        .iter()
        .enumerate()
        .map(|(ahead, w)| (ahead, Arc::clone(&w.on_position)))
        .collect();
    for (ahead, callback) in snapshot {
        callback(ahead);
    }
}

/// A held download slot; released on drop or explicitly
#[derive(Debug)]
pub struct AdmissionSlot {
    permit: Option<OwnedSemaphorePermit>,
}

impl AdmissionSlot {
    fn new(permit: OwnedSemaphorePermit) -> Self {
        Self {
            permit: Some(permit),
        }
    }

    /// Give the slot back; further calls do nothing
    pub fn release(&mut self) {
        self.permit.take();
    }

    /// Whether the slot is still held
    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.permit.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn recorder() -> (PositionCallback, Arc<Mutex<Vec<usize>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (Arc::new(move |p: usize| sink.lock().push(p)), seen)
    }

    fn silent() -> PositionCallback {
        Arc::new(|_: usize| {})
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn free_slot_is_granted_without_positions() -> Result<(), PipelineError> {
        let ctl = AdmissionController::new(2);
        let (cb, seen) = recorder();
        let slot = ctl.acquire(&CancellationToken::new(), cb).await?;

        assert!(slot.is_held());
        assert_eq!(ctl.available(), 1);
        assert!(seen.lock().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn release_is_idempotent() -> Result<(), PipelineError> {
        let ctl = AdmissionController::new(1);
        let mut slot = ctl.acquire(&CancellationToken::new(), silent()).await?;
        slot.release();
        slot.release();
        drop(slot);

        assert_eq!(ctl.available(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn holders_never_exceed_pool() -> Result<(), PipelineError> {
        let ctl = Arc::new(AdmissionController::new(2));
        let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let ctl = Arc::clone(&ctl);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _slot = ctl.acquire(&CancellationToken::new(), silent()).await?;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, PipelineError>(())
            }));
        }
        for h in handles {
            h.await.expect("join")?;
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(ctl.available(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn waiters_are_served_in_order_with_decreasing_positions() -> Result<(), PipelineError> {
        let ctl = Arc::new(AdmissionController::new(1));
        let mut held = ctl.acquire(&CancellationToken::new(), silent()).await?;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut positions = Vec::new();
        let mut handles = Vec::new();
        for i in 0..3 {
            let (cb, seen) = recorder();
            positions.push(seen);
            let ctl = Arc::clone(&ctl);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let slot = ctl.acquire(&CancellationToken::new(), cb).await?;
                order.lock().push(i);
                drop(slot);
                Ok::<_, PipelineError>(())
            }));
            settle().await;
        }
        assert_eq!(ctl.queue_len(), 3);

        held.release();
        for h in handles {
            h.await.expect("join")?;
        }

        assert_eq!(*order.lock(), vec![0, 1, 2]);
        for seen in positions {
            let seen = seen.lock();
            assert!(seen.windows(2).all(|w| w[1] <= w[0]), "positions {seen:?}");
        }
        assert_eq!(ctl.queue_len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn canceled_waiter_leaves_the_line() -> Result<(), PipelineError> {
        let ctl = Arc::new(AdmissionController::new(1));
        let _held = ctl.acquire(&CancellationToken::new(), silent()).await?;

        let first_cancel = CancellationToken::new();
        let first = {
            let ctl = Arc::clone(&ctl);
            let cancel = first_cancel.clone();
            tokio::spawn(async move { ctl.acquire(&cancel, silent()).await.map(|_| ()) })
        };
        settle().await;

        let (cb, seen) = recorder();
        let second = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move { ctl.acquire(&CancellationToken::new(), cb).await.map(|_| ()) })
        };
        settle().await;
        assert_eq!(ctl.queue_len(), 2);

        first_cancel.cancel();
        assert_eq!(first.await.expect("join"), Err(PipelineError::Canceled));
        settle().await;

        assert_eq!(ctl.queue_len(), 1);
        assert_eq!(seen.lock().last(), Some(&0));
        second.abort();
        Ok(())
    }

    #[tokio::test]
    async fn already_canceled_request_is_refused() {
        let ctl = AdmissionController::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            ctl.acquire(&cancel, silent()).await,
            Err(PipelineError::Canceled)
        ));
    }
}
