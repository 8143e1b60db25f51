/// Bounded executor pool
///
/// Admits at most `max_concurrent` runs at once. Further submissions wait in a
/// FIFO queue; when a run finishes (whatever its outcome) its slot is handed
/// straight to the oldest waiter. Admission happens synchronously inside
/// `submit`, so queue order is exactly submission order.

use crate::runtime::executor::{Executor, RunOutcome};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::{sync::oneshot, task::JoinHandle};

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub active: usize,
    pub queued: usize,
    pub max_concurrent: usize,
}

pub struct ExecutorPool {
    executor: Arc<Executor>,
    max_concurrent: usize,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    active: usize,
    waiters: VecDeque<oneshot::Sender<SlotGuard>>,
}

/// An occupied execution slot; dropping it frees or hands over the slot
struct SlotGuard {
    pool: Option<Arc<ExecutorPool>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release();
        }
    }
}

enum Admission {
    Ready(SlotGuard),
    Queued(oneshot::Receiver<SlotGuard>),
}

impl ExecutorPool {
    pub fn new(executor: Arc<Executor>, max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            executor,
            max_concurrent: max_concurrent.max(1),
            state: Mutex::new(PoolState::default()),
        })
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Submit a run for execution
    ///
    /// Starts immediately when a slot is free, otherwise queues. The handle
    /// resolves with the run's outcome once it has been admitted and executed.
    pub fn submit(self: &Arc<Self>, run_id: impl Into<String>) -> JoinHandle<Result<RunOutcome>> {
        let run_id = run_id.into();
        let admission = self.admit();
        let pool = Arc::clone(self);

        tokio::spawn(async move {
            let _slot = match admission {
                Admission::Ready(slot) => slot,
                Admission::Queued(ready) => {
                    tracing::debug!("⏳ Run {} queued for an executor slot", run_id);
                    ready.await.map_err(|_| anyhow!("executor pool dropped queued run {}", run_id))?
                }
            };

            let outcome = pool.executor.execute_run(&run_id).await;
            match &outcome {
                Ok(outcome) => tracing::debug!("🏁 Run {} finished: {:?}", run_id, outcome),
                Err(e) => tracing::error!("❌ Run {} aborted: {}", run_id, e),
            }
            outcome
        })
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.lock();
        PoolStatus {
            active: state.active,
            queued: state.waiters.len(),
            max_concurrent: self.max_concurrent,
        }
    }

    fn admit(self: &Arc<Self>) -> Admission {
        let mut state = self.lock();
        if state.active < self.max_concurrent {
            state.active += 1;
            Admission::Ready(SlotGuard {
                pool: Some(Arc::clone(self)),
            })
        } else {
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            Admission::Queued(receiver)
        }
    }

    /// Hand a freed slot to the oldest live waiter, or give it back
    fn release(self: &Arc<Self>) {
        loop {
            let waiter = {
                let mut state = self.lock();
                match state.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        state.active = state.active.saturating_sub(1);
                        return;
                    }
                }
            };

            let slot = SlotGuard {
                pool: Some(Arc::clone(self)),
            };
            match waiter.send(slot) {
                Ok(()) => return,
                // Waiter went away; keep the slot for the next one
                Err(mut slot) => {
                    slot.pool = None;
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ExecutorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorPool").field("status", &self.status()).finish()
    }
}
