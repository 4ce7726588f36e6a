use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::oneshot;

use crate::runtime::types::{RuntimeError, TaskId};

/// RAII guard for one compute slot.
///
/// Dropping it hands the slot straight to the oldest waiter, or back to the
/// pool if nobody is waiting. Callers hold it for the whole generation.
pub struct Permit {
    /// `None` only after the slot was handed over elsewhere.
    gate: Option<Arc<GateInner>>,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit").finish()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}

/// A place in the admission queue.
#[derive(Debug)]
pub struct Ticket {
    task_id: TaskId,
    rx: oneshot::Receiver<Permit>,
}

impl Ticket {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Wait until the gate hands this ticket a permit.
    ///
    /// Fails with [`RuntimeError::Shutdown`] if the gate is closed first.
    pub async fn wait(self) -> Result<Permit, RuntimeError> {
        self.rx.await.map_err(|_| RuntimeError::Shutdown)
    }
}

/// Outcome of [`AdmissionGate::admit`].
#[derive(Debug)]
pub enum Admission {
    /// A slot was free; run now.
    Granted(Permit),
    /// All slots are busy; `position` is 1-based.
    Queued { ticket: Ticket, position: usize },
}

/// Occupancy snapshot reported by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub capacity: usize,
    pub available: usize,
    pub occupied: usize,
    pub waiting: usize,
}

#[derive(Debug)]
struct Waiter {
    task_id: TaskId,
    tx: oneshot::Sender<Permit>,
}

#[derive(Debug)]
struct GateState {
    available: usize,
    waiters: VecDeque<Waiter>,
    closed: bool,
}

#[derive(Debug)]
struct GateInner {
    capacity: usize,
    state: Mutex<GateState>,
}

impl GateInner {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        // A poisoned lock only means a panic elsewhere; the counters are
        // still consistent because every critical section is panic-free.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn release(self: Arc<Self>) {
        let mut state = self.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            let permit = Permit {
                gate: Some(Arc::clone(&self)),
            };
            match waiter.tx.send(permit) {
                Ok(()) => return,
                // The waiter went away; disarm the returned permit so it does
                // not re-enter `release` while the lock is held.
                Err(mut unclaimed) => {
                    unclaimed.gate = None;
                }
            }
        }
        state.available += 1;
    }
}

/// Bounds how many generations may occupy the compute device at once.
///
/// A counting permit pool with a strict first-come, first-served queue: a
/// caller that finds every slot busy is queued in [`Self::admit`] itself, so
/// queue order is submission order regardless of how the runtime schedules
/// the waiting workers afterwards. The gate only throttles; it never touches
/// task state or cleans up resources.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    inner: Arc<GateInner>,
}

impl AdmissionGate {
    /// Create a gate with `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(GateInner {
                capacity,
                state: Mutex::new(GateState {
                    available: capacity,
                    waiters: VecDeque::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// Take a slot if one is free and nobody is queued ahead; otherwise join
    /// the back of the queue. Never blocks.
    pub fn admit(&self, task_id: TaskId) -> Result<Admission, RuntimeError> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(RuntimeError::Shutdown);
        }
        if state.available > 0 && state.waiters.is_empty() {
            state.available -= 1;
            return Ok(Admission::Granted(Permit {
                gate: Some(Arc::clone(&self.inner)),
            }));
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(Waiter { task_id, tx });
        Ok(Admission::Queued {
            ticket: Ticket { task_id, rx },
            position: state.waiters.len(),
        })
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut state = self.inner.lock();
        if state.closed || state.available == 0 || !state.waiters.is_empty() {
            return None;
        }
        state.available -= 1;
        Some(Permit {
            gate: Some(Arc::clone(&self.inner)),
        })
    }

    /// Refuse new admissions and wake every queued ticket with
    /// [`RuntimeError::Shutdown`]. Permits already handed out stay valid.
    pub fn close(&self) {
        let drained: Vec<Waiter> = {
            let mut state = self.inner.lock();
            state.closed = true;
            state.waiters.drain(..).collect()
        };
        drop(drained);
    }

    /// Queue position (1-based) of `task_id`, if it is waiting.
    pub fn position(&self, task_id: TaskId) -> Option<usize> {
        self.inner
            .lock()
            .waiters
            .iter()
            .position(|w| w.task_id == task_id)
            .map(|i| i + 1)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn stats(&self) -> GateStats {
        let state = self.inner.lock();
        GateStats {
            capacity: self.inner.capacity,
            available: state.available,
            occupied: self.inner.capacity - state.available,
            waiting: state.waiters.iter().filter(|w| !w.tx.is_closed()).count(),
        }
    }
}
