//! FIFO asynchronous lock.
//!
//! Serializes access to a shared single-owner resource (the embedded engine)
//! across concurrent async callers. Unlike an ordinary async mutex, the grant
//! order is the order in which `acquire` was *called*, never the order in
//! which the surrounding tasks happen to resume: the queue position is
//! claimed synchronously inside [`FifoLock::acquire`], before the returned
//! future is first polled.
//!
//! There is no built-in timeout. A holder that never releases stalls every
//! later acquirer; pairing the permit with a scoped region (see
//! [`crate::region`]) is the intended way to make release unskippable.
//!
//! # Examples
//!
//! ```rust
//! use engine_coord::FifoLock;
//!
//! # async fn example() -> engine_coord::Result<()> {
//! let lock = FifoLock::new();
//! let permit = lock.acquire().await?;
//! // ... call into the engine ...
//! permit.release();
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::error::{Error, Result};

struct Waiter {
    id: u64,
    waker: Option<Waker>,
}

struct LockState {
    /// Ticket currently holding the lock, if any.
    holder: Option<u64>,
    /// Tickets waiting for the lock, in acquire-call order.
    queue: VecDeque<Waiter>,
    closed: bool,
    next_id: u64,
}

/// An asynchronous lock granting access strictly in `acquire` call order.
///
/// Cloning the lock produces another handle to the same underlying queue.
#[derive(Clone)]
pub struct FifoLock {
    state: Arc<Mutex<LockState>>,
}

impl FifoLock {
    /// Creates a new, unlocked lock.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LockState {
                holder: None,
                queue: VecDeque::new(),
                closed: false,
                next_id: 0,
            })),
        }
    }

    /// Claims the next queue position and returns a future that resolves to
    /// a [`LockPermit`] once every earlier acquirer has released.
    ///
    /// The position is claimed here, synchronously, so two `acquire` calls
    /// issued back to back are granted in that same order regardless of
    /// which task polls first.
    pub fn acquire(&self) -> Acquire {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        let phase = if state.closed {
            Phase::Refused
        } else if state.holder.is_none() && state.queue.is_empty() {
            state.holder = Some(id);
            tracing::trace!(id, "lock granted immediately");
            Phase::Granted
        } else {
            state.queue.push_back(Waiter { id, waker: None });
            tracing::trace!(id, waiting = state.queue.len(), "acquire queued");
            Phase::Queued
        };
        drop(state);
        Acquire {
            lock: self.clone(),
            id,
            phase,
        }
    }

    /// Closes the lock: every queued waiter is woken with [`Error::Closed`]
    /// and later `acquire` calls fail immediately. The current holder, if
    /// any, keeps its permit; releasing after close is a no-op.
    pub fn close(&self) {
        let wakers: Vec<Waker> = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            tracing::debug!(waiters = state.queue.len(), "lock closed");
            state
                .queue
                .drain(..)
                .filter_map(|mut w| w.waker.take())
                .collect()
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Returns `true` while some permit is outstanding.
    pub fn is_locked(&self) -> bool {
        self.state.lock().unwrap().holder.is_some()
    }

    /// Number of acquirers currently queued behind the holder.
    pub fn waiters(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Hands the lock to the next queued ticket, or unlocks it.
    ///
    /// No-op unless `id` is the current holder, which makes release
    /// idempotent from every path (explicit release, permit drop, future
    /// drop after a grant landed).
    fn release_slot(&self, id: u64) {
        let waker = {
            let mut state = self.state.lock().unwrap();
            if state.holder != Some(id) {
                return;
            }
            match state.queue.pop_front() {
                Some(mut next) => {
                    state.holder = Some(next.id);
                    tracing::trace!(from = id, to = next.id, "lock handed off");
                    next.waker.take()
                }
                None => {
                    state.holder = None;
                    tracing::trace!(from = id, "lock released");
                    None
                }
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl Default for FifoLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FifoLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("FifoLock")
            .field("locked", &state.holder.is_some())
            .field("waiters", &state.queue.len())
            .finish()
    }
}

enum Phase {
    /// Granted inside `acquire` (lock was free); not yet observed by poll.
    Granted,
    /// Waiting in the queue.
    Queued,
    /// Lock was already closed when `acquire` was called.
    Refused,
    /// Outcome delivered.
    Done,
}

/// Future returned by [`FifoLock::acquire`].
///
/// Dropping it before completion gives the queue position back; if the grant
/// already landed on it, the grant passes to the next waiter.
pub struct Acquire {
    lock: FifoLock,
    id: u64,
    phase: Phase,
}

impl Acquire {
    fn permit(&self) -> LockPermit {
        LockPermit {
            lock: self.lock.clone(),
            id: self.id,
            released: AtomicBool::new(false),
        }
    }
}

impl Future for Acquire {
    type Output = Result<LockPermit>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.phase {
            Phase::Done => panic!("Acquire polled after completion"),
            Phase::Refused => {
                self.phase = Phase::Done;
                Poll::Ready(Err(Error::Closed))
            }
            Phase::Granted => {
                let permit = self.permit();
                self.phase = Phase::Done;
                Poll::Ready(Ok(permit))
            }
            Phase::Queued => {
                let mut state = self.lock.state.lock().unwrap();
                if state.holder == Some(self.id) {
                    drop(state);
                    let permit = self.permit();
                    self.phase = Phase::Done;
                    return Poll::Ready(Ok(permit));
                }
                if state.closed {
                    drop(state);
                    self.phase = Phase::Done;
                    return Poll::Ready(Err(Error::Closed));
                }
                if let Some(entry) = state.queue.iter_mut().find(|w| w.id == self.id) {
                    let needs_update = entry
                        .waker
                        .as_ref()
                        .map(|w| !w.will_wake(cx.waker()))
                        .unwrap_or(true);
                    if needs_update {
                        entry.waker = Some(cx.waker().clone());
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        match self.phase {
            Phase::Done | Phase::Refused => {}
            Phase::Granted => self.lock.release_slot(self.id),
            Phase::Queued => {
                let granted = {
                    let mut state = self.lock.state.lock().unwrap();
                    if state.holder == Some(self.id) {
                        true
                    } else {
                        state.queue.retain(|w| w.id != self.id);
                        false
                    }
                };
                if granted {
                    self.lock.release_slot(self.id);
                }
            }
        }
    }
}

/// A granted hold on a [`FifoLock`].
///
/// The hold ends when [`release`](LockPermit::release) is called or the
/// permit is dropped, whichever happens first; the other becomes a no-op.
pub struct LockPermit {
    lock: FifoLock,
    id: u64,
    released: AtomicBool,
}

impl LockPermit {
    /// Releases the hold, waking the next queued acquirer.
    ///
    /// Calling this a second time (or dropping the permit afterwards) has no
    /// effect: it does not grant an extra, unpaired hold to a later waiter.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.lock.release_slot(self.id);
        }
    }

    /// Keeps the hold forever, without releasing on drop.
    ///
    /// Every later acquirer will stall; only useful when tearing the shared
    /// resource down for good.
    pub fn forget(self) {
        self.released.store(true, Ordering::Release);
    }
}

impl Drop for LockPermit {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for LockPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockPermit").field("id", &self.id).finish()
    }
}
