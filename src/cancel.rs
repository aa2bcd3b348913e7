//! Cancellation signals and the multi-source combinator.
//!
//! A [`CancelSignal`] carries an aborted flag, a reason, and a set of
//! one-shot listeners. [`combine`] merges any number of signals into one
//! derived signal that aborts as soon as any input does, with leak-free
//! listener lifecycle: the derived side holds only weak references to its
//! inputs, listeners hold only weak references back, and once every input
//! has either fired through or been dropped, every remaining registration
//! on every surviving input is detached.
//!
//! Cancellation is a signal, not an error channel: listener callbacks must
//! not fail, and nothing here retries anything. Timeouts are not built in;
//! a higher layer combines a timer-driven signal with a caller-supplied one
//! through [`combine`].
//!
//! # Examples
//!
//! ```rust
//! use engine_coord::{combine, CancelSignal};
//!
//! let user = CancelSignal::new();
//! let deadline = CancelSignal::new();
//! let merged = combine(&[user.clone(), deadline.clone()]);
//!
//! deadline.abort("deadline elapsed");
//! assert!(merged.aborted());
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};

/// The reason a signal was aborted with. Carries any caller-chosen payload.
pub type Reason = Arc<dyn Any + Send + Sync>;

/// Identifies one listener registration on one signal.
pub type ListenerId = u64;

type Listener = Box<dyn FnOnce(&Reason) + Send>;

struct ListenerEntry {
    id: ListenerId,
    callback: Listener,
}

struct SignalInner {
    aborted: bool,
    reason: Option<Reason>,
    listeners: Vec<ListenerEntry>,
    /// Tasks parked in `cancelled()`. Slots are cleared, never removed, so
    /// each pending future's index stays valid until the abort drains them.
    wakers: Vec<Option<Waker>>,
    next_listener: ListenerId,
}

struct SignalState {
    inner: Mutex<SignalInner>,
}

impl SignalState {
    /// Removes one registration and returns it so the caller can drop it
    /// outside the lock (dropping a listener can re-enter other signals).
    fn take_listener(&self, id: ListenerId) -> Option<ListenerEntry> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .listeners
            .iter()
            .position(|entry| entry.id == id)
            .map(|index| inner.listeners.remove(index))
    }
}

/// A cancellation signal: an aborted flag, a reason, and listeners.
///
/// Cloning yields another handle to the same signal, so any holder may
/// observe the abort, and any holder may trigger it.
#[derive(Clone)]
pub struct CancelSignal {
    state: Arc<SignalState>,
}

impl CancelSignal {
    /// Creates a signal that has not been aborted.
    pub fn new() -> Self {
        Self {
            state: Arc::new(SignalState {
                inner: Mutex::new(SignalInner {
                    aborted: false,
                    reason: None,
                    listeners: Vec::new(),
                    wakers: Vec::new(),
                    next_listener: 0,
                }),
            }),
        }
    }

    /// Aborts the signal with `reason`, firing every listener exactly once
    /// and waking every task parked in [`cancelled`](CancelSignal::cancelled).
    /// Only the first abort takes effect; later calls are no-ops.
    pub fn abort<R>(&self, reason: R)
    where
        R: Any + Send + Sync,
    {
        self.abort_reason(Arc::new(reason));
    }

    fn abort_reason(&self, reason: Reason) {
        let (listeners, wakers) = {
            let mut inner = self.state.inner.lock().unwrap();
            if inner.aborted {
                return;
            }
            inner.aborted = true;
            inner.reason = Some(reason.clone());
            tracing::debug!(
                listeners = inner.listeners.len(),
                "cancellation signal aborted"
            );
            (
                mem::take(&mut inner.listeners),
                mem::take(&mut inner.wakers),
            )
        };
        // Listeners run after the lock is dropped; they may touch other
        // signals (propagation, teardown) or this one again.
        for entry in listeners {
            (entry.callback)(&reason);
        }
        for waker in wakers.into_iter().flatten() {
            waker.wake();
        }
    }

    /// Returns `true` once the signal has been aborted.
    pub fn aborted(&self) -> bool {
        self.state.inner.lock().unwrap().aborted
    }

    /// The abort reason, once aborted.
    pub fn reason(&self) -> Option<Reason> {
        self.state.inner.lock().unwrap().reason.clone()
    }

    /// Registers a one-shot listener fired on abort.
    ///
    /// If the signal is already aborted the listener fires immediately, on
    /// this call, with the stored reason; the returned id is then already
    /// detached.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: FnOnce(&Reason) + Send + 'static,
    {
        let mut inner = self.state.inner.lock().unwrap();
        let id = inner.next_listener;
        inner.next_listener += 1;
        if inner.aborted {
            // Aborted signals always carry a reason.
            let reason = inner.reason.clone();
            drop(inner);
            if let Some(reason) = reason {
                listener(&reason);
            }
        } else {
            inner.listeners.push(ListenerEntry {
                id,
                callback: Box::new(listener),
            });
        }
        id
    }

    /// Detaches a listener. Removing an id that already fired, was already
    /// removed, or never existed is a no-op.
    pub fn remove_listener(&self, id: ListenerId) {
        let _detached = self.state.take_listener(id);
    }

    /// Number of listeners currently registered. Used by callers asserting
    /// leak-freedom after combined signals tear down.
    pub fn listener_count(&self) -> usize {
        self.state.inner.lock().unwrap().listeners.len()
    }

    /// Waits for the signal to be aborted. Resolves immediately if it
    /// already was.
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            signal: self.clone(),
            slot: None,
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.state.inner.lock().unwrap();
        f.debug_struct("CancelSignal")
            .field("aborted", &inner.aborted)
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

/// Future returned by [`CancelSignal::cancelled`].
pub struct Cancelled {
    signal: CancelSignal,
    slot: Option<usize>,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.signal.state.inner.lock().unwrap();
        if inner.aborted {
            return Poll::Ready(());
        }
        match self.slot {
            // Slots are only appended until the abort drains them, so the
            // index stays valid while we are pending.
            Some(index) => {
                let slot = &mut inner.wakers[index];
                let needs_update = slot
                    .as_ref()
                    .map(|w| !w.will_wake(cx.waker()))
                    .unwrap_or(true);
                if needs_update {
                    *slot = Some(cx.waker().clone());
                }
            }
            None => {
                inner.wakers.push(Some(cx.waker().clone()));
                let index = inner.wakers.len() - 1;
                drop(inner);
                self.slot = Some(index);
            }
        }
        Poll::Pending
    }
}

impl Drop for Cancelled {
    fn drop(&mut self) {
        // Clear the parked waker so a long-lived, never-aborted signal does
        // not accumulate one per abandoned wait.
        if let Some(index) = self.slot {
            let mut inner = self.signal.state.inner.lock().unwrap();
            if let Some(slot) = inner.wakers.get_mut(index) {
                *slot = None;
            }
        }
    }
}

/// Bookkeeping shared by all listeners a [`combine`] call registered.
struct Follow {
    derived: Weak<SignalState>,
    /// Which listener lives on which input, for teardown.
    registrations: Mutex<Vec<(Weak<SignalState>, ListenerId)>>,
    /// Inputs that have neither fired through nor been dropped yet.
    remaining: AtomicUsize,
}

impl Follow {
    /// First input to abort carries its reason over to the derived signal.
    fn propagate(&self, reason: &Reason) {
        tracing::trace!("cancellation propagating to combined signal");
        if let Some(state) = self.derived.upgrade() {
            CancelSignal { state }.abort_reason(reason.clone());
        }
        // The derived signal's own abort listener tears down eagerly; this
        // covers the case where the derived side is already gone.
        self.teardown();
    }

    /// Called from the registration guard when an input fires through or is
    /// dropped without firing.
    fn input_done(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.teardown();
        }
    }

    /// Detaches every remaining registration from every surviving input.
    ///
    /// Drains the registration table, so running it again (from a second
    /// propagation off a duplicate input, or from the live-count reaching
    /// zero afterwards) finds nothing left to do.
    fn teardown(&self) {
        let registrations = mem::take(&mut *self.registrations.lock().unwrap());
        if registrations.is_empty() {
            return;
        }
        tracing::trace!(
            registrations = registrations.len(),
            "combined signal detaching input listeners"
        );
        for (input, id) in registrations {
            if let Some(state) = input.upgrade() {
                // Dropped outside the input's lock; the entry's guard may
                // re-enter `input_done`.
                let _detached = state.take_listener(id);
            }
        }
    }
}

/// Decrements the live-input count when its listener is consumed (fired) or
/// discarded (input dropped, or registration detached during teardown).
struct FollowGuard {
    follow: Arc<Follow>,
}

impl Drop for FollowGuard {
    fn drop(&mut self) {
        self.follow.input_done();
    }
}

/// Merges independent cancellation signals into one derived signal.
///
/// - If any input is already aborted, the result is immediately aborted
///   with that input's reason and no listener is attached to any input.
/// - Otherwise the first input to abort propagates its reason to the
///   derived signal, synchronously and immediately.
/// - Once the derived signal aborts, through an input or directly by a
///   holder, every listener is detached from every input right away.
/// - Inputs are referenced weakly; an input dropped without ever firing is
///   counted off, and when no input remains the bookkeeping is released
///   even though the derived signal itself stays alive for its holders.
/// - Dropping every holder of the derived signal does not detach the input
///   listeners by itself; each stays registered until its input fires or is
///   dropped, and firing then does nothing beyond the detach.
/// - An empty slice yields a signal that never aborts on its own, with no
///   bookkeeping at all. Duplicate inputs get independent registrations and
///   cannot cause double propagation.
pub fn combine(signals: &[CancelSignal]) -> CancelSignal {
    let derived = CancelSignal::new();
    for signal in signals {
        let already = {
            let inner = signal.state.inner.lock().unwrap();
            if inner.aborted { inner.reason.clone() } else { None }
        };
        if let Some(reason) = already {
            derived.abort_reason(reason);
            return derived;
        }
    }
    if signals.is_empty() {
        return derived;
    }

    tracing::trace!(inputs = signals.len(), "combining cancellation signals");
    let follow = Arc::new(Follow {
        derived: Arc::downgrade(&derived.state),
        registrations: Mutex::new(Vec::with_capacity(signals.len())),
        remaining: AtomicUsize::new(signals.len()),
    });

    for signal in signals {
        let guard = FollowGuard {
            follow: follow.clone(),
        };
        let f = follow.clone();
        let id = signal.add_listener(move |reason| {
            let _guard = guard;
            f.propagate(reason);
        });
        follow
            .registrations
            .lock()
            .unwrap()
            .push((Arc::downgrade(&signal.state), id));
    }

    // Eager teardown on any abort of the derived signal itself. Registered
    // last: if an input raced us and aborted the derived signal during the
    // loop above, this fires immediately and sweeps the stragglers.
    let f = follow.clone();
    derived.add_listener(move |_| f.teardown());

    derived
}
