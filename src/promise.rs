//! Externally-settled futures.
//!
//! Adapts push-style completion events (an inbound message, a one-shot
//! readiness notification, a worker handshake) into awaitable values. The
//! [`Resolver`] half is detached from the awaiting side and may be called
//! from any later point in the program, any number of times: only the first
//! settlement has effect.
//!
//! # Examples
//!
//! ```rust
//! use engine_coord::promise;
//!
//! let (future, resolver) = promise::<u32, String>();
//! assert!(resolver.resolve(7));
//! assert!(!resolver.resolve(8)); // first settlement wins
//! assert!(future.is_settled());
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

struct Cell<T, E> {
    /// Stored settlement, present from first resolve/reject until delivery.
    outcome: Option<Result<T, E>>,
    /// Settlement was handed to the awaiting side.
    delivered: bool,
    waker: Option<Waker>,
}

/// Creates an awaitable value together with its detached settlement handle.
pub fn promise<T, E>() -> (Promise<T, E>, Resolver<T, E>) {
    let cell = Arc::new(Mutex::new(Cell {
        outcome: None,
        delivered: false,
        waker: None,
    }));
    (
        Promise { cell: cell.clone() },
        Resolver { cell },
    )
}

/// The awaitable half: resolves once the matching [`Resolver`] settles.
///
/// Awaited after settlement, it observes the stored outcome immediately.
/// If every `Resolver` is dropped without settling, the promise stays
/// pending forever; that is a caller obligation, same as an unreleased lock.
pub struct Promise<T, E> {
    cell: Arc<Mutex<Cell<T, E>>>,
}

impl<T, E> Promise<T, E> {
    /// Returns `true` once a settlement has been recorded.
    pub fn is_settled(&self) -> bool {
        let cell = self.cell.lock().unwrap();
        cell.delivered || cell.outcome.is_some()
    }
}

impl<T, E> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut cell = self.cell.lock().unwrap();
        if let Some(outcome) = cell.outcome.take() {
            cell.delivered = true;
            return Poll::Ready(outcome);
        }
        if cell.delivered {
            panic!("Promise polled after completion");
        }
        let needs_update = cell
            .waker
            .as_ref()
            .map(|w| !w.will_wake(cx.waker()))
            .unwrap_or(true);
        if needs_update {
            cell.waker = Some(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// The settlement half of a [`promise`]. Cloneable; first call wins.
pub struct Resolver<T, E> {
    cell: Arc<Mutex<Cell<T, E>>>,
}

impl<T, E> Resolver<T, E> {
    /// Fulfills the promise. Returns `true` if this call settled it,
    /// `false` if a settlement already happened (the value is discarded).
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Fails the promise. Returns `true` if this call settled it,
    /// `false` if a settlement already happened (the error is discarded).
    pub fn reject(&self, error: E) -> bool {
        self.settle(Err(error))
    }

    /// Returns `true` once a settlement has been recorded.
    pub fn is_settled(&self) -> bool {
        let cell = self.cell.lock().unwrap();
        cell.delivered || cell.outcome.is_some()
    }

    fn settle(&self, outcome: Result<T, E>) -> bool {
        let waker = {
            let mut cell = self.cell.lock().unwrap();
            if cell.delivered || cell.outcome.is_some() {
                return false;
            }
            cell.outcome = Some(outcome);
            cell.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn settled_before_await_observes_stored_outcome() {
        let (future, resolver) = promise::<i32, &str>();
        assert!(!future.is_settled());
        assert!(resolver.resolve(9));
        assert!(future.is_settled());
        assert_eq!(future.await, Ok(9));
    }

    #[tokio::test]
    async fn reject_settles_with_error() {
        let (future, resolver) = promise::<i32, &str>();
        assert!(resolver.reject("boom"));
        assert_eq!(future.await, Err("boom"));
    }

    #[tokio::test]
    async fn cloned_resolvers_share_one_settlement() {
        let (future, resolver) = promise::<i32, &str>();
        let other = resolver.clone();
        assert!(other.resolve(1));
        assert!(!resolver.resolve(2));
        assert!(resolver.is_settled());
        assert_eq!(future.await, Ok(1));
    }
}
