//! Scoped setup/cleanup regions.
//!
//! A region brackets a unit of work, synchronous or asynchronous, so that
//! a cleanup action runs exactly once on every exit path: the body finishes
//! immediately, fails immediately, or hands back a future that later
//! resolves or fails. The body's outcome is an explicit tagged variant
//! ([`Step`]); the cleanup timing branches on that tag, never on probing the
//! returned value's type downstream.
//!
//! Error precedence: a setup or body failure is the one surfaced even when
//! cleanup also fails (the cleanup failure is discarded); a cleanup failure
//! is surfaced only when the body itself succeeded.
//!
//! # Examples
//!
//! ```rust
//! use engine_coord::region::{run, Step};
//!
//! let step = run(
//!     || Ok::<_, &str>(()),
//!     || Ok(()),
//!     || Step::done(Ok(3)),
//! );
//! assert!(matches!(step, Step::Ready(Ok(3))));
//! ```

use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;

/// Tagged outcome of a region body: finished now, or still pending.
pub enum Step<T, E, F> {
    /// The body finished (or failed) without suspending.
    Ready(Result<T, E>),
    /// The body handed back async work that settles later.
    Pending(F),
}

impl<T, E> Step<T, E, std::future::Ready<Result<T, E>>> {
    /// An immediately-available outcome. Convenience constructor that pins
    /// the future parameter for bodies that never suspend.
    pub fn done(outcome: Result<T, E>) -> Self {
        Step::Ready(outcome)
    }
}

impl<T, E, F> Step<T, E, F>
where
    F: Future<Output = Result<T, E>>,
{
    /// Wraps async work whose outcome settles later.
    pub fn pending(future: F) -> Self {
        Step::Pending(future)
    }

    /// Returns `true` for the [`Step::Ready`] variant.
    pub fn is_ready(&self) -> bool {
        matches!(self, Step::Ready(_))
    }

    /// Collapses either variant into the final outcome, for callers that
    /// are already in async context.
    pub async fn wait(self) -> Result<T, E> {
        match self {
            Step::Ready(outcome) => outcome,
            Step::Pending(future) => future.await,
        }
    }
}

/// Runs `cleanup` after `outcome` is known, applying the error-precedence
/// policy: the body failure wins, a cleanup failure only surfaces on an
/// otherwise successful body.
fn settle<T, E, C>(outcome: Result<T, E>, cleanup: C) -> Result<T, E>
where
    C: FnOnce() -> Result<(), E>,
{
    let cleaned = cleanup();
    match (outcome, cleaned) {
        (Err(err), _) => Err(err),
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
    }
}

/// Executes `setup`, then `body`, guaranteeing `cleanup` runs exactly once.
///
/// With a [`Step::Ready`] body outcome, cleanup runs synchronously before
/// this returns. With a [`Step::Pending`] outcome, cleanup is deferred into
/// the returned future and runs once the inner work settles; the original
/// outcome is preserved and re-surfaced after cleanup.
///
/// If `setup` fails, the body never runs, cleanup is still attempted, and
/// the setup error is the one returned.
pub fn run<T, E, S, C, B, F>(
    setup: S,
    cleanup: C,
    body: B,
) -> Step<T, E, impl Future<Output = Result<T, E>>>
where
    S: FnOnce() -> Result<(), E>,
    C: FnOnce() -> Result<(), E>,
    B: FnOnce() -> Step<T, E, F>,
    F: Future<Output = Result<T, E>>,
{
    if let Err(err) = setup() {
        let _ = cleanup();
        return Step::Ready(Err(err));
    }
    match body() {
        Step::Ready(outcome) => Step::Ready(settle(outcome, cleanup)),
        Step::Pending(future) => Step::Pending(async move {
            let outcome = future.await;
            settle(outcome, cleanup)
        }),
    }
}

/// A reusable setup/cleanup pair.
///
/// Where [`run`] brackets a single invocation, a `Region` can bracket many:
/// [`wrap`](Region::wrap) turns any async function into one that carries
/// the same guarantee on every call, independent of call site.
#[derive(Clone)]
pub struct Region<S, C> {
    setup: S,
    cleanup: C,
}

impl<S, C> Region<S, C> {
    pub fn new(setup: S, cleanup: C) -> Self {
        Self { setup, cleanup }
    }

    /// Brackets one body with this region's setup and cleanup.
    pub fn run<T, E, B, F>(&self, body: B) -> Step<T, E, impl Future<Output = Result<T, E>>>
    where
        S: Fn() -> Result<(), E> + Clone,
        C: Fn() -> Result<(), E> + Clone,
        B: FnOnce() -> Step<T, E, F>,
        F: Future<Output = Result<T, E>>,
    {
        // Cloned, not borrowed: the pending variant's future outlives `self`.
        run(self.setup.clone(), self.cleanup.clone(), body)
    }

    /// Wraps an async function so every invocation is bracketed by this
    /// region. The argument and return shape of `f` is preserved; functions
    /// of higher arity take their arguments as a tuple.
    pub fn wrap<A, T, E, F, Fut>(self, f: F) -> impl Fn(A) -> BoxFuture<'static, Result<T, E>>
    where
        S: Fn() -> Result<(), E> + Clone + Send + 'static,
        C: Fn() -> Result<(), E> + Clone + Send + 'static,
        F: Fn(A) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        A: Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        move |arg: A| {
            let setup = self.setup.clone();
            let cleanup = self.cleanup.clone();
            let f = f.clone();
            async move {
                if let Err(err) = setup() {
                    let _ = cleanup();
                    return Err(err);
                }
                settle(f(arg).await, cleanup)
            }
            .boxed()
        }
    }

    /// Like [`wrap`](Region::wrap), for synchronous functions.
    pub fn wrap_sync<A, T, E, F>(self, f: F) -> impl Fn(A) -> Result<T, E>
    where
        S: Fn() -> Result<(), E>,
        C: Fn() -> Result<(), E> + Clone,
        F: Fn(A) -> Result<T, E>,
    {
        move |arg: A| {
            if let Err(err) = (self.setup)() {
                let _ = (self.cleanup)();
                return Err(err);
            }
            settle(f(arg), self.cleanup.clone())
        }
    }
}
