//! Concurrency-coordination primitives for the engine bridge.
//!
//! This crate is the small toolkit that lets a single-threaded,
//! non-reentrant execution engine live inside a concurrent, asynchronous
//! calling environment. It provides exactly four primitives:
//!
//! - [`FifoLock`]: mutual exclusion with async hand-off, granted strictly
//!   in acquire-call order. Every cross-boundary call into the engine goes
//!   through it.
//! - [`region`]: a setup/cleanup bracket guaranteeing the cleanup action
//!   runs exactly once around sync or async work, on every exit path.
//!   This is the tool that makes lock release unskippable.
//! - [`promise`]: an externally-settled future, for turning push-style
//!   events (an inbound message, a readiness notification) into awaitable
//!   values without polling.
//! - [`combine`]: merges independent [`CancelSignal`]s into one derived
//!   signal with leak-free listener lifecycle, so an operation can respect
//!   a caller-supplied token and an internal deadline token at once.
//!
//! Everything else (marshalling across the engine boundary, package
//! loading, CLI surfaces, the engine itself) belongs to the layers that
//! call into this crate.
//!
//! # Examples
//!
//! ```rust
//! use engine_coord::{FifoLock, region::{run, Step}};
//!
//! # async fn example(lock: &FifoLock) -> Result<i32, engine_coord::Error> {
//! let permit = lock.acquire().await?;
//! let step = run(
//!     || Ok(()),
//!     || { permit.release(); Ok(()) },
//!     || Step::done(Ok(42)), // the engine call
//! );
//! step.wait().await
//! # }
//! ```

pub mod cancel;
pub mod error;
pub mod lock;
pub mod promise;
pub mod region;

pub use cancel::{combine, CancelSignal, Cancelled, ListenerId, Reason};
pub use error::{Error, Result};
pub use lock::{Acquire, FifoLock, LockPermit};
pub use promise::{promise, Promise, Resolver};
pub use region::{Region, Step};
