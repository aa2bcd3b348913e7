//! Integration tests for the engine coordination primitives.
//!
//! These exercise the cross-primitive contracts: FIFO grant ordering under
//! out-of-order polling, cleanup totality across all exit paths, one-shot
//! settlement, and leak-free combined cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use engine_coord::region::{run, Step};
use engine_coord::{combine, promise, CancelSignal, Error, FifoLock, Region};
use tokio::task::yield_now;
use tokio::time::{sleep, timeout, Duration};

async fn settle_scheduler() {
    // Give spawned tasks a few turns to register their wakers.
    for _ in 0..5 {
        yield_now().await;
    }
}

// ---------------------------------------------------------------------------
// FIFO lock
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_acquire_waits_for_release() {
    let lock = FifoLock::new();
    let first = lock.acquire().await.unwrap();

    let second = lock.acquire();
    let second_task = tokio::spawn(async move { second.await.unwrap() });

    settle_scheduler().await;
    assert!(!second_task.is_finished());

    first.release();
    let permit = timeout(Duration::from_secs(1), second_task)
        .await
        .unwrap()
        .unwrap();
    permit.release();
}

#[tokio::test]
async fn grant_order_matches_call_order_not_poll_order() {
    let lock = FifoLock::new();
    let first = lock.acquire().await.unwrap();

    // Queue positions are claimed here, in this order.
    let second = lock.acquire();
    let third = lock.acquire();

    let order = Arc::new(Mutex::new(Vec::new()));

    // Spawn the *third* acquirer's task first, so it polls first.
    let o = order.clone();
    let third_task = tokio::spawn(async move {
        let permit = third.await.unwrap();
        o.lock().unwrap().push("third");
        permit.release();
    });
    let o = order.clone();
    let second_task = tokio::spawn(async move {
        let permit = second.await.unwrap();
        o.lock().unwrap().push("second");
        permit.release();
    });

    settle_scheduler().await;
    first.release();

    second_task.await.unwrap();
    third_task.await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["second", "third"]);
}

#[tokio::test]
async fn double_release_grants_no_extra_hold() {
    let lock = FifoLock::new();
    let first = lock.acquire().await.unwrap();
    let second = lock.acquire();
    let third = lock.acquire();

    first.release();
    first.release(); // chosen policy: no-op

    let second_permit = second.await.unwrap();

    // The third acquirer must still be waiting on the second.
    let third_task = tokio::spawn(async move { third.await.unwrap() });
    settle_scheduler().await;
    assert!(!third_task.is_finished());

    second_permit.release();
    timeout(Duration::from_secs(1), third_task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn close_fails_waiters_and_later_acquires() {
    let lock = FifoLock::new();
    let held = lock.acquire().await.unwrap();

    let waiting = lock.acquire();
    let waiter_task = tokio::spawn(async move { waiting.await });
    settle_scheduler().await;

    lock.close();
    assert!(matches!(waiter_task.await.unwrap(), Err(Error::Closed)));
    assert!(matches!(lock.acquire().await, Err(Error::Closed)));

    // Releasing after close is still fine.
    held.release();
    assert!(!lock.is_locked());
}

// ---------------------------------------------------------------------------
// Scoped regions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cleanup_runs_once_on_all_four_exit_paths() {
    let cleanups = Arc::new(AtomicUsize::new(0));

    // Sync success.
    let c = cleanups.clone();
    let step = run(
        || Ok::<_, &str>(()),
        move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        || Step::done(Ok(1)),
    );
    assert_eq!(step.wait().await, Ok(1));

    // Sync failure: cleanup still runs, the original error resurfaces.
    let c = cleanups.clone();
    let step = run(
        || Ok::<_, &str>(()),
        move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        || Step::done(Err::<i32, _>("X")),
    );
    assert_eq!(step.wait().await, Err("X"));

    // Async success.
    let c = cleanups.clone();
    let step = run(
        || Ok::<_, &str>(()),
        move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        || Step::pending(async { Ok(3) }),
    );
    assert_eq!(step.wait().await, Ok(3));

    // Async failure.
    let c = cleanups.clone();
    let step = run(
        || Ok::<_, &str>(()),
        move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        || Step::pending(async { Err::<i32, _>("Y") }),
    );
    assert_eq!(step.wait().await, Err("Y"));

    assert_eq!(cleanups.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn region_guarantees_lock_release_on_body_failure() {
    let lock = FifoLock::new();
    let permit = lock.acquire().await.unwrap();

    let step = run(
        || Ok::<_, &str>(()),
        move || {
            permit.release();
            Ok(())
        },
        || Step::done(Err::<i32, _>("engine trap")),
    );
    assert!(matches!(step, Step::Ready(Err("engine trap"))));

    // The lock is free again; the next caller is not stalled.
    let next = timeout(Duration::from_secs(1), lock.acquire())
        .await
        .unwrap()
        .unwrap();
    next.release();
}

#[tokio::test]
async fn wrapped_function_is_bracketed_on_every_call() {
    let depth = Arc::new(AtomicUsize::new(0));
    let enter = depth.clone();
    let leave = depth.clone();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let region = Region::new(
        move || {
            enter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, &str>(())
        },
        move || {
            leave.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        },
    );

    let d = depth.clone();
    let s = seen.clone();
    let observed_depth = region.wrap(move |label: &'static str| {
        let d = d.clone();
        let s = s.clone();
        async move {
            s.lock().unwrap().push((label, d.load(Ordering::SeqCst)));
            Ok(label.len())
        }
    });

    assert_eq!(observed_depth("first").await, Ok(5));
    assert_eq!(observed_depth("second").await, Ok(6));
    // Inside each call the setup had run; after both, every cleanup has.
    assert_eq!(*seen.lock().unwrap(), vec![("first", 1), ("second", 1)]);
    assert_eq!(depth.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Externally-settled futures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_settlement_wins() {
    let (future, resolver) = promise::<i32, &str>();
    assert!(resolver.reject("err"));
    assert!(!resolver.resolve(5)); // no effect
    assert_eq!(future.await, Err("err"));
}

#[tokio::test]
async fn settlement_wakes_a_waiting_task() {
    let (future, resolver) = promise::<i32, &str>();

    let task = tokio::spawn(future);
    settle_scheduler().await;
    assert!(!task.is_finished());

    assert!(resolver.resolve(41));
    let outcome = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    assert_eq!(outcome, Ok(41));
}

#[tokio::test]
async fn resolver_usable_from_another_task() {
    let (future, resolver) = promise::<&str, &str>();
    tokio::spawn(async move {
        yield_now().await;
        resolver.resolve("handshake");
    });
    assert_eq!(
        timeout(Duration::from_secs(1), future).await.unwrap(),
        Ok("handshake")
    );
}

// ---------------------------------------------------------------------------
// Combined cancellation
// ---------------------------------------------------------------------------

fn reason_str(signal: &CancelSignal) -> Option<&'static str> {
    signal
        .reason()
        .and_then(|r| r.downcast_ref::<&'static str>().copied())
}

#[test]
fn combine_short_circuits_on_pre_aborted_input() {
    let s1 = CancelSignal::new();
    let s2 = CancelSignal::new();
    s1.abort("r");

    let derived = combine(&[s1.clone(), s2.clone()]);
    assert!(derived.aborted());
    assert_eq!(reason_str(&derived), Some("r"));
    // No listener was attached to the other input.
    assert_eq!(s2.listener_count(), 0);

    // Aborting it afterwards has no observable effect on the derived signal.
    s2.abort("other");
    assert_eq!(reason_str(&derived), Some("r"));
}

#[test]
fn first_input_to_abort_propagates_and_tears_down() {
    let s1 = CancelSignal::new();
    let s2 = CancelSignal::new();
    let derived = combine(&[s1.clone(), s2.clone()]);
    assert_eq!(s1.listener_count(), 1);
    assert_eq!(s2.listener_count(), 1);

    s1.abort("why");
    assert!(derived.aborted());
    assert_eq!(reason_str(&derived), Some("why"));

    // Teardown is eager: the surviving input is detached immediately, and a
    // late abort on it is inert.
    assert_eq!(s2.listener_count(), 0);
    s2.abort("late");
    assert_eq!(reason_str(&derived), Some("why"));
}

#[test]
fn aborting_derived_directly_detaches_every_input() {
    let s1 = CancelSignal::new();
    let s2 = CancelSignal::new();
    let derived = combine(&[s1.clone(), s2.clone()]);

    derived.abort("external");
    assert_eq!(s1.listener_count(), 0);
    assert_eq!(s2.listener_count(), 0);

    s1.abort("late");
    assert_eq!(reason_str(&derived), Some("external"));
}

#[test]
fn dropped_inputs_are_counted_off_without_firing() {
    let keep = CancelSignal::new();
    let derived = {
        let gone1 = CancelSignal::new();
        let gone2 = CancelSignal::new();
        combine(&[gone1.clone(), gone2, keep.clone()])
    };
    // Two inputs are gone; the survivor must still be followed.
    assert_eq!(keep.listener_count(), 1);
    assert!(!derived.aborted());

    keep.abort("fire");
    assert!(derived.aborted());
    assert_eq!(reason_str(&derived), Some("fire"));
    assert_eq!(keep.listener_count(), 0);
}

#[test]
fn all_inputs_dropped_releases_survivor_bookkeeping() {
    let keep = CancelSignal::new();
    {
        let gone = CancelSignal::new();
        let _derived = combine(&[gone.clone(), keep.clone()]);
        assert_eq!(keep.listener_count(), 1);
        drop(gone);
        // `gone` was the last strong handle on that input; its registration
        // guard counted it off. Only `keep` remains, still live, so the
        // combine keeps following it until it fires or is dropped too.
        assert_eq!(keep.listener_count(), 1);
    }
    // The derived signal was dropped undetonated; firing the survivor now
    // must not have any effect beyond detaching the leftover listener.
    keep.abort("nobody listening");
    assert_eq!(keep.listener_count(), 0);
}

#[test]
fn duplicate_inputs_propagate_once_and_clean_up() {
    let signal = CancelSignal::new();
    let derived = combine(&[signal.clone(), signal.clone()]);
    assert_eq!(signal.listener_count(), 2);

    signal.abort("dup");
    assert!(derived.aborted());
    assert_eq!(reason_str(&derived), Some("dup"));
    assert_eq!(signal.listener_count(), 0);
}

#[tokio::test]
async fn cancelled_future_resolves_on_abort() {
    let signal = CancelSignal::new();
    let waiter = {
        let signal = signal.clone();
        tokio::spawn(async move { signal.cancelled().await })
    };
    settle_scheduler().await;

    signal.abort("stop");
    timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn timeout_layer_composes_with_combine() {
    let user = CancelSignal::new();
    let deadline = CancelSignal::new();
    let derived = combine(&[user.clone(), deadline.clone()]);

    let d = deadline.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(20)).await;
        d.abort("deadline elapsed");
    });

    timeout(Duration::from_secs(5), derived.cancelled())
        .await
        .unwrap();
    assert_eq!(reason_str(&derived), Some("deadline elapsed"));
    assert_eq!(user.listener_count(), 0);
}
