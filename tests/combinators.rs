//! Functional coverage of the combinator surface.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stagechain::{interrupt, GetError, Stage, ThreadPool};

#[test]
fn then_apply_transforms_value() {
    let pool = ThreadPool::fixed(2);
    let stage = pool.submit(|| Ok(20)).then_apply(|n| Ok(n * 2 + 2));
    assert_eq!(*stage.get().unwrap(), 42);
}

#[test]
fn chained_maps_compose() {
    let pool = ThreadPool::fixed(2);
    let stage = pool
        .submit(|| Ok("4"))
        .then_apply(|s| Ok(s.parse::<u32>()?))
        .then_apply_async(|n| Ok(n + 1));
    assert_eq!(*stage.get().unwrap(), 5);
}

#[test]
fn failure_skips_mapping_functions() {
    let pool = ThreadPool::fixed(2);
    let mapped = Arc::new(AtomicBool::new(false));

    let mapped_flag = Arc::clone(&mapped);
    let stage = pool.submit::<u32, _>(|| Err("boom".into())).then_apply(move |n| {
        mapped_flag.store(true, Ordering::SeqCst);
        Ok(n + 1)
    });

    match stage.get() {
        Err(GetError::Failed(cause)) => assert_eq!(cause.to_string(), "boom"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!mapped.load(Ordering::SeqCst));
}

#[test]
fn then_accept_consumes_value() {
    let pool = ThreadPool::fixed(2);
    let seen = Arc::new(AtomicUsize::new(0));

    let sink = Arc::clone(&seen);
    let stage = pool.submit(|| Ok(7usize)).then_accept(move |n| {
        sink.store(*n, Ordering::SeqCst);
        Ok(())
    });

    stage.get().unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 7);
}

#[test]
fn exceptionally_recovers_with_original_cause() {
    let pool = ThreadPool::fixed(2);
    let stage = pool
        .submit::<String, _>(|| Err("broken pipeline".into()))
        .exceptionally(|failure| {
            let cause = failure.cause().expect("failure should carry a cause");
            Ok(cause.to_string())
        });

    assert_eq!(*stage.get().unwrap(), "broken pipeline");
}

#[test]
fn exceptionally_passes_success_through() {
    let pool = ThreadPool::fixed(2);
    let recovered = Arc::new(AtomicBool::new(false));

    let recovered_flag = Arc::clone(&recovered);
    let stage = pool.submit(|| Ok(9)).exceptionally(move |_| {
        recovered_flag.store(true, Ordering::SeqCst);
        Ok(0)
    });

    assert_eq!(*stage.get().unwrap(), 9);
    assert!(!recovered.load(Ordering::SeqCst));
}

#[test]
fn failing_recovery_function_fails_successor() {
    let pool = ThreadPool::fixed(2);
    let stage = pool
        .submit::<u32, _>(|| Err("first".into()))
        .exceptionally(|_| Err("second".into()));

    match stage.get() {
        Err(GetError::Failed(cause)) => assert_eq!(cause.to_string(), "second"),
        other => panic!("expected recovery failure, got {other:?}"),
    }
}

#[test]
fn when_complete_preserves_success_value() {
    let pool = ThreadPool::fixed(2);
    let observed = Arc::new(AtomicUsize::new(0));

    let sink = Arc::clone(&observed);
    let stage = pool.submit(|| Ok(11usize)).when_complete(move |value, failure| {
        assert!(failure.is_none());
        sink.store(*value.unwrap(), Ordering::SeqCst);
        Ok(())
    });

    assert_eq!(*stage.get().unwrap(), 11);
    assert_eq!(observed.load(Ordering::SeqCst), 11);
}

#[test]
fn when_complete_preserves_original_failure() {
    let pool = ThreadPool::fixed(2);
    let stage = pool
        .submit::<u32, _>(|| Err("original".into()))
        .when_complete(|_, failure| {
            assert!(failure.is_some());
            Ok(())
        });

    match stage.get() {
        Err(GetError::Failed(cause)) => assert_eq!(cause.to_string(), "original"),
        other => panic!("expected original failure, got {other:?}"),
    }
}

#[test]
fn when_complete_action_error_replaces_outcome() {
    let pool = ThreadPool::fixed(2);
    let stage = pool
        .submit::<u32, _>(|| Err("original".into()))
        .when_complete(|_, _| Err("replacement".into()));

    match stage.get() {
        Err(GetError::Failed(cause)) => assert_eq!(cause.to_string(), "replacement"),
        other => panic!("expected replacement failure, got {other:?}"),
    }
}

#[test]
fn handle_maps_success_and_failure() {
    let pool = ThreadPool::fixed(2);

    let ok = pool
        .submit(|| Ok(3))
        .handle(|value, _| Ok(value.copied().unwrap_or(0) * 10));
    assert_eq!(*ok.get().unwrap(), 30);

    let recovered = pool
        .submit::<i32, _>(|| Err("gone".into()))
        .handle(|value, failure| {
            assert!(value.is_none());
            assert!(failure.is_some());
            Ok(-1)
        });
    assert_eq!(*recovered.get().unwrap(), -1);
}

#[test]
fn then_combine_merges_both_values() {
    let pool = ThreadPool::fixed(4);
    let left = pool.submit(|| Ok(6u64));
    let right = pool.submit(|| {
        interrupt::sleep(Duration::from_millis(30))?;
        Ok(7u64)
    });

    let product = left.then_combine_async(&right, |a, b| Ok(a * b));
    assert_eq!(*product.get().unwrap(), 42);
}

#[test]
fn then_accept_both_sees_both_values() {
    let pool = ThreadPool::fixed(4);
    let sum = Arc::new(AtomicUsize::new(0));

    let left = pool.submit(|| Ok(30usize));
    let right = pool.submit(|| Ok(12usize));
    let sink = Arc::clone(&sum);
    let stage = left.then_accept_both_async(&right, move |a, b| {
        sink.store(a + b, Ordering::SeqCst);
        Ok(())
    });

    stage.get().unwrap();
    assert_eq!(sum.load(Ordering::SeqCst), 42);
}

#[test]
fn run_after_both_waits_for_both() {
    let pool = ThreadPool::fixed(4);
    let fired = Arc::new(AtomicBool::new(false));

    let left = pool.submit(|| {
        interrupt::sleep(Duration::from_millis(50))?;
        Ok(1)
    });
    let right = pool.submit(|| {
        interrupt::sleep(Duration::from_millis(100))?;
        Ok(2)
    });

    let flag = Arc::clone(&fired);
    let stage = left.run_after_both_async(&right, move || {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });

    stage.get().unwrap();
    assert!(fired.load(Ordering::SeqCst));
    assert!(left.is_done());
    assert!(right.is_done());
}

#[test]
fn apply_to_either_takes_first_winner() {
    let pool = ThreadPool::fixed(4);
    let fast = pool.submit(|| {
        interrupt::sleep(Duration::from_millis(10))?;
        Ok("fast")
    });
    let slow = pool.submit(|| {
        interrupt::sleep(Duration::from_millis(300))?;
        Ok("slow")
    });

    let winner = fast.apply_to_either_async(&slow, |value| Ok((*value).to_string()));
    assert_eq!(*winner.get().unwrap(), "fast");
}

#[test]
fn accept_either_consumes_first_winner() {
    let pool = ThreadPool::fixed(4);
    let seen = Arc::new(AtomicUsize::new(0));

    let fast = pool.submit(|| {
        interrupt::sleep(Duration::from_millis(10))?;
        Ok(1usize)
    });
    let slow = pool.submit(|| {
        interrupt::sleep(Duration::from_millis(300))?;
        Ok(2usize)
    });

    let sink = Arc::clone(&seen);
    let stage = fast.accept_either_async(&slow, move |n| {
        sink.store(*n, Ordering::SeqCst);
        Ok(())
    });

    stage.get().unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn run_after_either_accepts_mixed_value_types() {
    let pool = ThreadPool::fixed(4);
    let fired = Arc::new(AtomicBool::new(false));

    let text = pool.submit(|| Ok("text"));
    let number = pool.submit(|| {
        interrupt::sleep(Duration::from_millis(200))?;
        Ok(5u32)
    });

    let flag = Arc::clone(&fired);
    let stage = text.run_after_either_async(&number, move || {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });

    stage.get().unwrap();
    assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn ready_stage_feeds_combinators() {
    let pool = ThreadPool::fixed(2);
    let stage = Stage::ready(&pool.executor(), 40).then_apply_async(|n| Ok(n + 2));
    assert_eq!(*stage.get().unwrap(), 42);
}

#[test]
fn get_is_idempotent_after_terminal() {
    let pool = ThreadPool::fixed(2);
    let stage = pool.submit(|| Ok(5));
    assert_eq!(*stage.get().unwrap(), 5);
    assert_eq!(*stage.get().unwrap(), 5);
    assert_eq!(
        *stage.get_timeout(Duration::from_millis(1)).unwrap(),
        5
    );
}

#[test]
fn subscribing_after_terminal_still_runs() {
    let pool = ThreadPool::fixed(2);
    let stage = pool.submit(|| Ok(2));
    stage.get().unwrap();

    let late = stage.then_apply(|n| Ok(n * 21));
    assert_eq!(*late.get().unwrap(), 42);
}

#[test]
fn explicit_executor_variant_uses_given_pool() {
    let main_pool = ThreadPool::fixed(2);
    let side_pool = ThreadPool::with_options(
        1,
        1,
        stagechain::PoolOptions {
            thread_name_prefix: "side".to_string(),
            ..Default::default()
        },
    );

    let stage = main_pool.submit(|| Ok(())).then_apply_on(&side_pool.executor(), |_| {
        Ok(std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string())
    });

    assert!(stage.get().unwrap().starts_with("side-worker-"));
}

#[test]
fn cancelling_one_branch_leaves_siblings_alone() {
    let pool = ThreadPool::fixed(4);
    let root = pool.submit(|| {
        interrupt::sleep(Duration::from_millis(50))?;
        Ok(1)
    });

    let kept = root.then_apply_async(|n| Ok(n + 1));
    let dropped = root.then_apply_async(|n| Ok(n + 2));

    // Cancelling the derived branch after the root finished only kills
    // that branch.
    root.get().unwrap();
    let _ = dropped.cancel(true);

    assert_eq!(*kept.get().unwrap(), 2);
    assert!(!root.is_cancelled());
}
