// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for shared budgets under contention.

use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use rebound::Budget;
use tick::{Clock, ClockControl};

#[test]
fn racing_threads_never_overspend() {
    const THREADS: usize = 16;
    const TRIES: usize = 500;
    const LIMIT: u32 = 3_000;

    let clock = Clock::new_frozen();
    let budget = Budget::attempts(&clock, LIMIT);
    let barrier = Barrier::new(THREADS);

    let granted: u32 = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let budget = budget.clone();
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    (0..TRIES).map(|_| u32::from(budget.try_consume())).sum::<u32>()
                })
            })
            .collect();

        handles.into_iter().map(|handle| handle.join().unwrap()).sum()
    });

    assert_eq!(granted, LIMIT);
    assert_eq!(budget.consumed(), u64::from(LIMIT));
    assert_eq!(budget.remaining_attempts(), Some(0));
    assert!(budget.is_exhausted());
}

#[test]
fn exhaustion_is_permanent() {
    let control = ClockControl::new();
    let clock = control.to_clock();
    let budget = Budget::new(&clock, Some(100), Some(Duration::from_secs(1)));

    assert!(budget.try_consume());

    control.advance(Duration::from_secs(1));
    assert!(!budget.try_consume());
    assert_eq!(budget.remaining_time(), Some(Duration::ZERO));

    // attempts remain, but the budget stays closed
    assert_eq!(budget.remaining_attempts(), Some(99));
    assert!((0..10).all(|_| !budget.try_consume()));
    assert!(budget.is_exhausted());
}

#[test]
fn unlimited_budget_keeps_granting() {
    let clock = Clock::new_frozen();
    let budget = Budget::unlimited(&clock);

    assert!((0..10_000).all(|_| budget.try_consume()));
    assert_eq!(budget.remaining_attempts(), None);
    assert_eq!(budget.remaining_time(), None);
    assert!(!budget.is_exhausted());
}
