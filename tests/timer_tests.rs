use rand::seq::SliceRandom;
use rustfiber_io::{FiberStatus, Runtime, WorkCounter};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

fn runtime_with(work: &WorkCounter) -> Runtime {
    Runtime::builder().work_counter(work.clone()).build()
}

#[test]
fn test_sleepers_wake_in_deadline_order() {
    let work = WorkCounter::new();
    let runtime = runtime_with(&work);
    let order = Rc::new(RefCell::new(Vec::new()));

    let mut delays: Vec<u64> = (1..=8).map(|i| i * 15).collect();
    delays.shuffle(&mut rand::thread_rng());

    for ms in delays {
        let order = order.clone();
        runtime
            .spawn(move |ctx| {
                ctx.delay(ms);
                order.borrow_mut().push(ms);
            })
            .unwrap();
    }
    runtime.run().unwrap();

    let order = order.borrow();
    let mut sorted = order.clone();
    sorted.sort_unstable();
    assert_eq!(*order, sorted);
    assert_eq!(order.len(), 8);
    assert!(work.is_idle());
}

#[test]
fn test_delay_overrun_is_small() {
    let runtime = runtime_with(&WorkCounter::new());
    let overrun = Rc::new(Cell::new(u64::MAX));
    let out = overrun.clone();
    runtime.spawn(move |ctx| out.set(ctx.delay(20))).unwrap();
    runtime.run().unwrap();
    // Loose bound: CI machines can be slow to reschedule the thread.
    assert!(overrun.get() < 50, "overrun {}ms", overrun.get());
}

#[test]
fn test_zero_delay_returns_promptly() {
    let runtime = runtime_with(&WorkCounter::new());
    let done = Rc::new(Cell::new(false));
    let out = done.clone();
    runtime
        .spawn(move |ctx| {
            ctx.delay(0);
            out.set(true);
        })
        .unwrap();
    let start = Instant::now();
    runtime.run().unwrap();
    assert!(done.get());
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_sleep_counts_seconds() {
    let runtime = runtime_with(&WorkCounter::new());
    let overrun = Rc::new(Cell::new(u64::MAX));
    let out = overrun.clone();
    runtime.spawn(move |ctx| out.set(ctx.sleep(1))).unwrap();
    let start = Instant::now();
    runtime.run().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(990));
    assert_eq!(overrun.get(), 0);
}

#[test]
fn test_work_counter_moves_only_on_first_and_last_sleeper() {
    let work = WorkCounter::new();
    // Work owned by some other component; the runtime must only ever add
    // or remove its own single unit on top of it.
    work.increment();
    let runtime = runtime_with(&work);
    let observed = Rc::new(RefCell::new(Vec::new()));

    for (name, ms) in [("a", 10u64), ("b", 40)] {
        let seen = observed.clone();
        let counter = work.clone();
        runtime
            .spawn(move |ctx| {
                ctx.delay(ms);
                seen.borrow_mut()
                    .push((name, ctx.sleeping_count(), counter.value()));
            })
            .unwrap();
    }
    let seen = observed.clone();
    let counter = work.clone();
    runtime
        .spawn(move |ctx| {
            seen.borrow_mut()
                .push(("c0", ctx.sleeping_count(), counter.value()));
            ctx.delay(25);
            seen.borrow_mut()
                .push(("c1", ctx.sleeping_count(), counter.value()));
        })
        .unwrap();
    runtime.run().unwrap();

    assert_eq!(
        *observed.borrow(),
        vec![
            ("c0", 2, 2),
            ("a", 2, 2),
            ("c1", 1, 2),
            ("b", 0, 1),
        ]
    );
    assert_eq!(work.value(), 1);
}

#[test]
fn test_shared_work_counter_across_runtimes() {
    let work = WorkCounter::new();
    let first = runtime_with(&work);
    let second = runtime_with(&work);
    assert!(first.work_counter().same_as(second.work_counter()));

    first.spawn(|ctx| { ctx.delay(5); }).unwrap();
    first.run().unwrap();
    second.spawn(|ctx| { ctx.delay(5); }).unwrap();
    second.run().unwrap();
    assert!(work.is_idle());
}

#[test]
fn test_timer_fires_only_once_scheduled() {
    let runtime = runtime_with(&WorkCounter::new());
    let fired = Rc::new(Cell::new(0));
    let out = fired.clone();
    let timer = runtime
        .create_timer(10, move |_| out.set(out.get() + 1))
        .unwrap();
    assert_eq!(runtime.fiber_status(timer), Some(FiberStatus::Created));

    runtime.run().unwrap();
    assert_eq!(fired.get(), 0, "an unscheduled timer never runs");

    runtime.schedule(timer).unwrap();
    let start = Instant::now();
    runtime.run().unwrap();
    assert_eq!(fired.get(), 1);
    assert!(start.elapsed() >= Duration::from_millis(5));
    assert_eq!(runtime.fiber_status(timer), None);
}

#[test]
fn test_reset_timer_moves_deadline_earlier() {
    let runtime = runtime_with(&WorkCounter::new());
    let fired_at = Rc::new(Cell::new(None));
    let out = fired_at.clone();
    let start = Instant::now();
    let timer = runtime
        .create_timer(60_000, move |_| out.set(Some(start.elapsed())))
        .unwrap();
    runtime.schedule(timer).unwrap();
    runtime
        .spawn(move |ctx| {
            ctx.delay(10);
            ctx.reset_timer(timer, 10).unwrap();
        })
        .unwrap();
    runtime.run().unwrap();

    let fired_at = fired_at.get().expect("timer should have fired");
    assert!(fired_at >= Duration::from_millis(15));
    assert!(fired_at < Duration::from_secs(5));
}

#[test]
fn test_reset_timer_moves_deadline_later() {
    let runtime = runtime_with(&WorkCounter::new());
    let fired_at = Rc::new(Cell::new(None));
    let out = fired_at.clone();
    let start = Instant::now();
    let timer = runtime
        .create_timer(10, move |_| out.set(Some(start.elapsed())))
        .unwrap();
    runtime.reset_timer(timer, 60).unwrap();
    runtime.run().unwrap();

    let fired_at = fired_at.get().expect("timer should have fired");
    assert!(fired_at >= Duration::from_millis(55), "{:?}", fired_at);
}
