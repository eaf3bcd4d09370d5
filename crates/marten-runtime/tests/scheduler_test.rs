//! Guest timer API driven through the host loop.

use marten_runtime::{GuestError, MemoryReader, Runtime, RuntimeError, TimerKind};
use marten_test_util::{TestGuest, Value};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tokio::task::LocalSet;
use tokio::time::{Duration, Instant};

fn runtime() -> Runtime<TestGuest> {
    Runtime::builder(TestGuest::new())
        .reader(MemoryReader::new())
        .build()
        .unwrap()
}

/// A guest function that appends `label` to `log` when called.
fn recorder(guest: &TestGuest, log: &Rc<RefCell<Vec<String>>>, label: &str) -> Value {
    let log = log.clone();
    let label = label.to_string();
    guest.func(&label.clone(), move |_g, _this, args| {
        let mut entry = label.clone();
        for arg in args {
            entry.push_str(&format!(" {arg:?}"));
        }
        log.borrow_mut().push(entry);
        Ok(Value::Undefined)
    })
}

#[tokio::test(start_paused = true)]
async fn test_interval_cleared_on_nth_firing() {
    LocalSet::new()
        .run_until(async {
            let rt = runtime();
            let guest = rt.guest().clone();
            let count = Rc::new(Cell::new(0));
            let id = Rc::new(Cell::new(0.0));

            let tick = {
                let count = count.clone();
                let id = id.clone();
                guest.func("tick", move |g, _this, _args| {
                    count.set(count.get() + 1);
                    if count.get() == 3 {
                        g.call_global("clearInterval", &[Value::Number(id.get())])?;
                    }
                    Ok(Value::Undefined)
                })
            };
            let handle = guest
                .call_global("setInterval", &[tick, Value::Number(10.0)])
                .unwrap();
            id.set(handle.as_f64().unwrap());

            let started = Instant::now();
            rt.run().await;
            assert_eq!(count.get(), 3);
            let elapsed = started.elapsed();
            assert!(elapsed >= Duration::from_millis(30) && elapsed < Duration::from_millis(40));
            assert_eq!(rt.scheduler().pending(TimerKind::Interval), 0);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_zero_delay_interval_yields_between_ticks() {
    LocalSet::new()
        .run_until(async {
            let rt = runtime();
            let guest = rt.guest().clone();
            let log = Rc::new(RefCell::new(Vec::new()));
            let id = Rc::new(Cell::new(0.0));

            let tick = {
                let log = log.clone();
                let id = id.clone();
                guest.func("tick", move |g, _this, _args| {
                    log.borrow_mut().push("tick".to_string());
                    if log.borrow().len() >= 4 {
                        g.call_global("clearInterval", &[Value::Number(id.get())])?;
                    }
                    Ok(Value::Undefined)
                })
            };
            let handle = guest.call_global("setInterval", &[tick, Value::Number(0.0)]).unwrap();
            id.set(handle.as_f64().unwrap());
            guest
                .call_global("setImmediate", &[recorder(&guest, &log, "immediate")])
                .unwrap();

            rt.run().await;
            // the immediate runs within the first turn, between interval ticks
            assert_eq!(log.borrow()[0], "tick");
            assert_eq!(log.borrow()[1], "immediate");
            assert_eq!(log.borrow().iter().filter(|e| *e == "tick").count(), 4);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_fire_by_deadline_then_fifo() {
    LocalSet::new()
        .run_until(async {
            let rt = runtime();
            let guest = rt.guest().clone();
            let log = Rc::new(RefCell::new(Vec::new()));

            for (label, delay) in [("late", 50.0), ("first", 10.0), ("second", 10.0), ("now", 0.0)] {
                guest
                    .call_global("setTimeout", &[recorder(&guest, &log, label), Value::Number(delay)])
                    .unwrap();
            }
            rt.run().await;
            assert_eq!(*log.borrow(), vec!["now", "first", "second", "late"]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_timeout_extra_arguments() {
    LocalSet::new()
        .run_until(async {
            let rt = runtime();
            let guest = rt.guest().clone();
            let log = Rc::new(RefCell::new(Vec::new()));
            guest
                .call_global(
                    "setTimeout",
                    &[recorder(&guest, &log, "cb"), Value::Number(5.0), Value::str("a"), Value::Number(2.0)],
                )
                .unwrap();
            guest
                .call_global("setImmediate", &[recorder(&guest, &log, "imm"), Value::Bool(true)])
                .unwrap();
            rt.run().await;
            assert_eq!(*log.borrow(), vec!["imm true", "cb \"a\" 2"]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_oversized_delay_fires_after_one_millisecond() {
    LocalSet::new()
        .run_until(async {
            let rt = runtime();
            let guest = rt.guest().clone();
            let log = Rc::new(RefCell::new(Vec::new()));
            guest
                .call_global("setTimeout", &[recorder(&guest, &log, "huge"), Value::Number(1e25)])
                .unwrap();
            guest
                .call_global("setTimeout", &[recorder(&guest, &log, "overflow"), Value::Number(1e22)])
                .unwrap();
            guest
                .call_global("setTimeout", &[recorder(&guest, &log, "later"), Value::Number(5.0)])
                .unwrap();

            let started = Instant::now();
            rt.run().await;
            assert_eq!(*log.borrow(), vec!["huge", "overflow", "later"]);
            assert!(started.elapsed() < Duration::from_millis(10));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_clear_before_fire_and_twice() {
    LocalSet::new()
        .run_until(async {
            let rt = runtime();
            let guest = rt.guest().clone();
            let log = Rc::new(RefCell::new(Vec::new()));

            let id = guest
                .call_global("setTimeout", &[recorder(&guest, &log, "never"), Value::Number(10.0)])
                .unwrap();
            assert!(rt.scheduler().is_active(TimerKind::Timeout, id.as_f64().unwrap() as u64));
            guest.call_global("clearTimeout", &[id.clone()]).unwrap();
            guest.call_global("clearTimeout", &[id.clone()]).unwrap();
            // ids are per kind, so clearing the same number as an immediate is a no-op
            guest.call_global("clearImmediate", &[id]).unwrap();
            guest.call_global("clearInterval", &[Value::Number(999.0)]).unwrap();
            guest.call_global("clearTimeout", &[Value::str("garbage")]).unwrap();
            guest.call_global("clearTimeout", &[]).unwrap();

            rt.run().await;
            assert!(log.borrow().is_empty());
            assert_eq!(rt.scheduler().pending(TimerKind::Timeout), 0);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_ids_are_per_kind() {
    LocalSet::new()
        .run_until(async {
            let rt = runtime();
            let guest = rt.guest().clone();
            let noop = guest.func("noop", |_g, _this, _args| Ok(Value::Undefined));

            let t1 = guest.call_global("setTimeout", &[noop.clone()]).unwrap();
            let t2 = guest.call_global("setTimeout", &[noop.clone()]).unwrap();
            let i1 = guest.call_global("setImmediate", &[noop]).unwrap();
            assert_eq!(t1.as_f64(), Some(1.0));
            assert_eq!(t2.as_f64(), Some(2.0));
            assert_eq!(i1.as_f64(), Some(1.0));
            rt.run().await;
        })
        .await;
}

#[test]
fn test_non_function_callback_is_type_error() {
    let rt = runtime();
    let guest = rt.guest();
    for name in ["setTimeout", "setInterval", "setImmediate", "queueMicrotask"] {
        let err = guest.call_global(name, &[Value::str("code"), Value::Number(1.0)]).unwrap_err();
        assert!(
            matches!(err, GuestError::Runtime(RuntimeError::TypeError { .. })),
            "{name}: {err:?}"
        );
    }
    assert_eq!(rt.host().pending_tasks(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_microtasks_run_before_timers() {
    LocalSet::new()
        .run_until(async {
            let rt = runtime();
            let guest = rt.guest().clone();
            let log = Rc::new(RefCell::new(Vec::new()));

            guest
                .call_global("setTimeout", &[recorder(&guest, &log, "timeout")])
                .unwrap();
            guest
                .call_global("queueMicrotask", &[recorder(&guest, &log, "micro1")])
                .unwrap();
            guest
                .call_global("queueMicrotask", &[recorder(&guest, &log, "micro2")])
                .unwrap();
            rt.run().await;
            assert_eq!(*log.borrow(), vec!["micro1", "micro2", "timeout"]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_engine_jobs_are_deferred_to_the_loop() {
    LocalSet::new()
        .run_until(async {
            let rt = runtime();
            let ran = Rc::new(Cell::new(false));
            let flag = ran.clone();
            rt.guest().enqueue_job(Box::new(move || flag.set(true)));
            assert!(!ran.get());
            assert_eq!(rt.host().pending_tasks(), 1);
            rt.run().await;
            assert!(ran.get());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_throwing_callback_does_not_stop_the_loop() {
    LocalSet::new()
        .run_until(async {
            let errors = Rc::new(RefCell::new(Vec::new()));
            let sink = errors.clone();
            let rt = Runtime::builder(TestGuest::new())
                .reader(MemoryReader::new())
                .on_unhandled(move |err| sink.borrow_mut().push(err.to_string()))
                .build()
                .unwrap();
            let guest = rt.guest().clone();
            let log = Rc::new(RefCell::new(Vec::new()));

            let boom = guest.func("boom", |g, _this, _args| Err(g.throw("boom")));
            guest.call_global("setTimeout", &[boom, Value::Number(1.0)]).unwrap();
            guest
                .call_global("setTimeout", &[recorder(&guest, &log, "after"), Value::Number(2.0)])
                .unwrap();

            rt.run().await;
            assert_eq!(*log.borrow(), vec!["after"]);
            assert_eq!(errors.borrow().len(), 1);
            assert!(errors.borrow()[0].contains("boom"));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_timer_scheduled_from_module_body() {
    LocalSet::new()
        .run_until(async {
            let reader = MemoryReader::new().with_file("/app/main.js", "setTimeout(done, 100);");
            let rt = Runtime::builder(TestGuest::new())
                .root("/app")
                .reader(reader)
                .build()
                .unwrap();
            let fired = Rc::new(Cell::new(false));
            let flag = fired.clone();
            rt.guest().script("/app/main.js", move |g, _scope| {
                let flag = flag.clone();
                let done = g.func("done", move |_g, _this, _args| {
                    flag.set(true);
                    Ok(Value::Undefined)
                });
                g.call_global("setTimeout", &[done, Value::Number(100.0)])?;
                Ok(())
            });

            let started = Instant::now();
            rt.run_main("main.js".as_ref()).await.unwrap();
            assert!(fired.get());
            assert!(started.elapsed() >= Duration::from_millis(100));
        })
        .await;
}
