//! Event loop behavior: task ordering, timers, exit conditions, wakeups,
//! and pipe objects.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use evio::event::{Event, EventFlags, EventType, RunResult, Statistic, TIMEOUT_INF};
use evio::io::{osevent, pipe};

mod util;
use util::{init, run_until, Recorder};

#[test]
fn queued_tasks_fire_in_order() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let a = Arc::clone(&order);
    let b = Arc::clone(&order);

    event.queue_task(move |_| a.lock().unwrap().push("A"));
    event.queue_task(move |_| b.lock().unwrap().push("B"));

    // Both fire within the same dispatch pass.
    event.run(50);
    assert_eq!(*order.lock().unwrap(), vec!["A", "B"]);
}

#[test]
fn run_returns_timeout() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();

    let start = Instant::now();
    assert_eq!(event.run(30), RunResult::Timeout);
    assert!(start.elapsed() >= Duration::from_millis(30));
}

#[test]
fn done_from_task_returns_done() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();

    let ev2 = event.clone();
    event.queue_task(move |_| ev2.done());
    assert_eq!(event.run(TIMEOUT_INF), RunResult::Done);
}

#[test]
fn exit_on_empty_with_no_objects() {
    init();
    let event = Event::create(EventFlags::EXIT_ON_EMPTY).unwrap();
    assert_eq!(event.run(TIMEOUT_INF), RunResult::Done);
}

#[test]
fn oneshot_timer_fires_once_at_delay() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&fired);
    let start = Instant::now();
    let when = Arc::new(Mutex::new(None));
    let w = Arc::clone(&when);

    event.timer_oneshot(50, true, move |_| {
        f.fetch_add(1, Ordering::SeqCst);
        *w.lock().unwrap() = Some(start.elapsed());
    });

    event.run(200);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    let elapsed = when.lock().unwrap().expect("timer fired");
    assert!(elapsed >= Duration::from_millis(45), "fired at {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(180), "fired at {:?}", elapsed);
}

#[test]
fn periodic_timer_respects_firecount() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();
    let ev = event.distribute();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&fired);
    let timer = ev.timer_add(move |_| {
        f.fetch_add(1, Ordering::SeqCst);
    });
    timer.set_firecount(3);
    timer.reset(10);

    event.run(200);
    assert_eq!(fired.load(Ordering::SeqCst), 3);
    timer.remove();
}

#[test]
fn stopped_timer_never_fires() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();
    let ev = event.distribute();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&fired);
    let timer = ev.timer_add(move |_| {
        f.fetch_add(1, Ordering::SeqCst);
    });
    timer.reset(20);
    timer.stop();

    event.run(80);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    timer.remove();
}

#[test]
fn cross_thread_trigger_delivers_other() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();

    let rec = Recorder::new();
    let r = rec.clone();
    let (_io, trigger) = osevent::create(&event, move |_ev, ty, _io| {
        r.push("osevent", ty);
    })
    .unwrap();

    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        trigger.trigger();
    });

    assert!(run_until(&event, 2_000, || rec.count("osevent", EventType::Other) > 0));
    handle.join().unwrap();
}

#[test]
fn pipe_data_flow_and_close() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();

    let (reader, writer) = pipe::create().unwrap();
    let rec = Recorder::new();
    let got = Arc::new(Mutex::new(Vec::new()));

    let r = rec.clone();
    let g = Arc::clone(&got);
    event.add(&reader, move |_ev, ty, io| {
        r.push("reader", ty);
        if ty == EventType::Read {
            let mut buf = [0u8; 64];
            if let Ok(n) = io.read(&mut buf) {
                g.lock().unwrap().extend_from_slice(&buf[..n]);
            }
        }
    });

    let r = rec.clone();
    let writer2 = Arc::clone(&writer);
    event.add(&writer, move |_ev, ty, _io| {
        r.push("writer", ty);
        if ty == EventType::Connected {
            let _ = writer2.write(b"hello");
        }
    });

    assert!(run_until(&event, 2_000, || got.lock().unwrap().len() == 5));
    assert_eq!(&*got.lock().unwrap(), b"hello");

    // Closing the write end surfaces Disconnected on the reader.
    writer.disconnect();
    assert!(run_until(&event, 2_000, || {
        rec.count("reader", EventType::Disconnected) > 0
    }));

    reader.destroy();
    writer.destroy();
}

#[test]
fn object_binds_to_one_loop_only() {
    init();
    let event_a = Event::create(EventFlags::NONE).unwrap();
    let event_b = Event::create(EventFlags::NONE).unwrap();

    let (reader, _writer) = pipe::create().unwrap();
    assert!(event_a.add(&reader, |_ev, _ty, _io| {}));
    assert!(!event_a.add(&reader, |_ev, _ty, _io| {}));
    assert!(!event_b.add(&reader, |_ev, _ty, _io| {}));

    // After a synchronous remove the object can bind again.
    event_a.distribute().remove(&reader);
    assert!(event_b.add(&reader, |_ev, _ty, _io| {}));
    reader.destroy();
}

#[test]
fn wake_statistics_accumulate() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();
    event.run(20);
    assert!(event.statistic(Statistic::WakeCount) > 0);
}

#[test]
fn done_with_disconnect_closes_objects() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();

    let (reader, writer) = pipe::create().unwrap();
    let rec = Recorder::new();

    let r = rec.clone();
    event.add(&reader, move |_ev, ty, io| {
        r.push("reader", ty);
        if ty == EventType::Disconnected {
            io.destroy();
        }
    });
    let r = rec.clone();
    event.add(&writer, move |_ev, ty, io| {
        r.push("writer", ty);
        if ty == EventType::Disconnected {
            io.destroy();
        }
    });

    event.done_with_disconnect(10, 500);
    let rv = event.run(5_000);

    // Both objects got their graceful close and the loop drained empty.
    assert_eq!(rec.count("reader", EventType::Disconnected), 1);
    assert_eq!(rec.count("writer", EventType::Disconnected), 1);
    assert_eq!(rv, RunResult::Done);
}
