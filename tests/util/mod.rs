// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use evio::event::{Event, EventType};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// Drive the loop in small slices until `pred` holds or `timeout_ms`
/// passes.
pub fn run_until(event: &Event, timeout_ms: u64, pred: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while !pred() {
        if start.elapsed() > Duration::from_millis(timeout_ms) {
            return false;
        }
        event.run(10);
    }
    true
}

/// Thread-safe log of delivered events for assertions.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<(String, EventType)>>>,
}

impl Recorder {
    pub fn new() -> Recorder {
        Recorder::default()
    }

    pub fn push(&self, who: &str, ty: EventType) {
        self.events.lock().unwrap().push((who.to_string(), ty));
    }

    pub fn count(&self, who: &str, ty: EventType) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(w, t)| w == who && *t == ty)
            .count()
    }

    pub fn all(&self) -> Vec<(String, EventType)> {
        self.events.lock().unwrap().clone()
    }
}
