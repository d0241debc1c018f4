//! Thread-local storage keys with destructor-on-thread-exit semantics.
//!
//! Keys are process-wide 64-bit identifiers; values are per-thread. When a
//! thread exits, every value it stored runs its key's destructor. This is
//! the dynamic-key complement to `thread_local!`, for callers that mint
//! keys at runtime.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

type Destructor = Box<dyn Fn(*mut ()) + Send + Sync>;

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

fn destructors() -> &'static Mutex<HashMap<u64, Destructor>> {
    static DESTRUCTORS: OnceLock<Mutex<HashMap<u64, Destructor>>> = OnceLock::new();
    DESTRUCTORS.get_or_init(|| Mutex::new(HashMap::new()))
}

struct ThreadValues {
    values: HashMap<u64, *mut ()>,
}

impl Drop for ThreadValues {
    fn drop(&mut self) {
        let table = match destructors().lock() {
            Ok(t) => t,
            Err(p) => p.into_inner(),
        };
        for (key, value) in self.values.drain() {
            if value.is_null() {
                continue;
            }
            if let Some(dtor) = table.get(&key) {
                dtor(value);
            }
        }
    }
}

thread_local! {
    static THREAD_VALUES: RefCell<ThreadValues> = RefCell::new(ThreadValues {
        values: HashMap::new(),
    });
}

/// A process-wide TLS key. Copyable; the key itself is never reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TlsKey(u64);

impl TlsKey {
    /// Allocate a key. `destructor` runs for each thread's stored value
    /// when that thread exits (not when the value is overwritten).
    pub fn create(destructor: Option<Box<dyn Fn(*mut ()) + Send + Sync>>) -> TlsKey {
        let key = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
        if let Some(dtor) = destructor {
            let mut table = match destructors().lock() {
                Ok(t) => t,
                Err(p) => p.into_inner(),
            };
            table.insert(key, dtor);
        }
        TlsKey(key)
    }

    /// Store this thread's value for the key, returning the previous one.
    pub fn set(self, value: *mut ()) -> Option<*mut ()> {
        THREAD_VALUES.with(|tv| tv.borrow_mut().values.insert(self.0, value))
    }

    /// This thread's value for the key.
    pub fn get(self) -> Option<*mut ()> {
        THREAD_VALUES.with(|tv| tv.borrow().values.get(&self.0).copied())
    }

    /// Remove this thread's value without running the destructor.
    pub fn take(self) -> Option<*mut ()> {
        THREAD_VALUES.with(|tv| tv.borrow_mut().values.remove(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn per_thread_isolation() {
        let key = TlsKey::create(None);
        key.set(1 as *mut ());

        let other = std::thread::spawn(move || key.get().map(|p| p as usize)).join();
        assert_eq!(other.ok().flatten(), None);
        assert_eq!(key.get(), Some(1 as *mut ()));
        key.take();
    }

    #[test]
    fn destructor_runs_on_thread_exit() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        let key = TlsKey::create(Some(Box::new(|value| {
            // SAFETY: the test stored a leaked Box<u32>.
            drop(unsafe { Box::from_raw(value as *mut u32) });
            DROPS.fetch_add(1, Ordering::SeqCst);
        })));

        let before = DROPS.load(Ordering::SeqCst);
        std::thread::spawn(move || {
            let boxed = Box::new(7u32);
            key.set(Box::into_raw(boxed) as *mut ());
        })
        .join()
        .ok();

        assert_eq!(DROPS.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn keys_are_distinct() {
        let a = TlsKey::create(None);
        let b = TlsKey::create(None);
        assert_ne!(a, b);
        a.set(10 as *mut ());
        b.set(20 as *mut ());
        assert_eq!(a.get(), Some(10 as *mut ()));
        assert_eq!(b.get(), Some(20 as *mut ()));
        let _ = Arc::new(());
        a.take();
        b.take();
    }
}
