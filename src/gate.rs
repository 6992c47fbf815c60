//! Closable callback slot shared by the dispatcher and the connectivity monitor.
//!
//! A slot is invoked from an SDK delivery thread and closed from the owner's
//! thread. After `close` returns the callback is never entered again. `close`
//! waits for an in-flight call made on another thread, and returns at once
//! when called from inside the callback itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};

pub(crate) struct CallbackSlot<F: ?Sized> {
    open: AtomicBool,
    /// Thread currently inside `invoke`, if any.
    delivering: Mutex<Option<ThreadId>>,
    callback: Mutex<Option<Box<F>>>,
}

impl<F: ?Sized> CallbackSlot<F> {
    pub(crate) fn new(callback: Box<F>) -> Self {
        Self {
            open: AtomicBool::new(true),
            delivering: Mutex::new(None),
            callback: Mutex::new(Some(callback)),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Run `f` against the callback unless the slot has been closed.
    pub(crate) fn invoke<R>(&self, f: impl FnOnce(&mut F) -> R) -> Option<R> {
        if !self.is_open() {
            return None;
        }
        *relock(&self.delivering) = Some(thread::current().id());
        let result = {
            let mut callback = relock(&self.callback);
            if self.is_open() {
                callback.as_mut().map(|cb| f(cb.as_mut()))
            } else {
                None
            }
        };
        *relock(&self.delivering) = None;
        result
    }

    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let on_delivery_thread = *relock(&self.delivering) == Some(thread::current().id());
        if on_delivery_thread {
            // Still inside the callback; it cannot be re-entered once `open`
            // is false, and it is dropped with the slot.
            return;
        }
        relock(&self.callback).take();
    }
}

/// Lock a mutex, recovering the data if a callback panicked while holding it.
pub(crate) fn relock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
