//! CPU synchronization primitives.
//!
//! [`WaitObject`] is a one-shot, clonable signal used to coordinate frame
//! work between threads: the submission path notifies it exactly once when
//! the last command list of a frame has been handed to the GPU, and a pacing
//! thread blocks on it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A clonable CPU wait object.
///
/// Clones share the same underlying signal. Unlike a GPU fence, a
/// `WaitObject` is purely CPU-side: one thread calls [`notify`](Self::notify)
/// and any number of threads observe it via [`wait`](Self::wait).
#[derive(Debug, Clone, Default)]
pub struct WaitObject {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl WaitObject {
    /// Create a new unsignaled wait object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the object, waking all current and future waiters.
    pub fn notify(&self) {
        let mut signaled = self.inner.signaled.lock();
        *signaled = true;
        self.inner.condvar.notify_all();
    }

    /// Block the calling thread until the object is signaled.
    ///
    /// Returns immediately if already signaled.
    pub fn wait(&self) {
        let mut signaled = self.inner.signaled.lock();
        while !*signaled {
            self.inner.condvar.wait(&mut signaled);
        }
    }

    /// Block until signaled or the timeout elapses.
    ///
    /// Returns `true` if the object was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut signaled = self.inner.signaled.lock();
        while !*signaled {
            if self.inner.condvar.wait_until(&mut signaled, deadline).timed_out() {
                break;
            }
        }
        *signaled
    }

    /// Check the signal without blocking.
    pub fn is_signaled(&self) -> bool {
        *self.inner.signaled.lock()
    }

    /// Reset the object to the unsignaled state.
    ///
    /// Must only be called when no thread is waiting on it.
    pub fn reset(&self) {
        *self.inner.signaled.lock() = false;
    }
}
