use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts live tunnel sessions for the server it belongs to
#[derive(Debug, Default, Clone)]
pub struct SessionTracker {
    active: Arc<AtomicUsize>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session; it ends when the returned guard is dropped
    pub fn enter(&self) -> SessionGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        SessionGuard {
            active: Arc::clone(&self.active),
            decremented: false,
        }
    }

    /// Get the current active session count
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// RAII guard to ensure the session count is properly decremented
#[derive(Debug)]
pub struct SessionGuard {
    active: Arc<AtomicUsize>,
    decremented: bool,
}

impl SessionGuard {
    /// Manually end the session before the guard goes out of scope
    pub fn decrement(&mut self) {
        if !self.decremented {
            self.active.fetch_sub(1, Ordering::AcqRel);
            self.decremented = true;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.decrement();
    }
}
