//! Query cancellation.
//!
//! Cancellation arrives asynchronously: a signal handler or another thread
//! trips the flag through an [`InterruptHandle`], and the backend notices it
//! the next time it calls [`check_for_interrupts`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::elog::{self, SqlState};

thread_local! {
    static PENDING: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
}

/// Trips the cancellation flag of the thread it was obtained on.
#[derive(Debug, Clone)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    /// Requests cancellation of the running statement.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Handle for the calling thread's flag; may be sent to other threads.
pub fn interrupt_handle() -> InterruptHandle {
    PENDING.with(|flag| InterruptHandle(Arc::clone(flag)))
}

/// Whether a cancellation is waiting to be serviced.
pub fn interrupt_pending() -> bool {
    PENDING.with(|flag| flag.load(Ordering::Acquire))
}

/// Raises ERROR `canceling statement due to user request` if a cancellation
/// is pending, clearing the flag.
#[track_caller]
pub fn check_for_interrupts() {
    if PENDING.with(|flag| flag.swap(false, Ordering::AcqRel)) {
        elog::error(
            SqlState::QUERY_CANCELED,
            "canceling statement due to user request",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_is_shared_across_threads() {
        let handle = interrupt_handle();
        assert!(!interrupt_pending());

        std::thread::spawn(move || handle.cancel()).join().unwrap();
        assert!(interrupt_pending());
    }

    #[test]
    fn test_other_threads_have_their_own_flag() {
        interrupt_handle().cancel();
        let elsewhere = std::thread::spawn(interrupt_pending).join().unwrap();
        assert!(!elsewhere);
        assert!(interrupt_pending());
    }
}
