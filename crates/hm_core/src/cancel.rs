use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared stop signal checked at resubmission boundaries.
///
/// Cloning the token shares the same flag. Cancellation is one-way and only
/// stops new work; anything already submitted runs to completion.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
