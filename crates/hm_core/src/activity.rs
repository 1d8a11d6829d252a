use crate::lock;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Counts units of outstanding work and lets a thread wait for zero.
#[derive(Default)]
pub(crate) struct Activity {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Activity {
    pub(crate) fn enter(&self) {
        *lock(&self.count) += 1;
    }

    pub(crate) fn exit(&self) {
        let mut count = lock(&self.count);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    pub(crate) fn current(&self) -> usize {
        *lock(&self.count)
    }

    pub(crate) fn wait_idle(&self) {
        let mut count = lock(&self.count);
        while *count != 0 {
            count = self
                .idle
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Waits for zero for at most `timeout`. Returns true if idle.
    pub(crate) fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let count = lock(&self.count);
        let (count, _) = self
            .idle
            .wait_timeout_while(count, timeout, |c| *c != 0)
            .unwrap_or_else(PoisonError::into_inner);
        *count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_idle_returns_after_last_exit() {
        let activity = Arc::new(Activity::default());
        activity.enter();
        activity.enter();
        assert!(!activity.wait_idle_timeout(Duration::from_millis(5)));

        let remote = activity.clone();
        let handle = thread::spawn(move || {
            remote.exit();
            remote.exit();
        });
        activity.wait_idle();
        handle.join().unwrap();
        assert_eq!(activity.current(), 0);
    }
}
