//! Completion events for asynchronous device commands.
//!
//! Every enqueued command returns an [`Event`]. Other commands list events
//! they depend on, and the host either blocks on an event or registers a
//! callback that fires when it reaches a terminal state.

use crate::{PipelineError, Result, lock};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// State of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Complete,
    Failed(PipelineError),
}

impl EventStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventStatus::Pending)
    }

    /// Converts a terminal status into a result. `Pending` counts as success.
    pub fn into_result(self) -> Result<()> {
        match self {
            EventStatus::Failed(err) => Err(err),
            _ => Ok(()),
        }
    }
}

type Callback = Box<dyn FnOnce(&EventStatus) + Send>;

struct State {
    status: EventStatus,
    callbacks: Vec<Callback>,
}

struct Inner {
    state: Mutex<State>,
    done: Condvar,
}

/// Shared handle to a command's completion.
#[derive(Clone)]
pub struct Event {
    inner: Arc<Inner>,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Event").field(&self.status()).finish()
    }
}

impl Event {
    /// Creates a pending event.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    status: EventStatus::Pending,
                    callbacks: Vec::new(),
                }),
                done: Condvar::new(),
            }),
        }
    }

    pub fn status(&self) -> EventStatus {
        lock(&self.inner.state).status.clone()
    }

    /// Registers a callback that runs once the event is terminal.
    ///
    /// If the event already finished, `f` runs immediately on the calling
    /// thread. Otherwise it runs on whichever thread completes the event.
    pub fn on_complete(&self, f: impl FnOnce(&EventStatus) + Send + 'static) {
        let mut state = lock(&self.inner.state);
        if state.status.is_terminal() {
            let status = state.status.clone();
            drop(state);
            f(&status);
        } else {
            state.callbacks.push(Box::new(f));
        }
    }

    /// Moves the event into its terminal state and runs its callbacks.
    ///
    /// Only the first call has an effect; it returns `false` afterwards.
    pub fn complete(&self, result: Result<()>) -> bool {
        let status = match result {
            Ok(()) => EventStatus::Complete,
            Err(err) => EventStatus::Failed(err),
        };
        let callbacks = {
            let mut state = lock(&self.inner.state);
            if state.status.is_terminal() {
                return false;
            }
            state.status = status.clone();
            std::mem::take(&mut state.callbacks)
        };
        self.inner.done.notify_all();
        for callback in callbacks {
            callback(&status);
        }
        true
    }

    /// Blocks until the event is terminal and returns its outcome.
    pub fn wait(&self) -> Result<()> {
        let mut state = lock(&self.inner.state);
        while !state.status.is_terminal() {
            state = self
                .inner
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.status.clone().into_result()
    }
}

/// Blocks on every event in `events`, returning the first failure.
pub fn wait_all(events: &[Event]) -> Result<()> {
    let mut first = Ok(());
    for event in events {
        let outcome = event.wait();
        if first.is_ok() {
            first = outcome;
        }
    }
    first
}
