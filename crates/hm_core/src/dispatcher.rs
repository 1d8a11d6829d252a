//! Completion dispatcher.
//!
//! Device callbacks run on runtime-owned engine threads and must not block
//! them. The callback a job registers only pushes a [`Completion`] onto an
//! unbounded queue; a fixed set of dispatcher threads drains the queue and
//! runs [`Job::on_complete`], which performs the resubmission.

use crate::event::EventStatus;
use crate::job::Job;
use crate::{PipelineError, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

/// A finished run waiting for its continuation.
pub struct Completion {
    pub job: Arc<Job>,
    pub status: EventStatus,
}

enum Message {
    Complete(Completion),
    Stop,
}

/// Handle used by jobs to hand completions to the dispatcher.
#[derive(Clone)]
pub struct CompletionSender {
    tx: Sender<Message>,
}

impl CompletionSender {
    /// Queues a completion without blocking.
    ///
    /// If the dispatcher already shut down the completion is handed back.
    pub fn send(&self, completion: Completion) -> Result<(), Completion> {
        self.tx
            .send(Message::Complete(completion))
            .map_err(|err| match err.into_inner() {
                Message::Complete(completion) => completion,
                Message::Stop => unreachable!("only completions are sent through the handle"),
            })
    }
}

/// Fixed pool of threads running job continuations.
pub struct CompletionDispatcher {
    tx: Sender<Message>,
    workers: Vec<JoinHandle<()>>,
    dispatched: Arc<AtomicU64>,
}

impl CompletionDispatcher {
    pub fn new(threads: usize) -> Result<Self> {
        let (tx, rx) = unbounded();
        let dispatched = Arc::new(AtomicU64::new(0));
        let mut workers = Vec::with_capacity(threads.max(1));

        for i in 0..threads.max(1) {
            let rx: Receiver<Message> = rx.clone();
            let dispatched = dispatched.clone();
            let handle = thread::Builder::new()
                .name(format!("hm-dispatch-{}", i))
                .spawn(move || {
                    while let Ok(Message::Complete(completion)) = rx.recv() {
                        trace!(job = completion.job.id(), "dispatch completion");
                        completion.job.on_complete(completion.status);
                        dispatched.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .map_err(|e| PipelineError::Runtime(format!("dispatcher thread: {}", e)))?;
            workers.push(handle);
        }
        debug!(threads = workers.len(), "completion dispatcher started");

        Ok(Self {
            tx,
            workers,
            dispatched,
        })
    }

    pub fn sender(&self) -> CompletionSender {
        CompletionSender {
            tx: self.tx.clone(),
        }
    }

    /// Number of completions whose continuation has run.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Stops every dispatcher thread after the completions already queued.
    pub fn shutdown(&mut self) {
        for _ in 0..self.workers.len() {
            let _ = self.tx.send(Message::Stop);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("dispatcher thread panicked");
            }
        }
    }
}

impl Drop for CompletionDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
