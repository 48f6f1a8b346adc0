//! FIFO admission queue for moderate pressure.
//!
//! Waiters park on a oneshot channel. A single drain task (owned by the
//! resource manager) releases them front to back once pressure drops; the
//! `draining` flag keeps it single.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

/// Why admission was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum AdmissionError {
    #[error("request rejected under resource pressure ({reason})")]
    Rejected { reason: String },

    #[error("timed out after {waited_ms}ms in the admission queue")]
    QueueTimeout { waited_ms: u64 },

    #[error("admission queue is full")]
    QueueOverflow,

    #[error("resource manager is shutting down")]
    ShuttingDown,
}

pub type AdmissionResult = Result<(), AdmissionError>;

struct Waiter {
    id: u64,
    operation: String,
    tx: oneshot::Sender<AdmissionResult>,
}

/// Parked callers, oldest first.
#[derive(Default)]
pub struct AdmissionQueue {
    waiters: Mutex<VecDeque<Waiter>>,
    next_id: AtomicU64,
    draining: AtomicBool,
    closed: AtomicBool,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a caller. Fails immediately once the queue is closed.
    pub fn enqueue(
        &self,
        operation: &str,
    ) -> Result<(u64, oneshot::Receiver<AdmissionResult>), AdmissionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdmissionError::ShuttingDown);
        }
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.waiters
            .lock()
            .expect("admission queue mutex poisoned")
            .push_back(Waiter {
                id,
                operation: operation.to_string(),
                tx,
            });
        Ok((id, rx))
    }

    /// Forget a waiter that gave up. Returns false if it was already released.
    pub fn remove(&self, id: u64) -> bool {
        let mut waiters = self.waiters.lock().expect("admission queue mutex poisoned");
        match waiters.iter().position(|w| w.id == id) {
            Some(index) => {
                waiters.remove(index);
                true
            }
            None => false,
        }
    }

    /// Admit the oldest waiter. Returns its operation.
    pub fn release_front(&self) -> Option<String> {
        loop {
            let waiter = self
                .waiters
                .lock()
                .expect("admission queue mutex poisoned")
                .pop_front()?;
            // A waiter whose receiver is gone timed out concurrently; skip it.
            if waiter.tx.send(Ok(())).is_ok() {
                return Some(waiter.operation);
            }
        }
    }

    /// Admit everyone, oldest first.
    pub fn release_all(&self) -> usize {
        let mut released = 0;
        while self.release_front().is_some() {
            released += 1;
        }
        released
    }

    /// Fail every waiter with `error`.
    pub fn fail_all(&self, error: AdmissionError) -> usize {
        let drained: Vec<Waiter> = self
            .waiters
            .lock()
            .expect("admission queue mutex poisoned")
            .drain(..)
            .collect();
        let count = drained.len();
        for waiter in drained {
            let _ = waiter.tx.send(Err(error.clone()));
        }
        count
    }

    /// Reject the newest waiters until at most `max` remain.
    pub fn trim(&self, max: usize) -> usize {
        let overflow: Vec<Waiter> = {
            let mut waiters = self.waiters.lock().expect("admission queue mutex poisoned");
            let mut overflow = Vec::new();
            while waiters.len() > max {
                if let Some(waiter) = waiters.pop_back() {
                    overflow.push(waiter);
                }
            }
            overflow
        };
        let count = overflow.len();
        for waiter in overflow {
            let _ = waiter.tx.send(Err(AdmissionError::QueueOverflow));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().expect("admission queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim the drain role. Returns false if a drain is already running.
    pub fn try_begin_drain(&self) -> bool {
        self.draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_drain(&self) {
        self.draining.store(false, Ordering::SeqCst);
    }

    /// Refuse new waiters and fail the current ones.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.fail_all(AdmissionError::ShuttingDown)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
