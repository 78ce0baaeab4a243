//! Pending-call registry
//!
//! One generic table keyed by correlation id, used on both sides of the
//! transport: the sandbox syscall client stores its outbound syscalls here,
//! the supervisor loopback router stores its outbound HTTP requests here.
//!
//! Ids are monotonic and never reused. A settlement for an unknown id is
//! ignored. Entries nobody settles stay pending until `expire` rejects
//! them or the registry is dropped, which abandons them.

use super::protocol::CallId;
use futures::channel::oneshot;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Why a pending call settled without a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The other side answered with an error
    Remote(String),
    /// Unsettled for longer than the configured timeout
    TimedOut,
    /// The registry went away before settling
    Abandoned,
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Remote(msg) => write!(f, "{}", msg),
            CallError::TimedOut => write!(f, "call timed out"),
            CallError::Abandoned => write!(f, "call abandoned"),
        }
    }
}

impl std::error::Error for CallError {}

struct Entry<T> {
    tx: oneshot::Sender<Result<T, CallError>>,
    registered_at: f64,
}

/// Correlation table for calls awaiting an answer
pub struct PendingCalls<T> {
    next_id: CallId,
    entries: HashMap<CallId, Entry<T>>,
}

impl<T> PendingCalls<T> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    /// Allocate an id and the future that settles with it
    pub fn register(&mut self, now: f64) -> (CallId, Reply<T>) {
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            id,
            Entry {
                tx,
                registered_at: now,
            },
        );
        (id, Reply { rx })
    }

    /// Settle a call with the other side's answer. Returns false for an
    /// unknown or already-settled id.
    pub fn settle(&mut self, id: CallId, result: Result<T, String>) -> bool {
        self.complete(id, result.map_err(CallError::Remote))
    }

    /// Settle a call with a local failure
    pub fn fail(&mut self, id: CallId, error: CallError) -> bool {
        self.complete(id, Err(error))
    }

    fn complete(&mut self, id: CallId, result: Result<T, CallError>) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                // The caller may have stopped waiting; that is not an error
                let _ = entry.tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Reject every call registered more than `timeout_ms` before `now`.
    /// Returns the rejected ids, oldest first.
    pub fn expire(&mut self, now: f64, timeout_ms: f64) -> Vec<CallId> {
        let mut expired: Vec<CallId> = self
            .entries
            .iter()
            .filter(|(_, entry)| now - entry.registered_at >= timeout_ms)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();

        for id in &expired {
            self.fail(*id, CallError::TimedOut);
        }
        expired
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for PendingCalls<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Future side of one pending call
pub struct Reply<T> {
    rx: oneshot::Receiver<Result<T, CallError>>,
}

impl<T> Future for Reply<T> {
    type Output = Result<T, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(CallError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}
