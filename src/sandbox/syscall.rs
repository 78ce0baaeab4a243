//! Process side of the syscall transport
//!
//! Every privileged operation leaves the sandbox as a `FromContext` message
//! on the outbox. Calls that expect an answer get a correlation id from the
//! pending-call registry and settle when the matching `syscall-response`
//! comes back.

use crate::kernel::ipc::Sender;
use crate::kernel::pending::{PendingCalls, Reply};
use crate::kernel::protocol::{CallId, FromContext};
use serde_json::Value as Json;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

struct ClientInner {
    outbox: Sender<FromContext>,
    pending: RefCell<PendingCalls<Json>>,
    now: Cell<f64>,
}

/// Cloneable handle to the outbox and the pending syscalls
#[derive(Clone)]
pub struct SyscallClient {
    inner: Rc<ClientInner>,
}

impl SyscallClient {
    pub fn new(outbox: Sender<FromContext>) -> Self {
        Self {
            inner: Rc::new(ClientInner {
                outbox,
                pending: RefCell::new(PendingCalls::new()),
                now: Cell::new(0.0),
            }),
        }
    }

    /// Fire-and-forget message
    pub fn send(&self, message: FromContext) {
        // A closed outbox means the context is shutting down
        let _ = self.inner.outbox.send(message);
    }

    /// Send a request built around a fresh correlation id. The message is
    /// on the outbox when this returns; the reply settles later.
    pub fn call<F>(&self, build: F) -> Reply<Json>
    where
        F: FnOnce(CallId) -> FromContext,
    {
        let (id, reply) = self.inner.pending.borrow_mut().register(self.inner.now.get());
        self.send(build(id));
        reply
    }

    /// Deliver a `syscall-response`. Unknown ids are ignored.
    pub fn settle(&self, id: CallId, result: Result<Json, String>) -> bool {
        self.inner.pending.borrow_mut().settle(id, result)
    }

    pub fn set_now(&self, now: f64) {
        self.inner.now.set(now);
    }

    /// Reject calls pending for longer than `timeout_ms`
    pub fn expire(&self, timeout_ms: f64) -> Vec<CallId> {
        let now = self.inner.now.get();
        self.inner.pending.borrow_mut().expire(now, timeout_ms)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.pending.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ipc::channel;
    use crate::kernel::pending::CallError;
    use futures::FutureExt;
    use serde_json::json;

    #[test]
    fn test_call_sends_and_settles() {
        let (tx, rx) = channel();
        let client = SyscallClient::new(tx);

        let reply = client.call(|id| FromContext::FsList {
            id,
            path: "/".to_string(),
        });
        let sent = rx.drain();
        assert_eq!(sent.len(), 1);
        let id = sent[0].call_id().unwrap();

        assert!(client.settle(id, Ok(json!([]))));
        assert!(!client.settle(id, Ok(json!([]))));
        assert_eq!(reply.now_or_never(), Some(Ok(json!([]))));
        assert_eq!(client.in_flight(), 0);
    }

    #[test]
    fn test_expire_uses_call_time() {
        let (tx, _rx) = channel();
        let client = SyscallClient::new(tx);

        client.set_now(100.0);
        let mut old = client.call(|id| FromContext::FsStat {
            id,
            path: "/a".to_string(),
        });
        client.set_now(900.0);
        let mut fresh = client.call(|id| FromContext::FsStat {
            id,
            path: "/b".to_string(),
        });

        client.set_now(1200.0);
        assert_eq!(client.expire(1000.0).len(), 1);
        assert_eq!((&mut old).now_or_never(), Some(Err(CallError::TimedOut)));
        assert!((&mut fresh).now_or_never().is_none());
    }

    #[test]
    fn test_send_after_close_is_silent() {
        let (tx, rx) = channel();
        let client = SyscallClient::new(tx.clone());
        tx.close();
        client.send(FromContext::ProcExit { code: 0 });
        assert!(rx.is_empty());
    }
}
