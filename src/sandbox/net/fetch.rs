//! Mediated outbound fetch
//!
//! User-level fetches never reach the network directly: they become
//! `net-fetch` syscalls and the supervisor decides where they go. An
//! unmediated fallback can be installed for hosts that opt in; it is only
//! tried when the syscall itself breaks down (timed out or abandoned), never
//! when the supervisor answered with an error.

use crate::kernel::pending::CallError;
use crate::kernel::protocol::{FetchRequest, FetchResponse, FromContext};
use crate::sandbox::syscall::SyscallClient;
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use std::rc::Rc;

/// A direct fetch that bypasses the supervisor
pub type UnmediatedFetch =
    Rc<dyn Fn(FetchRequest) -> LocalBoxFuture<'static, Result<FetchResponse, String>>>;

#[derive(Clone)]
pub struct Fetcher {
    client: SyscallClient,
    fallback: Option<UnmediatedFetch>,
}

impl Fetcher {
    pub fn new(client: SyscallClient) -> Self {
        Self {
            client,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: UnmediatedFetch) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn is_mediated(&self) -> bool {
        self.fallback.is_none()
    }

    pub fn fetch(&self, request: FetchRequest) -> LocalBoxFuture<'static, Result<FetchResponse, String>> {
        let reply = self.client.call(|id| FromContext::NetFetch {
            id,
            request: request.clone(),
        });
        let fallback = self.fallback.clone();

        async move {
            match reply.await {
                Ok(json) => serde_json::from_value(json).map_err(|e| e.to_string()),
                Err(CallError::Remote(message)) => Err(message),
                Err(broken) => match fallback {
                    Some(direct) => direct(request).await,
                    None => Err(broken.to_string()),
                },
            }
        }
        .boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ipc::channel;
    use crate::kernel::protocol;
    use serde_json::json;

    fn ok(body: &str) -> FetchResponse {
        FetchResponse {
            status: 200,
            headers: Default::default(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_fetch_is_a_syscall() {
        let (tx, rx) = channel();
        let client = SyscallClient::new(tx);
        let fetcher = Fetcher::new(client.clone());
        assert!(fetcher.is_mediated());

        let mut pending = fetcher.fetch(FetchRequest::get("https://example.com/"));
        assert!((&mut pending).now_or_never().is_none());

        let id = match &rx.drain()[..] {
            [FromContext::NetFetch { id, request }] => {
                assert_eq!(request.url, "https://example.com/");
                *id
            }
            other => panic!("unexpected {:?}", other),
        };
        let body = protocol::encode_base64(b"hi");
        client.settle(id, Ok(json!({"status": 200, "headers": {}, "body": body})));

        assert_eq!(pending.now_or_never(), Some(Ok(ok("hi"))));
    }

    #[test]
    fn test_remote_error_skips_fallback() {
        let (tx, rx) = channel();
        let client = SyscallClient::new(tx);
        let fetcher = Fetcher::new(client.clone())
            .with_fallback(Rc::new(|_: FetchRequest| async { Ok::<_, String>(ok("direct")) }.boxed_local()));

        let mut pending = fetcher.fetch(FetchRequest::get("https://example.com/"));
        assert!((&mut pending).now_or_never().is_none());
        let id = rx.drain()[0].call_id().unwrap();
        client.settle(id, Err("network egress disabled".to_string()));

        assert_eq!(
            pending.now_or_never(),
            Some(Err("network egress disabled".to_string()))
        );
    }

    #[test]
    fn test_broken_syscall_uses_fallback_only_when_installed() {
        let (tx, _rx) = channel();
        let client = SyscallClient::new(tx);

        let mediated = Fetcher::new(client.clone()).fetch(FetchRequest::get("http://a/"));
        let direct = Fetcher::new(client.clone())
            .with_fallback(Rc::new(|_: FetchRequest| async { Ok::<_, String>(ok("direct")) }.boxed_local()))
            .fetch(FetchRequest::get("http://b/"));

        client.set_now(10_000.0);
        client.expire(1.0);

        assert_eq!(mediated.now_or_never(), Some(Err("call timed out".to_string())));
        assert_eq!(direct.now_or_never(), Some(Ok(ok("direct"))));
    }
}
