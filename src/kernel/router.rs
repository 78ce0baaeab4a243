//! Network loopback router
//!
//! Resolves `host:port/path` to the process bound on that port and relays
//! one request/response pair through the transport. The router owns the
//! pending loopback calls; the supervisor owns the port table and the
//! process table and hands both in when resolving.

use super::pending::{CallError, PendingCalls, Reply};
use super::process::{Pid, PortTable};
use super::protocol::{CallId, FetchResponse};
use regex::Regex;
use std::future::Future;
use std::pin::Pin;
use std::sync::LazyLock;
use std::task::{Context, Poll};

static TARGET: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(?:[A-Za-z][A-Za-z0-9+.\-]*://)?([A-Za-z0-9.\-]+|\[[0-9A-Fa-f:]+\]):(\d{1,5})(/[^#]*)?$")
        .ok()
});

/// Why a loopback call produced no response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackError {
    /// The URL is not of the `host:port/path` form
    InvalidUrl(String),
    /// Nothing is bound on the port
    ConnectionRefused { port: u16 },
    /// The port's owner is gone; the stale binding has been evicted
    ProcessDead { port: u16, pid: Pid },
    /// Unanswered for longer than the configured call timeout
    TimedOut { port: u16 },
    /// The router went away before an answer
    Abandoned,
}

impl std::fmt::Display for LoopbackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopbackError::InvalidUrl(url) => write!(f, "invalid loopback url: {}", url),
            LoopbackError::ConnectionRefused { port } => {
                write!(f, "connection refused: nothing listening on port {}", port)
            }
            LoopbackError::ProcessDead { port, pid } => {
                write!(f, "process dead: {} no longer serves port {}", pid, port)
            }
            LoopbackError::TimedOut { port } => write!(f, "request to port {} timed out", port),
            LoopbackError::Abandoned => write!(f, "request abandoned"),
        }
    }
}

impl std::error::Error for LoopbackError {}

/// A parsed loopback address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackTarget {
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/`
    pub path: String,
}

impl LoopbackTarget {
    /// Whether the host names this machine
    pub fn is_local(&self) -> bool {
        matches!(
            self.host.to_ascii_lowercase().as_str(),
            "localhost" | "127.0.0.1" | "0.0.0.0" | "[::1]"
        )
    }
}

/// Parse `[scheme://]host:port[/path]`. No network round-trip.
pub fn parse_target(url: &str) -> Result<LoopbackTarget, LoopbackError> {
    let invalid = || LoopbackError::InvalidUrl(url.to_string());
    let caps = TARGET
        .as_ref()
        .and_then(|re| re.captures(url.trim()))
        .ok_or_else(invalid)?;

    let host = caps.get(1).map(|m| m.as_str().to_string()).ok_or_else(invalid)?;
    let port = caps
        .get(2)
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .ok_or_else(invalid)?;
    let path = caps
        .get(3)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    Ok(LoopbackTarget { host, port, path })
}

/// Pending loopback calls
pub struct LoopbackRouter {
    pending: PendingCalls<FetchResponse>,
}

impl LoopbackRouter {
    pub fn new() -> Self {
        Self {
            pending: PendingCalls::new(),
        }
    }

    /// Find the process serving `url`
    ///
    /// A binding whose owner `is_live` rejects is evicted on the spot, so
    /// the next call for that port is refused instead.
    pub fn resolve(
        &self,
        url: &str,
        ports: &mut PortTable,
        is_live: impl Fn(Pid) -> bool,
    ) -> Result<(Pid, LoopbackTarget), LoopbackError> {
        let target = parse_target(url)?;
        let port = target.port;

        let owner = ports
            .owner(port)
            .ok_or(LoopbackError::ConnectionRefused { port })?;

        if !is_live(owner) {
            ports.evict(port);
            return Err(LoopbackError::ProcessDead { port, pid: owner });
        }

        Ok((owner, target))
    }

    /// Register a call to `port`; the returned id goes into the
    /// `net-request`
    pub fn open(&mut self, now: f64, port: u16) -> (CallId, LoopbackCall) {
        let (id, reply) = self.pending.register(now);
        (id, LoopbackCall::waiting(port, reply))
    }

    /// Deliver an `http-response`. Unknown ids are ignored.
    pub fn settle(&mut self, request_id: CallId, response: FetchResponse) -> bool {
        self.pending.settle(request_id, Ok(response))
    }

    /// Reject calls older than `timeout_ms`
    pub fn expire(&mut self, now: f64, timeout_ms: f64) -> Vec<CallId> {
        self.pending.expire(now, timeout_ms)
    }

    /// Calls still waiting for an answer
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

impl Default for LoopbackRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Future of one loopback call
pub struct LoopbackCall {
    state: CallState,
}

enum CallState {
    Done(Option<Result<FetchResponse, LoopbackError>>),
    Waiting { port: u16, reply: Reply<FetchResponse> },
}

impl LoopbackCall {
    /// A call that failed before leaving the supervisor
    pub fn failed(error: LoopbackError) -> Self {
        Self {
            state: CallState::Done(Some(Err(error))),
        }
    }

    fn waiting(port: u16, reply: Reply<FetchResponse>) -> Self {
        Self {
            state: CallState::Waiting { port, reply },
        }
    }
}

impl Future for LoopbackCall {
    type Output = Result<FetchResponse, LoopbackError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            CallState::Done(result) => match result.take() {
                Some(result) => Poll::Ready(result),
                None => Poll::Ready(Err(LoopbackError::Abandoned)),
            },
            CallState::Waiting { port, reply } => {
                let port = *port;
                match Pin::new(reply).poll(cx) {
                    Poll::Ready(Ok(response)) => Poll::Ready(Ok(response)),
                    Poll::Ready(Err(CallError::TimedOut)) => {
                        Poll::Ready(Err(LoopbackError::TimedOut { port }))
                    }
                    Poll::Ready(Err(_)) => Poll::Ready(Err(LoopbackError::Abandoned)),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn ok_response(body: &str) -> FetchResponse {
        FetchResponse {
            status: 200,
            headers: Default::default(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_parse_target() {
        let t = parse_target("localhost:3000/api?x=1").unwrap();
        assert_eq!(t.host, "localhost");
        assert_eq!(t.port, 3000);
        assert_eq!(t.path, "/api?x=1");
        assert!(t.is_local());

        let t = parse_target("http://127.0.0.1:8080").unwrap();
        assert_eq!(t.path, "/");
        assert!(t.is_local());

        assert!(!parse_target("http://example.com:80/").unwrap().is_local());
    }

    #[test]
    fn test_parse_rejects_without_port() {
        assert_eq!(
            parse_target("localhost/api"),
            Err(LoopbackError::InvalidUrl("localhost/api".to_string()))
        );
        assert!(parse_target("http://example.com/").is_err());
        assert!(parse_target("localhost:99999/").is_err());
    }

    #[test]
    fn test_resolve_refused_and_dead() {
        let router = LoopbackRouter::new();
        let mut ports = PortTable::new();

        assert_eq!(
            router.resolve("localhost:4000/", &mut ports, |_| true),
            Err(LoopbackError::ConnectionRefused { port: 4000 })
        );

        ports.bind(4000, Pid(7)).unwrap();
        assert_eq!(
            router.resolve("localhost:4000/", &mut ports, |_| false),
            Err(LoopbackError::ProcessDead {
                port: 4000,
                pid: Pid(7)
            })
        );
        // Stale binding is gone
        assert_eq!(ports.owner(4000), None);
        assert_eq!(
            router.resolve("localhost:4000/", &mut ports, |_| false),
            Err(LoopbackError::ConnectionRefused { port: 4000 })
        );
    }

    #[test]
    fn test_resolve_live_owner() {
        let router = LoopbackRouter::new();
        let mut ports = PortTable::new();
        ports.bind(5000, Pid(2)).unwrap();

        let (pid, target) = router.resolve("localhost:5000/hi", &mut ports, |_| true).unwrap();
        assert_eq!(pid, Pid(2));
        assert_eq!(target.path, "/hi");
    }

    #[test]
    fn test_settle_out_of_order() {
        let mut router = LoopbackRouter::new();
        let (a, call_a) = router.open(0.0, 1);
        let (b, call_b) = router.open(0.0, 2);

        assert!(router.settle(b, ok_response("b")));
        assert!(router.settle(a, ok_response("a")));
        assert!(!router.settle(a, ok_response("again")));

        assert_eq!(call_b.now_or_never().unwrap().unwrap().body, b"b");
        assert_eq!(call_a.now_or_never().unwrap().unwrap().body, b"a");
    }

    #[test]
    fn test_unanswered_call_waits_until_expired() {
        let mut router = LoopbackRouter::new();
        let (_id, mut call) = router.open(0.0, 9000);

        assert!((&mut call).now_or_never().is_none());
        assert_eq!(router.in_flight(), 1);

        router.expire(10_000.0, 5_000.0);
        assert_eq!(
            call.now_or_never(),
            Some(Err(LoopbackError::TimedOut { port: 9000 }))
        );
    }

    #[test]
    fn test_failed_call_is_ready() {
        let call = LoopbackCall::failed(LoopbackError::ConnectionRefused { port: 1 });
        assert_eq!(
            call.now_or_never(),
            Some(Err(LoopbackError::ConnectionRefused { port: 1 }))
        );
    }
}
