//! Host network bridge
//!
//! The sandbox's virtual sockets and mediated fetches end up here: the
//! supervisor hands every non-loopback `net-fetch` and every TCP syscall to
//! a trusted `HostNetwork` capability and turns its completions back into
//! messages for the owning process.
//!
//! Browsers cannot open raw sockets, so the real implementation is
//! `RelayNetwork`: a JSON protocol over a text transport (a WebSocket in
//! the browser) to a relay server that performs the I/O. The default is
//! `DeniedNetwork`, which refuses all egress.

use super::protocol::{FetchRequest, FetchResponse, Headers, decode_base64, encode_base64};
use crate::console_log;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Supervisor-assigned id of one host operation
pub type OpId = u64;

/// Work for the host network
#[derive(Debug, Clone, PartialEq)]
pub enum HostOp {
    Fetch {
        op: OpId,
        request: FetchRequest,
    },
    TcpOpen {
        op: OpId,
        host: String,
        port: u16,
        tls: bool,
        server_name: Option<String>,
        insecure: bool,
    },
    TcpWrite {
        op: OpId,
        stream_id: u64,
        data: Vec<u8>,
    },
    /// Best-effort; completes with a `TcpClosed` event, not an op result
    TcpClose { stream_id: u64 },
}

/// What the host network reports back
#[derive(Debug, Clone, PartialEq)]
pub enum NetCompletion {
    Fetch {
        op: OpId,
        result: Result<FetchResponse, String>,
    },
    TcpOpened {
        op: OpId,
        result: Result<u64, String>,
    },
    TcpWritten {
        op: OpId,
        result: Result<(), String>,
    },
    /// Bytes arrived on an open stream
    TcpData { stream_id: u64, data: Vec<u8> },
    /// A stream closed, by request or by the peer
    TcpClosed {
        stream_id: u64,
        error: Option<String>,
    },
}

/// Trusted egress capability
pub trait HostNetwork {
    fn submit(&mut self, op: HostOp);

    /// Completions that arrived since the last drain
    fn drain(&mut self) -> Vec<NetCompletion>;
}

/// Refuses every operation
#[derive(Default)]
pub struct DeniedNetwork {
    completions: VecDeque<NetCompletion>,
}

const EGRESS_DISABLED: &str = "network egress disabled";

impl DeniedNetwork {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostNetwork for DeniedNetwork {
    fn submit(&mut self, op: HostOp) {
        let completion = match op {
            HostOp::Fetch { op, .. } => NetCompletion::Fetch {
                op,
                result: Err(EGRESS_DISABLED.to_string()),
            },
            HostOp::TcpOpen { op, .. } => NetCompletion::TcpOpened {
                op,
                result: Err(EGRESS_DISABLED.to_string()),
            },
            HostOp::TcpWrite { op, .. } => NetCompletion::TcpWritten {
                op,
                result: Err(EGRESS_DISABLED.to_string()),
            },
            HostOp::TcpClose { stream_id } => NetCompletion::TcpClosed {
                stream_id,
                error: None,
            },
        };
        self.completions.push_back(completion);
    }

    fn drain(&mut self) -> Vec<NetCompletion> {
        self.completions.drain(..).collect()
    }
}

// ============================================================================
// Relay protocol
// ============================================================================

/// Text pipe to the relay server
pub trait RelayTransport {
    fn send(&mut self, text: &str) -> Result<(), String>;

    /// Messages received since the last call
    fn recv(&mut self) -> Vec<String>;
}

const BASE64: &str = "base64";

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RelayRequest<'a> {
    #[serde(rename_all = "camelCase")]
    Fetch {
        id: u64,
        url: &'a str,
        method: &'a str,
        headers: &'a Headers,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body_encoding: Option<&'static str>,
    },
    #[serde(rename_all = "camelCase")]
    TcpOpen {
        id: u64,
        host: &'a str,
        port: u16,
        tls: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        server_name: Option<&'a str>,
        insecure: bool,
    },
    #[serde(rename_all = "camelCase")]
    TcpWrite {
        id: u64,
        stream_id: u64,
        data: String,
        data_encoding: &'static str,
    },
    #[serde(rename_all = "camelCase")]
    TcpClose { id: u64, stream_id: u64 },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RelayEvent {
    #[serde(rename_all = "camelCase")]
    Fetch {
        id: u64,
        #[serde(default)]
        status: u16,
        #[serde(default)]
        headers: Headers,
        body: Option<String>,
        body_encoding: Option<String>,
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TcpOpen {
        id: u64,
        stream_id: Option<u64>,
        #[serde(default)]
        ok: bool,
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TcpWrite {
        id: u64,
        #[serde(default)]
        ok: bool,
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TcpData {
        stream_id: u64,
        data: String,
        data_encoding: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TcpClose {
        stream_id: u64,
        error: Option<String>,
    },
}

/// What a relay request id stands for
enum Inflight {
    Fetch(OpId),
    Open(OpId),
    Write(OpId),
    Close { stream_id: u64 },
}

/// `HostNetwork` speaking the relay wire protocol
pub struct RelayNetwork<T: RelayTransport> {
    transport: T,
    next_id: u64,
    inflight: HashMap<u64, Inflight>,
    completions: Vec<NetCompletion>,
}

impl<T: RelayTransport> RelayNetwork<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            next_id: 1,
            inflight: HashMap::new(),
            completions: Vec::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn send(&mut self, id: u64, request: &RelayRequest<'_>, kind: Inflight) {
        let sent = serde_json::to_string(request)
            .map_err(|e| e.to_string())
            .and_then(|text| self.transport.send(&text));

        match sent {
            Ok(()) => {
                self.inflight.insert(id, kind);
            }
            Err(e) => {
                let error = format!("relay unavailable: {}", e);
                self.fail(kind, error);
            }
        }
    }

    fn fail(&mut self, kind: Inflight, error: String) {
        let completion = match kind {
            Inflight::Fetch(op) => NetCompletion::Fetch { op, result: Err(error) },
            Inflight::Open(op) => NetCompletion::TcpOpened { op, result: Err(error) },
            Inflight::Write(op) => NetCompletion::TcpWritten { op, result: Err(error) },
            Inflight::Close { .. } => return,
        };
        self.completions.push(completion);
    }

    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn handle_event(&mut self, text: &str) {
        let event: RelayEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                console_log!("[relay] Dropping bad message: {}", e);
                return;
            }
        };

        match event {
            RelayEvent::Fetch {
                id,
                status,
                headers,
                body,
                body_encoding,
                error,
            } => {
                let Some(Inflight::Fetch(op)) = self.inflight.remove(&id) else {
                    return;
                };
                let result = match error {
                    Some(error) => Err(error),
                    None => decode_payload(body.as_deref().unwrap_or(""), body_encoding.as_deref())
                        .map(|body| FetchResponse {
                            status,
                            headers,
                            body,
                        }),
                };
                self.completions.push(NetCompletion::Fetch { op, result });
            }
            RelayEvent::TcpOpen {
                id,
                stream_id,
                ok,
                error,
            } => {
                let Some(Inflight::Open(op)) = self.inflight.remove(&id) else {
                    return;
                };
                let result = match (ok, stream_id) {
                    (true, Some(stream_id)) => Ok(stream_id),
                    _ => Err(error.unwrap_or_else(|| "open failed".to_string())),
                };
                self.completions.push(NetCompletion::TcpOpened { op, result });
            }
            RelayEvent::TcpWrite { id, ok, error } => {
                let Some(Inflight::Write(op)) = self.inflight.remove(&id) else {
                    return;
                };
                let result = if ok {
                    Ok(())
                } else {
                    Err(error.unwrap_or_else(|| "write failed".to_string()))
                };
                self.completions.push(NetCompletion::TcpWritten { op, result });
            }
            RelayEvent::TcpData {
                stream_id,
                data,
                data_encoding,
            } => match decode_payload(&data, data_encoding.as_deref()) {
                Ok(data) => self
                    .completions
                    .push(NetCompletion::TcpData { stream_id, data }),
                Err(e) => console_log!("[relay] Stream {}: {}", stream_id, e),
            },
            RelayEvent::TcpClose { stream_id, error } => {
                // Close acks carry no request id, only the stream
                self.inflight
                    .retain(|_, kind| !matches!(kind, Inflight::Close { stream_id: s } if *s == stream_id));
                self.completions
                    .push(NetCompletion::TcpClosed { stream_id, error });
            }
        }
    }
}

fn decode_payload(data: &str, encoding: Option<&str>) -> Result<Vec<u8>, String> {
    match encoding {
        Some(BASE64) => decode_base64(data),
        _ => Ok(data.as_bytes().to_vec()),
    }
}

impl<T: RelayTransport> HostNetwork for RelayNetwork<T> {
    fn submit(&mut self, op: HostOp) {
        let id = self.allocate();
        match op {
            HostOp::Fetch { op, request } => {
                let body = request.body.as_deref().map(encode_base64);
                let body_encoding = body.as_ref().map(|_| BASE64);
                let message = RelayRequest::Fetch {
                    id,
                    url: &request.url,
                    method: &request.method,
                    headers: &request.headers,
                    body,
                    body_encoding,
                };
                self.send(id, &message, Inflight::Fetch(op));
            }
            HostOp::TcpOpen {
                op,
                host,
                port,
                tls,
                server_name,
                insecure,
            } => {
                let message = RelayRequest::TcpOpen {
                    id,
                    host: &host,
                    port,
                    tls,
                    server_name: server_name.as_deref(),
                    insecure,
                };
                self.send(id, &message, Inflight::Open(op));
            }
            HostOp::TcpWrite {
                op,
                stream_id,
                data,
            } => {
                let message = RelayRequest::TcpWrite {
                    id,
                    stream_id,
                    data: encode_base64(&data),
                    data_encoding: BASE64,
                };
                self.send(id, &message, Inflight::Write(op));
            }
            HostOp::TcpClose { stream_id } => {
                let message = RelayRequest::TcpClose { id, stream_id };
                self.send(id, &message, Inflight::Close { stream_id });
            }
        }
    }

    fn drain(&mut self) -> Vec<NetCompletion> {
        for text in self.transport.recv() {
            self.handle_event(&text);
        }
        std::mem::take(&mut self.completions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Loopback transport; the test plays the relay server
    #[derive(Clone, Default)]
    struct MockRelay {
        sent: Rc<RefCell<Vec<String>>>,
        inbound: Rc<RefCell<VecDeque<String>>>,
        broken: bool,
    }

    impl MockRelay {
        fn sent_json(&self) -> Vec<Value> {
            self.sent
                .borrow()
                .iter()
                .map(|s| serde_json::from_str(s).unwrap())
                .collect()
        }

        fn reply(&self, value: Value) {
            self.inbound.borrow_mut().push_back(value.to_string());
        }
    }

    impl RelayTransport for MockRelay {
        fn send(&mut self, text: &str) -> Result<(), String> {
            if self.broken {
                return Err("socket closed".to_string());
            }
            self.sent.borrow_mut().push(text.to_string());
            Ok(())
        }

        fn recv(&mut self) -> Vec<String> {
            self.inbound.borrow_mut().drain(..).collect()
        }
    }

    #[test]
    fn test_denied_network_fails_everything() {
        let mut net = DeniedNetwork::new();
        net.submit(HostOp::Fetch {
            op: 1,
            request: FetchRequest::get("https://example.com/"),
        });
        net.submit(HostOp::TcpOpen {
            op: 2,
            host: "example.com".to_string(),
            port: 443,
            tls: true,
            server_name: None,
            insecure: false,
        });

        let done = net.drain();
        assert_eq!(done.len(), 2);
        assert_eq!(
            done[0],
            NetCompletion::Fetch {
                op: 1,
                result: Err(EGRESS_DISABLED.to_string())
            }
        );
        assert!(net.drain().is_empty());
    }

    #[test]
    fn test_relay_fetch_round_trip() {
        let relay = MockRelay::default();
        let mut net = RelayNetwork::new(relay.clone());

        net.submit(HostOp::Fetch {
            op: 10,
            request: FetchRequest::get("https://example.com/data")
                .method("post")
                .body(b"ping".to_vec()),
        });

        let sent = relay.sent_json();
        assert_eq!(sent[0]["type"], "fetch");
        assert_eq!(sent[0]["method"], "POST");
        assert_eq!(sent[0]["body"], "cGluZw==");
        assert_eq!(sent[0]["bodyEncoding"], "base64");
        let relay_id = sent[0]["id"].as_u64().unwrap();

        relay.reply(json!({
            "type": "fetch", "id": relay_id, "status": 201,
            "headers": {"content-type": "text/plain"},
            "body": "cG9uZw==", "bodyEncoding": "base64", "error": null
        }));

        let done = net.drain();
        match &done[..] {
            [NetCompletion::Fetch { op: 10, result: Ok(resp) }] => {
                assert_eq!(resp.status, 201);
                assert_eq!(resp.body, b"pong");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_relay_tcp_lifecycle() {
        let relay = MockRelay::default();
        let mut net = RelayNetwork::new(relay.clone());

        net.submit(HostOp::TcpOpen {
            op: 1,
            host: "db.internal".to_string(),
            port: 5432,
            tls: true,
            server_name: Some("db".to_string()),
            insecure: false,
        });
        let sent = relay.sent_json();
        let open = &sent[0];
        assert_eq!(open["type"], "tcp_open");
        assert_eq!(open["serverName"], "db");
        relay.reply(json!({"type": "tcp_open", "id": open["id"], "streamId": 1, "ok": true}));

        assert_eq!(
            net.drain(),
            vec![NetCompletion::TcpOpened { op: 1, result: Ok(1) }]
        );

        net.submit(HostOp::TcpWrite {
            op: 2,
            stream_id: 1,
            data: vec![0, 1, 2],
        });
        let sent = relay.sent_json();
        let write = &sent[1];
        assert_eq!(write["dataEncoding"], "base64");
        assert_eq!(write["data"], "AAEC");
        relay.reply(json!({"type": "tcp_write", "id": write["id"], "ok": false, "error": "unknown stream"}));
        relay.reply(json!({"type": "tcp_data", "streamId": 1, "data": "aGk=", "dataEncoding": "base64"}));
        relay.reply(json!({"type": "tcp_close", "streamId": 1, "error": null}));

        assert_eq!(
            net.drain(),
            vec![
                NetCompletion::TcpWritten {
                    op: 2,
                    result: Err("unknown stream".to_string())
                },
                NetCompletion::TcpData {
                    stream_id: 1,
                    data: b"hi".to_vec()
                },
                NetCompletion::TcpClosed {
                    stream_id: 1,
                    error: None
                },
            ]
        );
    }

    #[test]
    fn test_close_ack_settles_only_its_stream() {
        let relay = MockRelay::default();
        let mut net = RelayNetwork::new(relay.clone());
        net.submit(HostOp::TcpClose { stream_id: 1 });
        net.submit(HostOp::TcpClose { stream_id: 2 });
        assert_eq!(net.inflight.len(), 2);

        relay.reply(json!({"type": "tcp_close", "streamId": 1}));
        assert_eq!(
            net.drain(),
            vec![NetCompletion::TcpClosed {
                stream_id: 1,
                error: None
            }]
        );
        let open: Vec<u64> = net
            .inflight
            .values()
            .filter_map(|kind| match kind {
                Inflight::Close { stream_id } => Some(*stream_id),
                _ => None,
            })
            .collect();
        assert_eq!(open, vec![2]);
    }

    #[test]
    fn test_relay_failed_open() {
        let relay = MockRelay::default();
        let mut net = RelayNetwork::new(relay.clone());
        net.submit(HostOp::TcpOpen {
            op: 4,
            host: "nowhere".to_string(),
            port: 1,
            tls: false,
            server_name: None,
            insecure: false,
        });
        let id = relay.sent_json()[0]["id"].clone();
        relay.reply(json!({"type": "tcp_open", "id": id, "streamId": null, "ok": false, "error": "connect failed"}));

        assert_eq!(
            net.drain(),
            vec![NetCompletion::TcpOpened {
                op: 4,
                result: Err("connect failed".to_string())
            }]
        );
    }

    #[test]
    fn test_broken_transport_fails_immediately() {
        let relay = MockRelay {
            broken: true,
            ..Default::default()
        };
        let mut net = RelayNetwork::new(relay);
        net.submit(HostOp::Fetch {
            op: 3,
            request: FetchRequest::get("https://example.com/"),
        });

        match &net.drain()[..] {
            [NetCompletion::Fetch { op: 3, result: Err(e) }] => {
                assert!(e.starts_with("relay unavailable"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unmatched_and_garbage_events_are_dropped() {
        let relay = MockRelay::default();
        let mut net = RelayNetwork::new(relay.clone());
        relay.reply(json!({"type": "fetch", "id": 99, "status": 200}));
        relay
            .inbound
            .borrow_mut()
            .push_back("not json".to_string());
        assert!(net.drain().is_empty());
    }
}
