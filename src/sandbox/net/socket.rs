//! TCP/TLS socket emulation
//!
//! A socket exists as soon as `connect` returns but only gets its stream id
//! when the `net-tcp-open` round-trip completes. Writes before that are
//! queued and flushed in submission order. All payloads travel base64
//! encoded. Inbound `net-tcp-data`/`net-tcp-close` find their socket by
//! stream id; an id nobody owns is dropped.

use crate::kernel::executor::Spawner;
use crate::kernel::protocol::{self, FromContext};
use crate::loader::Value;
use crate::sandbox::buffer::Buffer;
use crate::sandbox::events::{EventEmitter, ListenerId};
use crate::sandbox::syscall::SyscallClient;
use serde_json::Value as Json;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

type SocketMap = RefCell<HashMap<u64, VirtualSocket>>;

/// Open sockets by stream id
#[derive(Clone, Default)]
pub struct SocketTable {
    sockets: Rc<SocketMap>,
}

impl SocketTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver inbound data. False for unknown streams.
    pub fn handle_data(&self, stream_id: u64, data: Vec<u8>) -> bool {
        let socket = self.sockets.borrow().get(&stream_id).cloned();
        match socket {
            Some(socket) => {
                socket.events().emit("data", &[Value::Bytes(Buffer::from(data))]);
                true
            }
            None => false,
        }
    }

    /// The remote end (or the host) closed the stream
    pub fn handle_close(&self, stream_id: u64, error: Option<String>) -> bool {
        let socket = self.sockets.borrow_mut().remove(&stream_id);
        match socket {
            Some(socket) => {
                socket.remote_closed(error);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sockets.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.borrow().is_empty()
    }
}

/// Where to connect
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    /// SNI name for TLS; defaults to the host on the far side
    pub server_name: Option<String>,
    /// Skip certificate verification
    pub insecure: bool,
}

impl ConnectOptions {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            server_name: None,
            insecure: false,
        }
    }
}

struct SocketInner {
    host: String,
    port: u16,
    tls: bool,
    stream_id: Cell<Option<u64>>,
    closed: Cell<bool>,
    /// Closed locally before the id arrived; the close goes out with it
    close_pending: Cell<bool>,
    queued: RefCell<Vec<Vec<u8>>>,
    events: EventEmitter,
    client: SyscallClient,
    spawner: Spawner,
    table: Weak<SocketMap>,
}

/// One emulated connection. Clones refer to the same socket.
#[derive(Clone)]
pub struct VirtualSocket {
    inner: Rc<SocketInner>,
}

impl VirtualSocket {
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn is_tls(&self) -> bool {
        self.inner.tls
    }

    pub fn stream_id(&self) -> Option<u64> {
        self.inner.stream_id.get()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    pub fn events(&self) -> &EventEmitter {
        &self.inner.events
    }

    pub fn on<F: Fn(&[Value]) + 'static>(&self, event: &str, listener: F) -> ListenerId {
        self.inner.events.on(event, listener)
    }

    /// Send bytes, or queue them until the stream id is known. False once
    /// closed.
    pub fn write(&self, data: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.stream_id() {
            Some(stream_id) => self.send_write(stream_id, data.to_vec()),
            None => self.inner.queued.borrow_mut().push(data.to_vec()),
        }
        true
    }

    /// Graceful close: queued writes still go out first
    pub fn end(&self) {
        self.close(false);
    }

    /// Immediate close: queued writes are dropped
    pub fn destroy(&self) {
        self.close(true);
    }

    fn close(&self, discard: bool) {
        if self.inner.closed.replace(true) {
            return;
        }
        if discard {
            self.inner.queued.borrow_mut().clear();
        }

        match self.stream_id() {
            Some(stream_id) => {
                self.unregister(stream_id);
                self.send_close(stream_id);
            }
            None => self.inner.close_pending.set(true),
        }
        self.inner.events.emit("close", &[Value::Bool(false)]);
    }

    fn opened(&self, stream_id: u64) {
        self.inner.stream_id.set(Some(stream_id));

        let queued = std::mem::take(&mut *self.inner.queued.borrow_mut());
        for data in queued {
            self.send_write(stream_id, data);
        }

        if self.inner.close_pending.get() {
            self.send_close(stream_id);
            return;
        }

        if let Some(table) = self.inner.table.upgrade() {
            table.borrow_mut().insert(stream_id, self.clone());
        }
        self.inner.events.emit("connect", &[]);
    }

    /// The open call failed
    fn failed(&self, message: String) {
        if self.inner.closed.replace(true) {
            return;
        }
        self.inner.queued.borrow_mut().clear();
        self.inner.events.emit("error", &[Value::String(message)]);
        self.inner.events.emit("close", &[Value::Bool(true)]);
    }

    fn remote_closed(&self, error: Option<String>) {
        if self.inner.closed.replace(true) {
            return;
        }
        let had_error = error.is_some();
        if let Some(message) = error {
            self.inner.events.emit("error", &[Value::String(message)]);
        }
        self.inner.events.emit("close", &[Value::Bool(had_error)]);
    }

    fn unregister(&self, stream_id: u64) {
        if let Some(table) = self.inner.table.upgrade() {
            table.borrow_mut().remove(&stream_id);
        }
    }

    fn send_write(&self, stream_id: u64, data: Vec<u8>) {
        let reply = self.inner.client.call(|id| FromContext::NetTcpWrite {
            id,
            stream_id,
            data: protocol::encode_base64(&data),
        });
        let events = self.inner.events.clone();
        self.inner.spawner.spawn(async move {
            if let Err(e) = reply.await {
                events.emit("error", &[Value::String(e.to_string())]);
            }
        });
    }

    /// Best effort; the answer is ignored
    fn send_close(&self, stream_id: u64) {
        let reply = self
            .inner
            .client
            .call(|id| FromContext::NetTcpClose { id, stream_id });
        self.inner.spawner.spawn(async move {
            let _ = reply.await;
        });
    }
}

/// The `net` and `tls` built-ins
#[derive(Clone)]
pub struct NetModule {
    client: SyscallClient,
    sockets: SocketTable,
    spawner: Spawner,
    tls: bool,
}

impl NetModule {
    pub fn new(client: SyscallClient, sockets: SocketTable, spawner: Spawner, tls: bool) -> Self {
        Self {
            client,
            sockets,
            spawner,
            tls,
        }
    }

    /// Start connecting. The socket emits `connect` once the supervisor
    /// has opened the stream, or `error` then `close` if it could not.
    pub fn connect(&self, options: ConnectOptions) -> VirtualSocket {
        let socket = VirtualSocket {
            inner: Rc::new(SocketInner {
                host: options.host.clone(),
                port: options.port,
                tls: self.tls,
                stream_id: Cell::new(None),
                closed: Cell::new(false),
                close_pending: Cell::new(false),
                queued: RefCell::new(Vec::new()),
                events: EventEmitter::new(),
                client: self.client.clone(),
                spawner: self.spawner.clone(),
                table: Rc::downgrade(&self.sockets.sockets),
            }),
        };

        let tls = self.tls;
        let reply = self.client.call(|id| FromContext::NetTcpOpen {
            id,
            host: options.host,
            port: options.port,
            tls,
            server_name: options.server_name,
            insecure: options.insecure,
        });

        let pending = socket.clone();
        self.spawner.spawn(async move {
            match reply.await {
                Ok(opened) => match opened.get("streamId").and_then(Json::as_u64) {
                    Some(stream_id) => pending.opened(stream_id),
                    None => pending.failed("malformed tcp-open reply".to_string()),
                },
                Err(e) => pending.failed(e.to_string()),
            }
        });

        socket
    }
}
