//! HTTP server emulation
//!
//! `listen(port)` only registers a local dispatcher and tells the
//! supervisor. Requests arrive as `net-request` messages; the response
//! buffers writes and goes back as one `http-response` on `end`.

use super::fetch::Fetcher;
use crate::kernel::protocol::{CallId, FetchRequest, FetchResponse, FromContext, Headers, LogLevel};
use crate::loader::{ScriptError, Value};
use crate::sandbox::buffer::{Buffer, Encoding};
use crate::sandbox::events::{EventEmitter, ListenerId};
use crate::sandbox::syscall::SyscallClient;
use futures::future::LocalBoxFuture;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// A request handler. An `Err` is answered with 500 if the handler has not
/// ended the response itself.
pub type Handler = Rc<dyn Fn(IncomingRequest, ServerResponse) -> Result<(), ScriptError>>;

/// One inbound loopback request
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Buffer,
}

impl IncomingRequest {
    /// Header lookup, ignoring case
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        self.body.to_string(Encoding::Utf8)
    }
}

struct ResponseInner {
    request_id: CallId,
    client: SyscallClient,
    status: Cell<u16>,
    headers: RefCell<Headers>,
    chunks: RefCell<Vec<Buffer>>,
    finished: Cell<bool>,
}

/// The response half handed to a handler. Clones refer to the same
/// response.
#[derive(Clone)]
pub struct ServerResponse {
    inner: Rc<ResponseInner>,
}

impl ServerResponse {
    fn new(request_id: CallId, client: SyscallClient) -> Self {
        Self {
            inner: Rc::new(ResponseInner {
                request_id,
                client,
                status: Cell::new(200),
                headers: RefCell::new(Headers::new()),
                chunks: RefCell::new(Vec::new()),
                finished: Cell::new(false),
            }),
        }
    }

    pub fn status(&self) -> u16 {
        self.inner.status.get()
    }

    pub fn set_status(&self, status: u16) {
        self.inner.status.set(status);
    }

    /// Header names are stored lowercased
    pub fn set_header(&self, name: &str, value: &str) {
        self.inner
            .headers
            .borrow_mut()
            .insert(name.to_ascii_lowercase(), value.to_string());
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.inner
            .headers
            .borrow()
            .get(&name.to_ascii_lowercase())
            .cloned()
    }

    pub fn write_head(&self, status: u16, headers: &[(&str, &str)]) {
        self.set_status(status);
        for (name, value) in headers {
            self.set_header(name, value);
        }
    }

    /// Buffer a chunk. False once the response has ended.
    pub fn write(&self, data: impl Into<Buffer>) -> bool {
        if self.inner.finished.get() {
            return false;
        }
        self.inner.chunks.borrow_mut().push(data.into());
        true
    }

    /// Finish and send. Later calls do nothing.
    pub fn end(&self, data: Option<Buffer>) {
        if self.inner.finished.replace(true) {
            return;
        }

        let mut chunks = std::mem::take(&mut *self.inner.chunks.borrow_mut());
        if let Some(data) = data {
            chunks.push(data);
        }
        // A single chunk moves as-is
        let body = if chunks.len() == 1 {
            chunks.pop().unwrap_or_default()
        } else {
            Buffer::concat(&chunks)
        };

        self.inner.client.send(FromContext::HttpResponse {
            request_id: self.inner.request_id,
            status: self.status(),
            headers: self.inner.headers.borrow().clone(),
            body: body.into_vec(),
        });
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.get()
    }
}

/// Port → handler table of the servers listening in this context
#[derive(Clone, Default)]
pub struct Dispatchers {
    table: Rc<RefCell<HashMap<u16, Handler>>>,
}

impl Dispatchers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.table.borrow().contains_key(&port)
    }

    fn register(&self, port: u16, handler: Handler) {
        self.table.borrow_mut().insert(port, handler);
    }

    fn unregister(&self, port: u16) {
        self.table.borrow_mut().remove(&port);
    }

    /// Hand a `net-request` to the server on `port`
    ///
    /// Every request is answered: 502 when nothing listens here, 500 when
    /// the handler fails before ending its response.
    pub fn dispatch(&self, client: &SyscallClient, request_id: CallId, port: u16, request: IncomingRequest) {
        let response = ServerResponse::new(request_id, client.clone());
        let handler = self.table.borrow().get(&port).cloned();

        let Some(handler) = handler else {
            response.set_status(502);
            response.end(Some(Buffer::from(format!("No server listening on port {}", port))));
            return;
        };

        if let Err(e) = handler(request, response.clone()) {
            client.send(FromContext::Log {
                text: format!("Unhandled error in request handler on port {}: {}", port, e),
                level: LogLevel::Error,
            });
            if !response.is_finished() {
                response.set_status(500);
                response.end(Some(Buffer::from("Internal Server Error")));
            }
        }
    }
}

/// A server created by `create_server`
#[derive(Clone)]
pub struct HttpServer {
    dispatchers: Dispatchers,
    client: SyscallClient,
    handler: Handler,
    port: Rc<Cell<Option<u16>>>,
    events: EventEmitter,
}

impl HttpServer {
    /// Start receiving requests for `port`
    ///
    /// A port already owned by another process is reported by the
    /// supervisor to the user only; this server still believes it listens.
    pub fn listen(&self, port: u16) {
        if let Some(previous) = self.port.replace(Some(port)) {
            self.dispatchers.unregister(previous);
        }
        self.dispatchers.register(port, self.handler.clone());
        self.client.send(FromContext::NetListen { port });
        self.events.emit("listening", &[Value::Number(port as f64)]);
    }

    /// Stop dispatching. The port binding itself lasts until the process
    /// is killed.
    pub fn close(&self) {
        if let Some(port) = self.port.take() {
            self.dispatchers.unregister(port);
            self.events.emit("close", &[]);
        }
    }

    pub fn address(&self) -> Option<u16> {
        self.port.get()
    }

    pub fn on<F: Fn(&[Value]) + 'static>(&self, event: &str, listener: F) -> ListenerId {
        self.events.on(event, listener)
    }
}

/// The `http` and `https` built-ins
#[derive(Clone)]
pub struct HttpModule {
    dispatchers: Dispatchers,
    client: SyscallClient,
    fetcher: Fetcher,
    secure: bool,
}

impl HttpModule {
    pub fn new(dispatchers: Dispatchers, client: SyscallClient, fetcher: Fetcher, secure: bool) -> Self {
        Self {
            dispatchers,
            client,
            fetcher,
            secure,
        }
    }

    pub fn create_server<F>(&self, handler: F) -> HttpServer
    where
        F: Fn(IncomingRequest, ServerResponse) -> Result<(), ScriptError> + 'static,
    {
        HttpServer {
            dispatchers: self.dispatchers.clone(),
            client: self.client.clone(),
            handler: Rc::new(handler),
            port: Rc::new(Cell::new(None)),
            events: EventEmitter::new(),
        }
    }

    /// Outbound request, mediated by the supervisor
    pub fn request(&self, request: FetchRequest) -> LocalBoxFuture<'static, Result<FetchResponse, String>> {
        self.fetcher.fetch(request)
    }

    /// GET; a URL without a scheme gets this module's one
    pub fn get(&self, url: &str) -> LocalBoxFuture<'static, Result<FetchResponse, String>> {
        let url = if url.contains("://") {
            url.to_string()
        } else if self.secure {
            format!("https://{}", url)
        } else {
            format!("http://{}", url)
        };
        self.request(FetchRequest::get(&url))
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }
}
