//! The supervisor: process table, lifecycle and syscall dispatch
//!
//! One explicit state object. Every mutation of the process table, the
//! port table or the stream table goes through a method here, so the
//! invariants live in one place:
//! - pids are allocated from a monotonic counter and never reused
//! - a port has at most one owner; only `kill` releases a live owner's
//!   ports
//! - nothing is ever posted to a process that is no longer registered
//!
//! The supervisor never blocks. Hosts call `pump` (or `run_until_idle`)
//! from their event loop and `tick` with the current time.

use super::context::{ContextFactory, ContextOptions};
use super::error::{KernelError, KernelResult};
use super::executor::Executor;
use super::netbridge::{DeniedNetwork, HostNetwork, HostOp, NetCompletion, OpId};
use super::process::{Pid, PortTable, Process, ProcessInfo, ProcessStatus, WindowId};
use super::protocol::{
    self, CallId, DataEncoding, FetchRequest, FromContext, LogLevel, StdStream, ToContext,
};
use super::router::{LoopbackCall, LoopbackRouter, parse_target};
use super::sink::{Style, UiSink};
use crate::config::KernelConfig;
use crate::console_log;
use crate::vfs::{self, FileSystem};
use serde_json::{Value as Json, json};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

/// Who is waiting on a host operation
struct HostCall {
    pid: Pid,
    id: CallId,
}

/// Replies produced by supervisor tasks, flushed after each round
type ReplyQueue = Rc<RefCell<VecDeque<(Pid, ToContext)>>>;

/// Upper bound on rounds in `run_until_idle`
const MAX_IDLE_ROUNDS: usize = 256;

/// Exit statuses remembered after processes leave the table
const MAX_FINISHED: usize = 256;

pub struct Supervisor {
    config: KernelConfig,
    factory: Box<dyn ContextFactory>,
    fs: Box<dyn FileSystem>,
    sink: Rc<dyn UiSink>,
    network: Box<dyn HostNetwork>,

    processes: BTreeMap<Pid, Process>,
    /// Final status of processes that left the table
    finished: BTreeMap<Pid, ProcessStatus>,
    ports: PortTable,
    next_pid: u32,

    router: LoopbackRouter,
    host_calls: HashMap<OpId, HostCall>,
    next_op: OpId,
    /// Host stream id → owning process
    streams: HashMap<u64, Pid>,

    tasks: Executor,
    replies: ReplyQueue,
    now: f64,
}

impl Supervisor {
    pub fn new(
        config: KernelConfig,
        factory: Box<dyn ContextFactory>,
        fs: Box<dyn FileSystem>,
        sink: Rc<dyn UiSink>,
    ) -> Self {
        Self {
            config,
            factory,
            fs,
            sink,
            network: Box::new(DeniedNetwork::new()),
            processes: BTreeMap::new(),
            finished: BTreeMap::new(),
            ports: PortTable::new(),
            next_pid: 1,
            router: LoopbackRouter::new(),
            host_calls: HashMap::new(),
            next_op: 1,
            streams: HashMap::new(),
            tasks: Executor::new(),
            replies: Rc::new(RefCell::new(VecDeque::new())),
            now: 0.0,
        }
    }

    /// Replace the default (deny-all) host network
    pub fn with_network(mut self, network: Box<dyn HostNetwork>) -> Self {
        self.network = network;
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// The filesystem processes are served from
    pub fn fs(&self) -> &dyn FileSystem {
        self.fs.as_ref()
    }

    pub fn fs_mut(&mut self) -> &mut dyn FileSystem {
        self.fs.as_mut()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start a process running `source` as the module at `path`
    ///
    /// The flattened filesystem is queued first, directories before their
    /// contents, then `execute`. Returns as soon as everything is queued.
    pub fn spawn(&mut self, source: &str, path: &str) -> KernelResult<Pid> {
        let limit = self.config.max_processes;
        if self.processes.len() >= limit {
            return Err(KernelError::ProcessLimit { limit });
        }

        let pid = Pid(self.next_pid);
        self.next_pid += 1;

        let options = ContextOptions {
            name: path.to_string(),
            config: self.config.clone(),
        };
        let mut context = self.factory.create(pid, &options)?;

        for entry in self.fs.flatten_tree() {
            context.post(ToContext::WriteVirtualEntry {
                path: entry.path,
                kind: entry.kind,
                content: entry.content,
            });
        }
        context.post(ToContext::Execute {
            code: source.to_string(),
            path: path.to_string(),
        });

        self.processes
            .insert(pid, Process::new(pid, path, self.now, context));
        console_log!("[kernel] Spawned {} ({})", pid, path);
        Ok(pid)
    }

    /// Terminate a process and release everything it held
    ///
    /// Its in-flight calls are abandoned, not failed. Unknown ids are a
    /// no-op.
    pub fn kill(&mut self, pid: Pid) {
        let Some(mut process) = self.processes.remove(&pid) else {
            return;
        };

        process.context.terminate();
        if let Some(window) = process.window {
            self.sink.detach_window(window);
        }
        let released = self.ports.release_all(pid);
        self.close_streams(pid);

        self.retire(pid, process.status);
        console_log!("[kernel] Killed {} (released ports {:?})", pid, released);
    }

    /// Pids only grow, so the oldest entries go first
    fn retire(&mut self, pid: Pid, status: ProcessStatus) {
        self.finished.insert(pid, status);
        while self.finished.len() > MAX_FINISHED {
            self.finished.pop_first();
        }
    }

    /// Natural exit: the process leaves the table but its ports stay bound
    /// until someone notices the owner is gone
    fn exit(&mut self, pid: Pid, status: ProcessStatus) {
        let Some(mut process) = self.processes.remove(&pid) else {
            return;
        };

        process.context.terminate();
        if let Some(window) = process.window {
            self.sink.detach_window(window);
        }
        self.close_streams(pid);
        self.retire(pid, status);

        if status == ProcessStatus::Error {
            self.sink.print(
                &format!("process {} ({}) died unexpectedly", pid, process.name),
                Style::Error,
            );
        }
    }

    fn close_streams(&mut self, pid: Pid) {
        let owned: Vec<u64> = self
            .streams
            .iter()
            .filter(|(_, owner)| **owner == pid)
            .map(|(stream, _)| *stream)
            .collect();
        for stream_id in owned {
            self.streams.remove(&stream_id);
            self.network.submit(HostOp::TcpClose { stream_id });
        }
    }

    /// Bind a UI window to a process, for display only
    pub fn attach_window(&mut self, pid: Pid, window: WindowId) -> KernelResult<()> {
        let process = self
            .processes
            .get_mut(&pid)
            .ok_or(KernelError::NoSuchProcess(pid))?;
        process.window = Some(window);
        Ok(())
    }

    /// Feed keyboard input to a process's stdin
    pub fn send_input(&mut self, pid: Pid, data: &str) -> KernelResult<()> {
        if !self.processes.contains_key(&pid) {
            return Err(KernelError::NoSuchProcess(pid));
        }
        self.post(
            pid,
            ToContext::TtyInput {
                data: data.to_string(),
            },
        );
        Ok(())
    }

    pub fn is_running(&self, pid: Pid) -> bool {
        self.processes.contains_key(&pid)
    }

    /// Current status, including the most recent processes that left the table
    pub fn status(&self, pid: Pid) -> Option<ProcessStatus> {
        self.processes
            .get(&pid)
            .map(|p| p.status)
            .or_else(|| self.finished.get(&pid).copied())
    }

    pub fn port_owner(&self, port: u16) -> Option<Pid> {
        self.ports.owner(port)
    }

    /// Snapshot of the process table
    pub fn list(&self) -> Vec<ProcessInfo> {
        self.processes
            .values()
            .map(|p| ProcessInfo {
                pid: p.pid,
                name: p.name.clone(),
                status: p.status,
                started_at: p.started_at,
                ports: self.ports.ports_of(p.pid),
                window: p.window,
            })
            .collect()
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// One dispatch round. Returns how much happened; zero means idle.
    pub fn pump(&mut self) -> usize {
        let mut activity = 0;
        let mut inbound = Vec::new();
        let mut dead = Vec::new();

        for (pid, process) in self.processes.iter_mut() {
            let messages = process.context.poll();
            if process.status == ProcessStatus::Starting {
                process.status = ProcessStatus::Running;
            }
            if !process.context.is_alive() {
                dead.push(*pid);
            }
            inbound.extend(messages.into_iter().map(|m| (*pid, m)));
        }

        activity += inbound.len();
        for (pid, message) in inbound {
            self.dispatch(pid, message);
        }

        for pid in dead {
            self.exit(pid, ProcessStatus::Error);
        }

        let completions = self.network.drain();
        activity += completions.len();
        for completion in completions {
            self.complete(completion);
        }

        activity += self.tasks.run_until_stalled();
        activity += self.flush_replies();
        activity
    }

    /// Pump until nothing moves
    pub fn run_until_idle(&mut self) -> usize {
        let mut total = 0;
        for _ in 0..MAX_IDLE_ROUNDS {
            let activity = self.pump();
            if activity == 0 {
                break;
            }
            total += activity;
        }
        total
    }

    /// Advance the clock. Applies the call timeout when one is configured.
    pub fn tick(&mut self, now: f64) {
        self.now = now;
        for process in self.processes.values_mut() {
            process.context.tick(now);
        }
        if let Some(timeout) = self.config.call_timeout_ms {
            let expired = self.router.expire(now, timeout);
            if !expired.is_empty() {
                console_log!("[kernel] {} loopback call(s) timed out", expired.len());
            }
        }
        self.tasks.run_until_stalled();
        self.flush_replies();
    }

    /// Decode and dispatch a raw wire message from `pid`
    ///
    /// A message that does not decode is dropped; if it carried an id the
    /// sender gets an error envelope for it.
    pub fn dispatch_raw(&mut self, pid: Pid, text: &str) {
        match protocol::decode_from_context(text) {
            Ok(message) => self.dispatch(pid, message),
            Err(e) => {
                console_log!("[kernel] Dropping message from {}: {}", pid, e);
                if let Some(envelope) = protocol::rejection(text, &e) {
                    self.post(pid, envelope);
                }
            }
        }
    }

    /// Handle one message from `pid`
    pub fn dispatch(&mut self, pid: Pid, message: FromContext) {
        if !self.processes.contains_key(&pid) {
            return;
        }

        match message {
            FromContext::Log { text, level } => self.sink.print(&text, log_style(level)),
            FromContext::TtyWrite { data, stream } => {
                let style = match stream {
                    StdStream::Stdout => Style::Stdout,
                    StdStream::Stderr => Style::Stderr,
                };
                self.sink.print(&data, style);
            }
            FromContext::NetListen { port } => self.listen(pid, port),
            FromContext::FsRead { id, path, as_text } => {
                let result = self.fs_read(&path, as_text);
                self.reply(pid, id, result);
            }
            FromContext::FsWrite { id, path, content } => {
                let result = self
                    .fs
                    .write_file(&path, &content)
                    .map(|_| Json::Null)
                    .map_err(|e| e.to_string());
                self.reply(pid, id, result);
            }
            FromContext::FsList { id, path } => {
                let result = self
                    .fs
                    .list_files(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|entries| to_json(&entries));
                self.reply(pid, id, result);
            }
            FromContext::FsMkdir { id, path } => {
                let result = vfs::create_dir_all(self.fs.as_mut(), &path)
                    .map(|_| Json::Null)
                    .map_err(|e| e.to_string());
                self.reply(pid, id, result);
            }
            FromContext::FsRemove { id, path } => {
                let result = self
                    .fs
                    .remove(&path)
                    .map(|_| Json::Null)
                    .map_err(|e| e.to_string());
                self.reply(pid, id, result);
            }
            FromContext::FsStat { id, path } => {
                let result = self
                    .fs
                    .stat(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|meta| to_json(&meta));
                self.reply(pid, id, result);
            }
            FromContext::HttpResponse {
                request_id,
                status,
                headers,
                body,
            } => {
                let response = protocol::FetchResponse {
                    status,
                    headers,
                    body,
                };
                if !self.router.settle(request_id, response) {
                    console_log!("[kernel] Response for unknown request {}", request_id);
                }
            }
            FromContext::NetFetch { id, request } => self.net_fetch(pid, id, request),
            FromContext::NetTcpOpen {
                id,
                host,
                port,
                tls,
                server_name,
                insecure,
            } => {
                let op = self.track(pid, id);
                self.network.submit(HostOp::TcpOpen {
                    op,
                    host,
                    port,
                    tls,
                    server_name,
                    insecure,
                });
            }
            FromContext::NetTcpWrite {
                id,
                stream_id,
                data,
            } => {
                if self.streams.get(&stream_id) != Some(&pid) {
                    self.reply(pid, id, Err("unknown stream".to_string()));
                    return;
                }
                match protocol::decode_base64(&data) {
                    Ok(data) => {
                        let op = self.track(pid, id);
                        self.network.submit(HostOp::TcpWrite {
                            op,
                            stream_id,
                            data,
                        });
                    }
                    Err(e) => self.reply(pid, id, Err(e)),
                }
            }
            FromContext::NetTcpClose { id, stream_id } => {
                if self.streams.get(&stream_id) != Some(&pid) {
                    self.reply(pid, id, Err("unknown stream".to_string()));
                    return;
                }
                self.streams.remove(&stream_id);
                self.network.submit(HostOp::TcpClose { stream_id });
                self.reply(pid, id, Ok(Json::Null));
            }
            FromContext::ProcExit { code } => {
                console_log!("[kernel] {} exited with {}", pid, code);
                self.exit(pid, ProcessStatus::Exited(code));
            }
        }
    }

    /// A process asks for a port
    ///
    /// A conflict is only reported to the sink; the requester is never
    /// told, and the current owner keeps the port.
    fn listen(&mut self, pid: Pid, port: u16) {
        match self.ports.owner(port) {
            Some(owner) if owner == pid => {}
            Some(owner) if !self.processes.contains_key(&owner) => {
                self.ports.evict(port);
                let _ = self.ports.bind(port, pid);
            }
            Some(owner) => {
                self.sink.print(
                    &format!(
                        "port {} is already in use by process {}; listen from {} ignored",
                        port, owner, pid
                    ),
                    Style::Warn,
                );
            }
            None => {
                let _ = self.ports.bind(port, pid);
                console_log!("[kernel] {} listening on {}", pid, port);
            }
        }
    }

    fn fs_read(&self, path: &str, as_text: bool) -> Result<Json, String> {
        let bytes = self.fs.read_file(path).map_err(|e| e.to_string())?;
        if as_text {
            String::from_utf8(bytes)
                .map(Json::String)
                .map_err(|e| format!("{}: {}", path, e))
        } else {
            Ok(Json::String(protocol::encode_base64(&bytes)))
        }
    }

    // ========================================================================
    // Network
    // ========================================================================

    /// Loopback HTTP call to whatever process serves `request.url`
    ///
    /// Fails right away for a bad URL, an unbound port or a dead owner;
    /// otherwise settles when the serving process answers. Without a
    /// configured call timeout an unanswered call never settles.
    pub fn fetch(&mut self, request: FetchRequest) -> LoopbackCall {
        let processes = &self.processes;
        let resolved =
            self.router
                .resolve(&request.url, &mut self.ports, |pid| processes.contains_key(&pid));

        let (owner, target) = match resolved {
            Ok(found) => found,
            Err(e) => return LoopbackCall::failed(e),
        };

        let (request_id, call) = self.router.open(self.now, target.port);
        self.post(
            owner,
            ToContext::NetRequest {
                port: target.port,
                method: request.method,
                url: target.path,
                request_id,
                headers: request.headers,
                body: request.body,
            },
        );
        call
    }

    /// Number of loopback calls awaiting a response
    pub fn loopback_in_flight(&self) -> usize {
        self.router.in_flight()
    }

    fn net_fetch(&mut self, pid: Pid, id: CallId, request: FetchRequest) {
        // Local addresses never leave the machine, bound or not
        let loopback = parse_target(&request.url)
            .map(|target| target.is_local())
            .unwrap_or(false);

        if loopback {
            let call = self.fetch(request);
            let replies = self.replies.clone();
            self.tasks.spawn(async move {
                let result = match call.await {
                    Ok(response) => to_json(&response),
                    Err(e) => Err(e.to_string()),
                };
                replies
                    .borrow_mut()
                    .push_back((pid, ToContext::response(id, result)));
            });
        } else {
            let op = self.track(pid, id);
            self.network.submit(HostOp::Fetch { op, request });
        }
    }

    fn track(&mut self, pid: Pid, id: CallId) -> OpId {
        let op = self.next_op;
        self.next_op += 1;
        self.host_calls.insert(op, HostCall { pid, id });
        op
    }

    fn complete(&mut self, completion: NetCompletion) {
        match completion {
            NetCompletion::Fetch { op, result } => {
                if let Some(call) = self.host_calls.remove(&op) {
                    let result = result.and_then(|response| to_json(&response));
                    self.reply(call.pid, call.id, result);
                }
            }
            NetCompletion::TcpOpened { op, result } => {
                let Some(call) = self.host_calls.remove(&op) else {
                    return;
                };
                match result {
                    Ok(stream_id) if self.processes.contains_key(&call.pid) => {
                        self.streams.insert(stream_id, call.pid);
                        self.reply(call.pid, call.id, Ok(json!({ "streamId": stream_id })));
                    }
                    Ok(stream_id) => {
                        // Opener is gone
                        self.network.submit(HostOp::TcpClose { stream_id });
                    }
                    Err(e) => self.reply(call.pid, call.id, Err(e)),
                }
            }
            NetCompletion::TcpWritten { op, result } => {
                if let Some(call) = self.host_calls.remove(&op) {
                    self.reply(call.pid, call.id, result.map(|_| Json::Null));
                }
            }
            NetCompletion::TcpData { stream_id, data } => {
                if let Some(&pid) = self.streams.get(&stream_id) {
                    self.post(
                        pid,
                        ToContext::NetTcpData {
                            stream_id,
                            data: protocol::encode_base64(&data),
                            encoding: DataEncoding::Base64,
                        },
                    );
                }
            }
            NetCompletion::TcpClosed { stream_id, error } => {
                if let Some(pid) = self.streams.remove(&stream_id) {
                    self.post(pid, ToContext::NetTcpClose { stream_id, error });
                }
            }
        }
    }

    // ========================================================================
    // Replies
    // ========================================================================

    fn reply(&mut self, pid: Pid, id: CallId, result: Result<Json, String>) {
        self.post(pid, ToContext::response(id, result));
    }

    /// Post to a process if it is still registered
    fn post(&mut self, pid: Pid, message: ToContext) {
        if let Some(process) = self.processes.get_mut(&pid) {
            process.context.post(message);
        }
    }

    fn flush_replies(&mut self) -> usize {
        let replies: Vec<_> = self.replies.borrow_mut().drain(..).collect();
        let count = replies.len();
        for (pid, message) in replies {
            self.post(pid, message);
        }
        count
    }
}

fn log_style(level: LogLevel) -> Style {
    match level {
        LogLevel::Warn => Style::Warn,
        LogLevel::Error => Style::Error,
        LogLevel::Log | LogLevel::Info | LogLevel::Debug => Style::Info,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Json, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}
