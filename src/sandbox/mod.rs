//! Process sandbox
//!
//! Everything that runs inside one execution context:
//! - `bootstrap`: process, console and tty globals
//! - `fs`: the `fs` built-in over a local mirror of the virtual filesystem
//! - `net`: HTTP servers, outbound fetch and TCP sockets
//! - the module loader, fed by the built-ins assembled here
//!
//! A `Sandbox` is driven by messages. `handle` consumes one `ToContext`,
//! `run_tasks` lets queued work make progress and `take_outbox` yields the
//! `FromContext` messages produced meanwhile, in send order.

pub mod bootstrap;
pub mod buffer;
pub mod events;
pub mod fs;
pub mod net;
pub mod syscall;

#[cfg(target_arch = "wasm32")]
pub mod worker;

use crate::config::KernelConfig;
use crate::console_log;
use crate::kernel::executor::{Executor, Spawner};
use crate::kernel::ipc::{self, Receiver};
use crate::kernel::protocol::{self, FromContext, LogLevel, ToContext};
use crate::loader::builtins::{EventsModule, PathModule, UrlModule};
use crate::loader::{Builtin, BuiltinModule, BuiltinProvider, LoaderOptions, LoaderParts, ModuleLoader};
use crate::loader::{ScriptEngine, Value};
use crate::vfs::{self, EntryKind, FileSystem, MemoryFs, path};
use bootstrap::{Globals, OsModule, ProcessSetup, TtyModule};
use buffer::Buffer;
use fs::{FsModule, Mirror};
use net::{Dispatchers, Fetcher, HttpModule, IncomingRequest, NetModule, SocketTable};
use std::cell::RefCell;
use std::rc::Rc;
use syscall::SyscallClient;

/// Rounds of `run_tasks` before yielding back to the host
const MAX_TASK_ROUNDS: usize = 64;

/// What a sandbox is started with
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub pid: u32,
    /// Path of the main module
    pub name: String,
    pub config: KernelConfig,
}

/// Instances behind the built-in names, one set per sandbox
struct Services {
    globals: Globals,
    fs: FsModule,
    http: HttpModule,
    https: HttpModule,
    net: NetModule,
    tls: NetModule,
    tty: TtyModule,
}

impl BuiltinProvider for Services {
    fn builtin(&self, module: BuiltinModule) -> Builtin {
        let process = &self.globals.process;
        match module {
            BuiltinModule::Fs => Builtin::Fs(self.fs.clone()),
            BuiltinModule::Path => Builtin::Path(PathModule::new(process.clone())),
            BuiltinModule::Http => Builtin::Http(self.http.clone()),
            BuiltinModule::Https => Builtin::Https(self.https.clone()),
            BuiltinModule::Net => Builtin::Net(self.net.clone()),
            BuiltinModule::Tls => Builtin::Tls(self.tls.clone()),
            BuiltinModule::Events => Builtin::Events(EventsModule),
            BuiltinModule::Buffer => Builtin::Buffer(self.globals.buffer.clone()),
            BuiltinModule::Process => Builtin::Process(process.clone()),
            BuiltinModule::Tty => Builtin::Tty(self.tty),
            BuiltinModule::Url => Builtin::Url(UrlModule),
            BuiltinModule::Os => Builtin::Os(OsModule::new(process.clone())),
        }
    }
}

pub struct Sandbox {
    pid: u32,
    config: KernelConfig,
    client: SyscallClient,
    outbox: Receiver<FromContext>,
    mirror: Mirror,
    globals: Globals,
    loader: ModuleLoader,
    executor: Executor,
    dispatchers: Dispatchers,
    sockets: SocketTable,
}

impl Sandbox {
    pub fn new(options: SandboxOptions, engine: Rc<dyn ScriptEngine>) -> Self {
        let SandboxOptions { pid, name, config } = options;

        let (tx, outbox) = ipc::channel();
        let client = SyscallClient::new(tx);
        let mirror: Mirror = Rc::new(RefCell::new(MemoryFs::new()));
        let globals = Globals::install(
            ProcessSetup {
                pid,
                script: name,
                env: config.env.clone(),
                columns: config.tty_columns,
                rows: config.tty_rows,
            },
            client.clone(),
        );
        let fetcher = unmediated(Fetcher::new(client.clone()), &config);
        let globals = globals.with_fetcher(fetcher.clone());
        let executor = Executor::new();
        let dispatchers = Dispatchers::new();
        let sockets = SocketTable::new();

        let http = |secure| HttpModule::new(dispatchers.clone(), client.clone(), fetcher.clone(), secure);
        let net = |tls| NetModule::new(client.clone(), sockets.clone(), executor.spawner(), tls);
        let services = Services {
            globals: globals.clone(),
            fs: FsModule::new(mirror.clone(), client.clone(), globals.process.clone(), executor.spawner()),
            http: http(false),
            https: http(true),
            net: net(false),
            tls: net(true),
            tty: TtyModule {
                columns: config.tty_columns,
                rows: config.tty_rows,
            },
        };

        let loader = ModuleLoader::new(LoaderParts {
            fs: mirror.clone(),
            engine,
            builtins: Rc::new(services),
            globals: globals.clone(),
            options: LoaderOptions::from(&config),
        });

        Self {
            pid,
            config,
            client,
            outbox,
            mirror,
            globals,
            loader,
            executor,
            dispatchers,
            sockets,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    /// Spawn handle for work that must outlive the current call
    pub fn spawner(&self) -> Spawner {
        self.executor.spawner()
    }

    /// Consume one message from the supervisor
    pub fn handle(&mut self, message: ToContext) {
        match message {
            ToContext::Execute { code, path } => self.execute(&code, &path),

            ToContext::WriteVirtualEntry {
                path,
                kind,
                content,
            } => {
                if let Err(e) = self.write_entry(&path, kind, content) {
                    console_log!("[sandbox {}] write-virtual-entry {}: {}", self.pid, path, e);
                }
            }

            ToContext::SyscallResponse { id, result, error } => {
                let settled = protocol::settlement(result, error).unwrap_or_else(|e| Err(e.to_string()));
                self.client.settle(id, settled);
            }

            ToContext::NetRequest {
                port,
                method,
                url,
                request_id,
                headers,
                body,
            } => {
                let request = IncomingRequest {
                    method,
                    url,
                    headers,
                    body: Buffer::from(body.unwrap_or_default()),
                };
                self.dispatchers
                    .dispatch(&self.client, request_id, port, request);
            }

            ToContext::NetTcpData {
                stream_id,
                data,
                encoding,
            } => match encoding.decode(&data) {
                Ok(bytes) => {
                    self.sockets.handle_data(stream_id, bytes);
                }
                Err(e) => console_log!("[sandbox {}] stream {}: {}", self.pid, stream_id, e),
            },

            ToContext::NetTcpClose { stream_id, error } => {
                self.sockets.handle_close(stream_id, error);
            }

            ToContext::TtyInput { data } => {
                self.globals.process.stdin().emit("data", &[Value::from(data)]);
            }
        }
    }

    /// Run next-tick callbacks, deferred top-level completions and ready
    /// tasks until nothing is left to do
    pub fn run_tasks(&mut self) -> usize {
        let mut total = 0;
        for _ in 0..MAX_TASK_ROUNDS {
            let mut progressed = self.globals.process.run_ticks();

            for deferred in self.loader.take_deferred() {
                let console = self.globals.console.clone();
                self.executor.spawn(async move {
                    if let Err(e) = deferred.completion.await {
                        console.text(LogLevel::Error, &format!("{}: {}", deferred.path, e));
                    }
                });
                progressed += 1;
            }

            progressed += self.executor.tick();
            if progressed == 0 {
                break;
            }
            total += progressed;
        }
        total
    }

    /// Messages produced since the last call
    pub fn take_outbox(&mut self) -> Vec<FromContext> {
        self.outbox.drain()
    }

    /// Advance the clock; rejects syscalls pending past the timeout
    pub fn tick(&mut self, now: f64) {
        self.client.set_now(now);
        if let Some(timeout) = self.config.call_timeout_ms {
            self.client.expire(timeout);
        }
    }

    /// Syscalls awaiting a response
    pub fn in_flight(&self) -> usize {
        self.client.in_flight()
    }

    /// Run the main module. A failure is reported on the console and the
    /// sandbox stays up; servers it registered keep answering.
    fn execute(&mut self, code: &str, main_path: &str) {
        if let Err(e) = self.loader.run_main(code, main_path) {
            self.globals.console.text(LogLevel::Error, &e.to_string());
        }
    }

    fn write_entry(&mut self, entry: &str, kind: EntryKind, content: Option<Vec<u8>>) -> std::io::Result<()> {
        let mut mirror = self.mirror.borrow_mut();
        match kind {
            EntryKind::Directory => vfs::create_dir_all(&mut *mirror, entry),
            EntryKind::File => {
                vfs::create_dir_all(&mut *mirror, &path::dirname(entry))?;
                mirror.write_file(entry, &content.unwrap_or_default())
            }
        }
    }
}

/// Install the direct-fetch fallback when the host allows it
fn unmediated(fetcher: Fetcher, config: &KernelConfig) -> Fetcher {
    if !config.allow_unmediated_fetch {
        return fetcher;
    }
    #[cfg(target_arch = "wasm32")]
    {
        fetcher.with_fallback(Rc::new(crate::kernel::web::browser_fetch))
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        // No direct network natively; the syscall path is the only one
        fetcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::protocol::DataEncoding;
    use crate::loader::{Completion, NativeEngine, ScriptError};
    use crate::sandbox::net::ConnectOptions;
    use serde_json::json;
    use std::cell::Cell;

    fn sandbox(engine: &NativeEngine, config: KernelConfig) -> Sandbox {
        Sandbox::new(
            SandboxOptions {
                pid: 3,
                name: "/app/main.js".to_string(),
                config,
            },
            Rc::new(engine.clone()),
        )
    }

    fn file(p: &str, text: &str) -> ToContext {
        ToContext::WriteVirtualEntry {
            path: p.to_string(),
            kind: EntryKind::File,
            content: Some(text.as_bytes().to_vec()),
        }
    }

    fn execute() -> ToContext {
        ToContext::Execute {
            code: String::new(),
            path: "/app/main.js".to_string(),
        }
    }

    fn logs(messages: &[FromContext]) -> Vec<(LogLevel, String)> {
        messages
            .iter()
            .filter_map(|m| match m {
                FromContext::Log { text, level } => Some((*level, text.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_mirror_then_require() {
        let engine = NativeEngine::new();
        engine.register_sync("/app/main.js", |scope| {
            let fs = scope.require("fs")?;
            let fs = fs.as_builtin().and_then(Builtin::as_fs).ok_or("fs missing".to_string())?;
            let text = fs.read_to_string_sync("config.txt")?;
            let lib = scope.require("./lib/util")?;
            scope.globals().console.log(&[Value::from(text), lib.get("name")]);
            Ok(())
        });
        engine.register_sync("/app/lib/util.js", |scope| {
            scope.export("name", "util");
            Ok(())
        });

        let mut sb = sandbox(&engine, KernelConfig::default());
        sb.handle(ToContext::WriteVirtualEntry {
            path: "/app".to_string(),
            kind: EntryKind::Directory,
            content: None,
        });
        sb.handle(file("/app/config.txt", "ready"));
        sb.handle(file("/app/lib/util.js", "exports.name = 'util';"));
        sb.handle(execute());
        sb.run_tasks();

        assert_eq!(logs(&sb.take_outbox()), vec![(LogLevel::Log, "ready util".to_string())]);
    }

    #[test]
    fn test_failed_main_is_logged() {
        let engine = NativeEngine::new();
        engine.register_sync("/app/main.js", |scope| scope.require("./nope").map(|_| ()));

        let mut sb = sandbox(&engine, KernelConfig::default());
        sb.handle(execute());
        let lines = logs(&sb.take_outbox());
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, LogLevel::Error);
        assert!(lines[0].1.contains("Cannot find module './nope'"));
    }

    #[test]
    fn test_module_fetch_becomes_net_fetch() {
        let engine = NativeEngine::new();
        engine.register_sync("/app/main.js", |scope| {
            let fetch = &scope.globals().fetch;
            assert!(fetch.is_mediated());
            drop(fetch.fetch(protocol::FetchRequest::get("https://example.com/data")));
            Ok(())
        });

        let mut sb = sandbox(&engine, KernelConfig::default());
        sb.handle(execute());
        let urls: Vec<String> = sb
            .take_outbox()
            .into_iter()
            .filter_map(|m| match m {
                FromContext::NetFetch { request, .. } => Some(request.url),
                _ => None,
            })
            .collect();
        assert_eq!(urls, vec!["https://example.com/data".to_string()]);
    }

    #[test]
    fn test_net_request_reaches_server() {
        let engine = NativeEngine::new();
        engine.register_sync("/app/main.js", |scope| {
            let http = scope.require("http")?;
            let http = http.as_builtin().and_then(Builtin::as_http).ok_or("http missing".to_string())?;
            let server = http.create_server(|req, res| {
                res.set_header("Content-Type", "text/plain");
                res.end(Some(Buffer::from(format!("{} {}", req.method, req.url))));
                Ok(())
            });
            server.listen(3000);
            Ok(())
        });

        let mut sb = sandbox(&engine, KernelConfig::default());
        sb.handle(execute());
        assert_eq!(sb.take_outbox(), vec![FromContext::NetListen { port: 3000 }]);

        sb.handle(ToContext::NetRequest {
            port: 3000,
            method: "GET".to_string(),
            url: "/hello".to_string(),
            request_id: 9,
            headers: Default::default(),
            body: None,
        });
        match &sb.take_outbox()[..] {
            [FromContext::HttpResponse {
                request_id,
                status,
                headers,
                body,
            }] => {
                assert_eq!(*request_id, 9);
                assert_eq!(*status, 200);
                assert_eq!(headers.get("content-type").map(String::as_str), Some("text/plain"));
                assert_eq!(body, b"GET /hello");
            }
            other => panic!("unexpected {:?}", other),
        }

        sb.handle(ToContext::NetRequest {
            port: 4000,
            method: "GET".to_string(),
            url: "/".to_string(),
            request_id: 10,
            headers: Default::default(),
            body: None,
        });
        assert!(matches!(
            &sb.take_outbox()[..],
            [FromContext::HttpResponse { status: 502, .. }]
        ));
    }

    #[test]
    fn test_deferred_top_level_waits_for_syscall() {
        let engine = NativeEngine::new();
        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        engine.register("/app/main.js", move |scope| {
            let fs = scope.require("fs")?;
            let fs = fs.as_builtin().and_then(Builtin::as_fs).cloned().ok_or("fs missing".to_string())?;
            let sink = sink.clone();
            Ok(Completion::Pending(Box::pin(async move {
                let text = fs.read_to_string("/etc/motd").await.map_err(ScriptError::new)?;
                *sink.borrow_mut() = Some(text);
                Ok(())
            })))
        });

        let mut sb = sandbox(&engine, KernelConfig::default());
        sb.handle(execute());
        sb.run_tasks();
        let id = match &sb.take_outbox()[..] {
            [FromContext::FsRead { id, path, as_text: true }] if path == "/etc/motd" => *id,
            other => panic!("unexpected {:?}", other),
        };
        assert!(seen.borrow().is_none());

        sb.handle(ToContext::response(id, Ok(json!("welcome"))));
        sb.run_tasks();
        assert_eq!(seen.borrow().as_deref(), Some("welcome"));
        assert_eq!(sb.in_flight(), 0);
    }

    #[test]
    fn test_syscall_timeout_rejects() {
        let engine = NativeEngine::new();
        let failure = Rc::new(RefCell::new(None));
        let sink = failure.clone();
        engine.register("/app/main.js", move |scope| {
            let fs = scope.require("fs")?;
            let fs = fs.as_builtin().and_then(Builtin::as_fs).cloned().ok_or("fs missing".to_string())?;
            let sink = sink.clone();
            Ok(Completion::Pending(Box::pin(async move {
                if let Err(e) = fs.stat("/slow").await {
                    *sink.borrow_mut() = Some(e);
                }
                Ok(())
            })))
        });

        let config = KernelConfig {
            call_timeout_ms: Some(100.0),
            ..KernelConfig::default()
        };
        let mut sb = sandbox(&engine, config);
        sb.tick(0.0);
        sb.handle(execute());
        sb.run_tasks();
        assert_eq!(sb.in_flight(), 1);

        sb.tick(50.0);
        sb.run_tasks();
        assert!(failure.borrow().is_none());

        sb.tick(150.0);
        sb.run_tasks();
        assert!(failure.borrow().is_some());
        assert_eq!(sb.in_flight(), 0);
    }

    #[test]
    fn test_stdin_and_sockets() {
        let engine = NativeEngine::new();
        let typed = Rc::new(RefCell::new(String::new()));
        let received = Rc::new(Cell::new(0usize));
        let (typed_sink, received_sink) = (typed.clone(), received.clone());
        engine.register_sync("/app/main.js", move |scope| {
            let sink = typed_sink.clone();
            scope.globals().process.stdin().on("data", move |args| {
                if let Some(text) = args.first().and_then(Value::as_str) {
                    sink.borrow_mut().push_str(text);
                }
            });

            let net = scope.require("net")?;
            let net = net.as_builtin().and_then(Builtin::as_net).ok_or("net missing".to_string())?;
            let socket = net.connect(ConnectOptions::new("example.com", 80));
            let sink = received_sink.clone();
            socket.on("data", move |args| {
                if let Some(Value::Bytes(buf)) = args.first() {
                    sink.set(sink.get() + buf.len());
                }
            });
            Ok(())
        });

        let mut sb = sandbox(&engine, KernelConfig::default());
        sb.handle(execute());
        sb.run_tasks();
        let id = match &sb.take_outbox()[..] {
            [FromContext::NetTcpOpen { id, host, port: 80, .. }] if host == "example.com" => *id,
            other => panic!("unexpected {:?}", other),
        };
        sb.handle(ToContext::response(id, Ok(json!({ "streamId": 5 }))));
        sb.run_tasks();

        sb.handle(ToContext::NetTcpData {
            stream_id: 5,
            data: protocol::encode_base64(b"HTTP/1.1"),
            encoding: DataEncoding::Base64,
        });
        sb.handle(ToContext::TtyInput {
            data: "ls\n".to_string(),
        });

        assert_eq!(received.get(), 8);
        assert_eq!(typed.borrow().as_str(), "ls\n");
    }
}
