//! Globals installed in every context before user code runs
//!
//! - `process`: env, argv, pid, cwd, `next_tick`, events, `exit`
//! - `console`: every method becomes a `log` message
//! - `process.stdout`/`process.stderr`: writes become `tty-write` messages
//! - `Buffer`
//! - `fetch`: a `net-fetch` syscall, never a direct network request
//!
//! Nothing here touches a real terminal or the host console.

use super::buffer::{Buffer, BufferModule, Encoding};
use super::events::{EventEmitter, ListenerId};
use super::net::Fetcher;
use super::syscall::SyscallClient;
use crate::kernel::protocol::{FromContext, LogLevel, StdStream};
use crate::loader::Value;
use crate::vfs::path;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

/// A deferred callback queued with `next_tick`
pub type Tick = Box<dyn FnOnce()>;

/// A TTY-like standard stream
#[derive(Clone)]
pub struct TtyStream {
    client: SyscallClient,
    stream: StdStream,
    columns: u16,
    rows: u16,
}

impl TtyStream {
    fn new(client: SyscallClient, stream: StdStream, columns: u16, rows: u16) -> Self {
        Self {
            client,
            stream,
            columns,
            rows,
        }
    }

    /// Queue `data` for the terminal. Always accepted.
    pub fn write(&self, data: &str) -> bool {
        self.client.send(FromContext::TtyWrite {
            data: data.to_string(),
            stream: self.stream,
        });
        true
    }

    pub fn write_bytes(&self, data: &Buffer) -> bool {
        self.write(&data.to_string(Encoding::Utf8))
    }

    pub fn is_tty(&self) -> bool {
        true
    }

    pub fn columns(&self) -> u16 {
        self.columns
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }
}

struct ProcessInner {
    pid: u32,
    argv: Vec<String>,
    env: RefCell<BTreeMap<String, String>>,
    cwd: RefCell<String>,
    ticks: RefCell<VecDeque<Tick>>,
    events: EventEmitter,
    stdin: EventEmitter,
    stdout: TtyStream,
    stderr: TtyStream,
    exit_code: Cell<Option<i32>>,
    client: SyscallClient,
}

/// The emulated `process` object
#[derive(Clone)]
pub struct ProcessObject {
    inner: Rc<ProcessInner>,
}

/// What a new `process` object starts with
pub struct ProcessSetup {
    pub pid: u32,
    pub script: String,
    pub env: BTreeMap<String, String>,
    pub columns: u16,
    pub rows: u16,
}

impl ProcessObject {
    pub fn new(setup: ProcessSetup, client: SyscallClient) -> Self {
        let cwd = setup
            .env
            .get("PWD")
            .cloned()
            .unwrap_or_else(|| path::dirname(&setup.script));
        Self {
            inner: Rc::new(ProcessInner {
                pid: setup.pid,
                argv: vec!["cinder".to_string(), setup.script],
                env: RefCell::new(setup.env),
                cwd: RefCell::new(cwd),
                ticks: RefCell::new(VecDeque::new()),
                events: EventEmitter::new(),
                stdin: EventEmitter::new(),
                stdout: TtyStream::new(client.clone(), StdStream::Stdout, setup.columns, setup.rows),
                stderr: TtyStream::new(client.clone(), StdStream::Stderr, setup.columns, setup.rows),
                exit_code: Cell::new(None),
                client,
            }),
        }
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub fn argv(&self) -> &[String] {
        &self.inner.argv
    }

    pub fn platform(&self) -> &'static str {
        "browser"
    }

    pub fn env(&self, key: &str) -> Option<String> {
        self.inner.env.borrow().get(key).cloned()
    }

    pub fn set_env(&self, key: &str, value: &str) {
        self.inner
            .env
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
    }

    pub fn env_vars(&self) -> BTreeMap<String, String> {
        self.inner.env.borrow().clone()
    }

    pub fn cwd(&self) -> String {
        self.inner.cwd.borrow().clone()
    }

    pub fn chdir(&self, dir: &str) {
        let next = path::join(&self.cwd(), dir);
        *self.inner.cwd.borrow_mut() = next;
    }

    /// Resolve `p` against the working directory
    pub fn resolve(&self, p: &str) -> String {
        path::join(&self.cwd(), p)
    }

    /// Run `f` before any pending task continues
    pub fn next_tick<F: FnOnce() + 'static>(&self, f: F) {
        self.inner.ticks.borrow_mut().push_back(Box::new(f));
    }

    /// Drain the `next_tick` queue, including callbacks queued while
    /// draining. Returns how many ran.
    pub fn run_ticks(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.inner.ticks.borrow_mut().pop_front();
            match next {
                Some(tick) => {
                    tick();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    pub fn events(&self) -> &EventEmitter {
        &self.inner.events
    }

    pub fn on<F: Fn(&[Value]) + 'static>(&self, event: &str, listener: F) -> ListenerId {
        self.inner.events.on(event, listener)
    }

    pub fn once<F: Fn(&[Value]) + 'static>(&self, event: &str, listener: F) -> ListenerId {
        self.inner.events.once(event, listener)
    }

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.inner.events.off(event, id)
    }

    pub fn emit(&self, event: &str, args: &[Value]) -> bool {
        self.inner.events.emit(event, args)
    }

    /// Fed by `tty-input`; emits `data` with the input string
    pub fn stdin(&self) -> &EventEmitter {
        &self.inner.stdin
    }

    pub fn stdout(&self) -> &TtyStream {
        &self.inner.stdout
    }

    pub fn stderr(&self) -> &TtyStream {
        &self.inner.stderr
    }

    /// Emit `exit` and tell the supervisor. Only the first call counts.
    pub fn exit(&self, code: i32) {
        if self.inner.exit_code.get().is_some() {
            return;
        }
        self.inner.exit_code.set(Some(code));
        self.inner.events.emit("exit", &[Value::Number(code as f64)]);
        self.inner.client.send(FromContext::ProcExit { code });
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.inner.exit_code.get()
    }

    pub fn has_exited(&self) -> bool {
        self.inner.exit_code.get().is_some()
    }
}

/// `console`, redirected into the log channel
#[derive(Clone)]
pub struct Console {
    client: SyscallClient,
}

impl Console {
    pub fn new(client: SyscallClient) -> Self {
        Self { client }
    }

    pub fn log(&self, args: &[Value]) {
        self.write(LogLevel::Log, args);
    }

    pub fn info(&self, args: &[Value]) {
        self.write(LogLevel::Info, args);
    }

    pub fn warn(&self, args: &[Value]) {
        self.write(LogLevel::Warn, args);
    }

    pub fn error(&self, args: &[Value]) {
        self.write(LogLevel::Error, args);
    }

    pub fn debug(&self, args: &[Value]) {
        self.write(LogLevel::Debug, args);
    }

    /// Send one preformatted line
    pub fn text(&self, level: LogLevel, text: &str) {
        self.client.send(FromContext::Log {
            text: text.to_string(),
            level,
        });
    }

    fn write(&self, level: LogLevel, args: &[Value]) {
        let text = args.iter().map(Value::display).collect::<Vec<_>>().join(" ");
        self.text(level, &text);
    }
}

/// The `tty` built-in
#[derive(Debug, Clone, Copy)]
pub struct TtyModule {
    pub columns: u16,
    pub rows: u16,
}

impl TtyModule {
    /// The three standard descriptors are terminals
    pub fn isatty(&self, fd: i32) -> bool {
        (0..=2).contains(&fd)
    }
}

/// The `os` built-in
#[derive(Clone)]
pub struct OsModule {
    process: ProcessObject,
}

impl OsModule {
    pub fn new(process: ProcessObject) -> Self {
        Self { process }
    }

    pub fn platform(&self) -> &'static str {
        self.process.platform()
    }

    pub fn hostname(&self) -> &'static str {
        "localhost"
    }

    pub fn homedir(&self) -> String {
        self.process.env("HOME").unwrap_or_else(|| "/".to_string())
    }

    pub fn tmpdir(&self) -> &'static str {
        "/tmp"
    }

    pub fn eol(&self) -> &'static str {
        "\n"
    }
}

/// Everything bootstrap installs, handed to each module wrapper
#[derive(Clone)]
pub struct Globals {
    pub process: ProcessObject,
    pub console: Console,
    pub buffer: BufferModule,
    pub fetch: Fetcher,
}

impl Globals {
    pub fn install(setup: ProcessSetup, client: SyscallClient) -> Self {
        Self {
            process: ProcessObject::new(setup, client.clone()),
            console: Console::new(client.clone()),
            buffer: BufferModule,
            fetch: Fetcher::new(client),
        }
    }

    /// Replaces the global `fetch`, e.g. with one carrying a fallback
    pub fn with_fetcher(mut self, fetcher: Fetcher) -> Self {
        self.fetch = fetcher;
        self
    }
}
