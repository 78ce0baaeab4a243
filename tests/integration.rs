//! Integration tests for cinder
//!
//! These drive a whole supervisor with in-process sandboxes: spawn, the
//! message pump, loopback HTTP between processes, the module loader over
//! the synchronized filesystem and process teardown.

use cinder::config::{CachePolicy, KernelConfig};
use cinder::kernel::{
    EngineFactory, FetchRequest, LocalContextFactory, LoopbackError, MemorySink, Pid, ProcessStatus,
    Style, Supervisor,
};
use cinder::loader::{Builtin, Completion, NativeEngine, ScriptEngine, ScriptError, Value};
use cinder::sandbox::buffer::Buffer;
use cinder::vfs::{self, FileSystem, MemoryFs};
use futures::FutureExt;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

// ============================================================================
// Helpers
// ============================================================================

fn engines(engine: &NativeEngine) -> EngineFactory {
    let engine = engine.clone();
    Rc::new(move || Rc::new(engine.clone()) as Rc<dyn ScriptEngine>)
}

fn kernel_with(engine: &NativeEngine, config: KernelConfig, fs: MemoryFs) -> (Supervisor, MemorySink) {
    let sink = MemorySink::new();
    let supervisor = Supervisor::new(
        config,
        Box::new(LocalContextFactory::new(engines(engine))),
        Box::new(fs),
        Rc::new(sink.clone()),
    );
    (supervisor, sink)
}

fn kernel(engine: &NativeEngine) -> (Supervisor, MemorySink) {
    kernel_with(engine, KernelConfig::default(), MemoryFs::new())
}

fn write(fs: &mut MemoryFs, file: &str, text: &str) {
    vfs::create_dir_all(fs, &vfs::path::dirname(file)).unwrap();
    fs.write_file(file, text.as_bytes()).unwrap();
}

/// Register `path` as an HTTP server on `port` answering `reply`
fn serve(engine: &NativeEngine, path: &str, port: u16, reply: &'static str) {
    engine.register_sync(path, move |scope| {
        let http = scope.require("http")?;
        let http = http
            .as_builtin()
            .and_then(Builtin::as_http)
            .ok_or_else(|| ScriptError::new("http missing"))?;
        let server = http.create_server(move |req, res| {
            res.set_header("X-Path", &req.url);
            res.end(Some(Buffer::from(reply)));
            Ok(())
        });
        server.listen(port);
        Ok(())
    });
}

/// Poll a loopback call once the kernel is idle
fn settle(
    kernel: &mut Supervisor,
    request: FetchRequest,
) -> Option<Result<cinder::kernel::FetchResponse, LoopbackError>> {
    let mut call = Box::pin(kernel.fetch(request));
    kernel.run_until_idle();
    call.as_mut().now_or_never()
}

// ============================================================================
// Processes and ports
// ============================================================================

#[test]
fn test_spawned_server_answers_loopback() {
    let engine = NativeEngine::new();
    serve(&engine, "/srv/app.js", 3000, "hello");
    let (mut kernel, _) = kernel(&engine);

    let pid = kernel.spawn("", "/srv/app.js").unwrap();
    kernel.run_until_idle();
    assert_eq!(kernel.port_owner(3000), Some(pid));
    assert_eq!(kernel.status(pid), Some(ProcessStatus::Running));

    let response = settle(&mut kernel, FetchRequest::get("http://localhost:3000/api?x=1"))
        .expect("settled")
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"hello");
    assert_eq!(response.headers.get("x-path").map(String::as_str), Some("/api?x=1"));
    assert_eq!(kernel.loopback_in_flight(), 0);
}

#[test]
fn test_port_stays_with_first_listener() {
    let engine = NativeEngine::new();
    serve(&engine, "/srv/first.js", 8080, "first");
    serve(&engine, "/srv/second.js", 8080, "second");
    let (mut kernel, sink) = kernel(&engine);

    let first = kernel.spawn("", "/srv/first.js").unwrap();
    kernel.run_until_idle();
    let second = kernel.spawn("", "/srv/second.js").unwrap();
    kernel.run_until_idle();

    assert_eq!(kernel.port_owner(8080), Some(first));
    assert!(kernel.is_running(second));
    assert!(sink
        .with_style(Style::Warn)
        .iter()
        .any(|line| line.contains("port 8080 is already in use")));

    let response = settle(&mut kernel, FetchRequest::get("localhost:8080/")).unwrap().unwrap();
    assert_eq!(response.body, b"first");
}

#[test]
fn test_nothing_listening_is_refused() {
    let engine = NativeEngine::new();
    let (mut kernel, _) = kernel(&engine);

    let result = settle(&mut kernel, FetchRequest::get("http://localhost:5555/")).unwrap();
    assert_eq!(result, Err(LoopbackError::ConnectionRefused { port: 5555 }));

    let result = settle(&mut kernel, FetchRequest::get("not a url")).unwrap();
    assert!(matches!(result, Err(LoopbackError::InvalidUrl(_))));
}

#[test]
fn test_exited_owner_is_dead_then_refused() {
    let engine = NativeEngine::new();
    engine.register_sync("/srv/once.js", |scope| {
        let http = scope.require("http")?;
        let http = http
            .as_builtin()
            .and_then(Builtin::as_http)
            .ok_or_else(|| ScriptError::new("http missing"))?;
        http.create_server(|_, res| {
            res.end(None);
            Ok(())
        })
        .listen(4000);
        scope.globals().process.exit(0);
        Ok(())
    });
    let (mut kernel, _) = kernel(&engine);

    let pid = kernel.spawn("", "/srv/once.js").unwrap();
    kernel.run_until_idle();
    assert!(!kernel.is_running(pid));
    assert_eq!(kernel.status(pid), Some(ProcessStatus::Exited(0)));
    // Natural exit leaves the binding behind
    assert_eq!(kernel.port_owner(4000), Some(pid));

    let result = settle(&mut kernel, FetchRequest::get("http://localhost:4000/")).unwrap();
    assert_eq!(result, Err(LoopbackError::ProcessDead { port: 4000, pid }));
    assert_eq!(kernel.port_owner(4000), None);

    let result = settle(&mut kernel, FetchRequest::get("http://localhost:4000/")).unwrap();
    assert_eq!(result, Err(LoopbackError::ConnectionRefused { port: 4000 }));
}

#[test]
fn test_kill_releases_ports_and_twice_is_harmless() {
    let engine = NativeEngine::new();
    serve(&engine, "/srv/app.js", 9000, "up");
    let (mut kernel, _) = kernel(&engine);

    let pid = kernel.spawn("", "/srv/app.js").unwrap();
    kernel.run_until_idle();
    assert_eq!(kernel.port_owner(9000), Some(pid));

    kernel.kill(pid);
    kernel.kill(pid);
    kernel.kill(Pid(999));
    assert!(!kernel.is_running(pid));
    assert_eq!(kernel.port_owner(9000), None);
    assert!(kernel.list().is_empty());

    let result = settle(&mut kernel, FetchRequest::get("http://localhost:9000/")).unwrap();
    assert_eq!(result, Err(LoopbackError::ConnectionRefused { port: 9000 }));

    // The port is free for the next server
    let again = kernel.spawn("", "/srv/app.js").unwrap();
    kernel.run_until_idle();
    assert_eq!(kernel.port_owner(9000), Some(again));
}

#[test]
fn test_process_fetches_from_another_process() {
    let engine = NativeEngine::new();
    serve(&engine, "/srv/api.js", 3000, "pong");

    let seen = Rc::new(RefCell::new(None));
    let record = seen.clone();
    engine.register("/srv/client.js", move |scope| {
        let http = scope.require("http")?;
        let http = http
            .as_builtin()
            .and_then(Builtin::as_http)
            .cloned()
            .ok_or_else(|| ScriptError::new("http missing"))?;
        let record = record.clone();
        Ok(Completion::Pending(Box::pin(async move {
            let response = http.get("localhost:3000/ping").await.map_err(ScriptError::new)?;
            *record.borrow_mut() = Some((response.status, response.body));
            Ok(())
        })))
    });
    let (mut kernel, _) = kernel(&engine);

    kernel.spawn("", "/srv/api.js").unwrap();
    kernel.run_until_idle();
    kernel.spawn("", "/srv/client.js").unwrap();
    kernel.run_until_idle();

    assert_eq!(*seen.borrow(), Some((200, b"pong".to_vec())));
    assert_eq!(kernel.loopback_in_flight(), 0);
}

#[test]
fn test_logs_and_stdout_reach_the_sink() {
    let engine = NativeEngine::new();
    engine.register_sync("/bin/hello.js", |scope| {
        let globals = scope.globals();
        globals.console.log(&[Value::from("hello"), Value::from(42.0)]);
        globals.console.error(&[Value::from("oops")]);
        globals.process.stdout().write("raw\n");
        Ok(())
    });
    let (mut kernel, sink) = kernel(&engine);

    kernel.spawn("", "/bin/hello.js").unwrap();
    kernel.run_until_idle();

    assert!(sink.contains("hello 42"));
    assert!(sink.with_style(Style::Error).iter().any(|l| l.contains("oops")));
    assert_eq!(sink.with_style(Style::Stdout), vec!["raw\n".to_string()]);
}

#[test]
fn test_stdin_reaches_the_process() {
    let engine = NativeEngine::new();
    engine.register_sync("/bin/echo.js", |scope| {
        let stdout = scope.globals().process.stdout().clone();
        scope.globals().process.stdin().on("data", move |args| {
            if let Some(text) = args.first().and_then(Value::as_str) {
                stdout.write(&text.to_uppercase());
            }
        });
        Ok(())
    });
    let (mut kernel, sink) = kernel(&engine);

    let pid = kernel.spawn("", "/bin/echo.js").unwrap();
    kernel.run_until_idle();
    kernel.send_input(pid, "abc").unwrap();
    kernel.run_until_idle();

    assert_eq!(sink.with_style(Style::Stdout), vec!["ABC".to_string()]);
    assert!(kernel.send_input(Pid(77), "x").is_err());
}

// ============================================================================
// Module loading over the synchronized filesystem
// ============================================================================

fn counting(engine: &NativeEngine, runs: &Rc<Cell<u32>>) {
    let count = runs.clone();
    engine.register_sync("/app/counter.js", move |scope| {
        count.set(count.get() + 1);
        scope.export("runs", count.get() as f64);
        Ok(())
    });
    engine.register_sync("/app/main.js", |scope| {
        scope.require("./counter")?;
        scope.require("./counter.js")?;
        Ok(())
    });
}

#[test]
fn test_reexecute_runs_dependency_per_require() {
    let engine = NativeEngine::new();
    let runs = Rc::new(Cell::new(0));
    counting(&engine, &runs);
    let mut fs = MemoryFs::new();
    write(&mut fs, "/app/counter.js", "exports.runs = ++globalThis.n;");
    let (mut kernel, _) = kernel_with(&engine, KernelConfig::default(), fs);

    kernel.spawn("", "/app/main.js").unwrap();
    kernel.run_until_idle();
    assert_eq!(runs.get(), 2);
}

#[test]
fn test_path_keyed_runs_dependency_once() {
    let engine = NativeEngine::new();
    let runs = Rc::new(Cell::new(0));
    counting(&engine, &runs);
    let mut fs = MemoryFs::new();
    write(&mut fs, "/app/counter.js", "exports.runs = ++globalThis.n;");
    let config = KernelConfig {
        module_cache: CachePolicy::PathKeyed,
        ..KernelConfig::default()
    };
    let (mut kernel, _) = kernel_with(&engine, config, fs);

    kernel.spawn("", "/app/main.js").unwrap();
    kernel.run_until_idle();
    assert_eq!(runs.get(), 1);
}

#[test]
fn test_bare_specifier_walks_up_and_unwraps_default() {
    let engine = NativeEngine::new();
    engine.register_sync("/proj/node_modules/greet/lib/index.js", |scope| {
        scope.export("__esModule", true);
        scope.export("default", "hi from greet");
        Ok(())
    });
    let found = Rc::new(RefCell::new(None));
    let record = found.clone();
    engine.register_sync("/proj/src/deep/main.js", move |scope| {
        let value = scope.import_default("greet")?;
        *record.borrow_mut() = value.as_str().map(str::to_string);
        Ok(())
    });

    let mut fs = MemoryFs::new();
    write(&mut fs, "/proj/node_modules/greet/package.json", r#"{ "main": "lib/index.js" }"#);
    write(&mut fs, "/proj/node_modules/greet/lib/index.js", "export default 'hi from greet';");
    vfs::create_dir_all(&mut fs, "/proj/src/deep").unwrap();
    let (mut kernel, sink) = kernel_with(&engine, KernelConfig::default(), fs);

    kernel.spawn("", "/proj/src/deep/main.js").unwrap();
    kernel.run_until_idle();
    assert_eq!(found.borrow().as_deref(), Some("hi from greet"));
    assert!(sink.with_style(Style::Error).is_empty());
}

#[test]
fn test_synchronized_files_are_readable() {
    let engine = NativeEngine::new();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let record = seen.clone();
    engine.register_sync("/app/main.js", move |scope| {
        let fs = scope.require("fs")?;
        let fs = fs
            .as_builtin()
            .and_then(Builtin::as_fs)
            .ok_or_else(|| ScriptError::new("fs missing"))?;
        for entry in fs.readdir_sync("/data/nested")? {
            record.borrow_mut().push(entry.name);
        }
        record
            .borrow_mut()
            .push(fs.read_to_string_sync("/data/nested/a.txt")?);
        let config = scope.require("/data/settings.json")?;
        record
            .borrow_mut()
            .push(config.get("mode").as_str().unwrap_or_default().to_string());
        Ok(())
    });

    let mut fs = MemoryFs::new();
    write(&mut fs, "/data/nested/a.txt", "alpha");
    write(&mut fs, "/data/nested/b.txt", "beta");
    write(&mut fs, "/data/settings.json", r#"{ "mode": "dev" }"#);
    let (mut kernel, sink) = kernel_with(&engine, KernelConfig::default(), fs);

    kernel.spawn("", "/app/main.js").unwrap();
    kernel.run_until_idle();
    assert!(sink.with_style(Style::Error).is_empty());
    assert_eq!(
        *seen.borrow(),
        vec!["a.txt", "b.txt", "alpha", "dev"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
    );
}

#[test]
fn test_failing_main_reports_and_keeps_running() {
    let engine = NativeEngine::new();
    engine.register_sync("/app/main.js", |scope| scope.require("./missing").map(|_| ()));
    let (mut kernel, sink) = kernel(&engine);

    let pid = kernel.spawn("", "/app/main.js").unwrap();
    kernel.run_until_idle();
    assert!(sink
        .with_style(Style::Error)
        .iter()
        .any(|line| line.contains("Cannot find module './missing'")));
    assert!(kernel.is_running(pid));
}

#[test]
fn test_process_writes_back_to_host_filesystem() {
    let engine = NativeEngine::new();
    engine.register("/app/main.js", |scope| {
        let fs = scope.require("fs")?;
        let fs = fs
            .as_builtin()
            .and_then(Builtin::as_fs)
            .cloned()
            .ok_or_else(|| ScriptError::new("fs missing"))?;
        Ok(Completion::Pending(Box::pin(async move {
            fs.mkdir("/out/logs").await.map_err(ScriptError::new)?;
            fs.write_file("/out/logs/run.txt", b"done").await.map_err(ScriptError::new)
        })))
    });
    let (mut kernel, sink) = kernel(&engine);

    kernel.spawn("", "/app/main.js").unwrap();
    kernel.run_until_idle();
    assert!(sink.with_style(Style::Error).is_empty());
    assert_eq!(vfs::read_to_string(kernel.fs(), "/out/logs/run.txt").unwrap(), "done");
}
