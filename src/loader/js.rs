//! Browser script engine
//!
//! Modules run in the worker's own JS runtime: the wrapper is evaluated
//! to a function and applied to the scope's bindings. The built-ins are
//! plain JS objects whose methods call into the sandbox's Rust services.
//!
//! Values cross the boundary through `to_js`/`from_js`. JS objects stay JS
//! objects: on the Rust side they travel as `Value::Host`.

#![cfg(target_arch = "wasm32")]

use super::builtins::{Builtin, PathModule, UrlModule};
use super::engine::{Completion, ScriptEngine, ScriptUnit};
use super::error::ScriptError;
use super::scope::ModuleScope;
use super::value::Value;
use crate::kernel::protocol::{FetchRequest, FetchResponse, LogLevel};
use crate::sandbox::bootstrap::{Console, OsModule, ProcessObject, TtyModule};
use crate::sandbox::buffer::{Buffer, Encoding};
use crate::sandbox::fs::FsModule;
use crate::sandbox::net::{ConnectOptions, Fetcher, HttpModule, HttpServer, IncomingRequest, NetModule, ServerResponse, VirtualSocket};
use futures::FutureExt;
use js_sys::{Array, Function, Object, Reflect, Uint8Array};
use std::future::Future;
use std::rc::Rc;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::{JsFuture, future_to_promise};

thread_local! {
    /// Turns a one-argument native closure into a variadic JS function
    static VARIADIC: Option<Function> = js_sys::eval("(f) => function (...args) { return f(args); }")
        .ok()
        .and_then(|f| f.dyn_into().ok());

    /// Node-style emitter class for the `events` built-in
    static EMITTER: JsValue = js_sys::eval(EMITTER_SOURCE).unwrap_or(JsValue::UNDEFINED);
}

const EMITTER_SOURCE: &str = r#"(class EventEmitter {
  constructor() { this._events = new Map(); }
  on(event, fn) { (this._events.get(event) || this._events.set(event, []).get(event)).push(fn); return this; }
  addListener(event, fn) { return this.on(event, fn); }
  once(event, fn) { const w = (...a) => { this.off(event, w); fn.apply(this, a); }; w.listener = fn; return this.on(event, w); }
  off(event, fn) { const l = this._events.get(event); if (l) { const i = l.findIndex((x) => x === fn || x.listener === fn); if (i >= 0) l.splice(i, 1); } return this; }
  removeListener(event, fn) { return this.off(event, fn); }
  removeAllListeners(event) { if (event === undefined) this._events.clear(); else this._events.delete(event); return this; }
  emit(event, ...args) { const l = this._events.get(event); if (!l || l.length === 0) return false; for (const fn of [...l]) fn.apply(this, args); return true; }
  listenerCount(event) { return (this._events.get(event) || []).length; }
})"#;

/// Evaluates modules with the host JS runtime
#[derive(Debug, Clone, Copy, Default)]
pub struct JsEngine;

impl JsEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ScriptEngine for JsEngine {
    fn evaluate(&self, unit: &ScriptUnit, scope: &ModuleScope) -> Result<Completion, ScriptError> {
        let wrapper: Function = js_sys::eval(&unit.wrapper())
            .map_err(script_error)?
            .dyn_into()
            .map_err(|_| ScriptError::new("module wrapper is not a function"))?;

        let exports = Object::new();
        let module = Object::new();
        set(&module, "exports", &exports);
        set(&module, "id", &JsValue::from_str(scope.filename()));
        set(&module, "filename", &JsValue::from_str(scope.filename()));
        // Partial exports for anyone requiring us mid-evaluation
        scope.set_module_exports(host(exports.clone().into()));

        let globals = scope.globals();
        let args = Array::new();
        args.push(&exports);
        args.push(&require_fn(scope));
        args.push(&module);
        args.push(&JsValue::from_str(scope.filename()));
        args.push(&JsValue::from_str(scope.dirname()));
        args.push(&JsValue::from_str(&scope.module_url()));
        args.push(&import_default_fn());
        args.push(&import_fn(scope));
        args.push(&process_shim(&globals.process));
        args.push(&buffer_shim());
        args.push(&console_shim(&globals.console));
        args.push(&fetch_fn(&globals.fetch));

        let returned = wrapper.apply(&JsValue::NULL, &args).map_err(script_error)?;
        scope.set_module_exports(host(get(&module, "exports")));

        if !unit.is_async {
            return Ok(Completion::Done);
        }
        let scope = scope.clone();
        let pending = JsFuture::from(js_sys::Promise::resolve(&returned));
        Ok(Completion::Pending(
            async move {
                pending.await.map_err(script_error)?;
                scope.set_module_exports(host(get(&module, "exports")));
                Ok(())
            }
            .boxed_local(),
        ))
    }
}

// ============================================================================
// Value bridge
// ============================================================================

fn host(value: JsValue) -> Value {
    Value::Host(Rc::new(value))
}

pub fn to_js(value: &Value) -> JsValue {
    match value {
        Value::Undefined => JsValue::UNDEFINED,
        Value::Null => JsValue::NULL,
        Value::Bool(b) => JsValue::from_bool(*b),
        Value::Number(n) => JsValue::from_f64(*n),
        Value::String(s) => JsValue::from_str(s),
        Value::Bytes(buf) => buffer_value(buf),
        Value::Array(items) => items.iter().map(to_js).collect::<Array>().into(),
        Value::Object(map) => {
            let obj = Object::new();
            for (key, item) in map.borrow().iter() {
                set(&obj, key, &to_js(item));
            }
            obj.into()
        }
        Value::Function(_) => {
            let f = value.clone();
            native(move |args| {
                let args: Vec<Value> = args.iter().map(|a| from_js(&a)).collect();
                f.call(&args).map(|v| to_js(&v)).map_err(|e| throw(e.message))
            })
        }
        Value::Builtin(builtin) => builtin_shim(builtin),
        Value::Host(any) => any.downcast_ref::<JsValue>().cloned().unwrap_or(JsValue::UNDEFINED),
    }
}

pub fn from_js(value: &JsValue) -> Value {
    if value.is_undefined() {
        Value::Undefined
    } else if value.is_null() {
        Value::Null
    } else if let Some(b) = value.as_bool() {
        Value::Bool(b)
    } else if let Some(n) = value.as_f64() {
        Value::Number(n)
    } else if let Some(s) = value.as_string() {
        Value::String(s)
    } else if let Some(bytes) = value.dyn_ref::<Uint8Array>() {
        Value::Bytes(Buffer::from(bytes.to_vec()))
    } else {
        host(value.clone())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn set(target: &Object, key: &str, value: &JsValue) {
    let _ = Reflect::set(target, &JsValue::from_str(key), value);
}

fn get(target: &JsValue, key: &str) -> JsValue {
    Reflect::get(target, &JsValue::from_str(key)).unwrap_or(JsValue::UNDEFINED)
}

fn throw(message: impl std::fmt::Display) -> JsValue {
    js_sys::Error::new(&message.to_string()).into()
}

fn script_error(e: JsValue) -> ScriptError {
    let message = e
        .dyn_ref::<js_sys::Error>()
        .map(|err| String::from(err.message()))
        .or_else(|| e.as_string())
        .unwrap_or_else(|| format!("{:?}", e));
    ScriptError::new(message)
}

/// A JS function backed by a Rust closure over its argument list
fn native<F>(f: F) -> JsValue
where
    F: Fn(Array) -> Result<JsValue, JsValue> + 'static,
{
    let inner = Closure::<dyn Fn(Array) -> Result<JsValue, JsValue>>::new(f).into_js_value();
    VARIADIC.with(|adapter| match adapter {
        Some(adapter) => adapter.call1(&JsValue::NULL, &inner).unwrap_or(inner),
        None => inner,
    })
}

fn method<F>(target: &Object, name: &str, f: F)
where
    F: Fn(Array) -> Result<JsValue, JsValue> + 'static,
{
    set(target, name, &native(f));
}

fn string_arg(args: &Array, i: u32) -> Result<String, JsValue> {
    args.get(i)
        .as_string()
        .ok_or_else(|| throw(format!("argument {} must be a string", i)))
}

fn function_arg(args: &Array, i: u32) -> Option<Function> {
    args.get(i).dyn_into::<Function>().ok()
}

/// A string or a byte array, as bytes
fn bytes_of(value: &JsValue) -> Vec<u8> {
    if let Some(bytes) = value.dyn_ref::<Uint8Array>() {
        bytes.to_vec()
    } else if let Some(text) = value.as_string() {
        text.into_bytes()
    } else {
        String::from(js_sys::JsString::from(value.clone())).into_bytes()
    }
}

/// Encoding named by a string argument or an `{ encoding }` options object
fn encoding_arg(value: &JsValue) -> Option<Encoding> {
    value
        .as_string()
        .or_else(|| get(value, "encoding").as_string())
        .and_then(|name| Encoding::parse(&name))
}

fn promise<F>(future: F) -> JsValue
where
    F: Future<Output = Result<JsValue, String>> + 'static,
{
    future_to_promise(async move { future.await.map_err(throw) }).into()
}

/// Call a JS listener with sandbox values
fn listener(f: Function) -> impl Fn(&[Value]) + 'static {
    move |args: &[Value]| {
        let args: Array = args.iter().map(to_js).collect();
        if let Err(e) = f.apply(&JsValue::NULL, &args) {
            crate::console_log!("[listener] {}", script_error(e));
        }
    }
}

fn strings(args: &Array) -> Vec<String> {
    args.iter().filter_map(|a| a.as_string()).collect()
}

// ============================================================================
// Module wrapper bindings
// ============================================================================

fn require_fn(scope: &ModuleScope) -> JsValue {
    let scope = scope.clone();
    native(move |args| {
        let specifier = string_arg(&args, 0)?;
        scope
            .require(&specifier)
            .map(|v| to_js(&v))
            .map_err(|e| throw(e.message))
    })
}

fn import_default_fn() -> JsValue {
    native(|args| {
        let exports = args.get(0);
        if exports.is_object() && Reflect::has(&exports, &JsValue::from_str("default")).unwrap_or(false) {
            Ok(get(&exports, "default"))
        } else {
            Ok(exports)
        }
    })
}

fn import_fn(scope: &ModuleScope) -> JsValue {
    let scope = scope.clone();
    native(move |args| {
        let specifier = string_arg(&args, 0)?;
        let loading = scope.import(&specifier);
        Ok(promise(async move {
            loading.await.map(|v| to_js(&v)).map_err(|e| e.message)
        }))
    })
}

fn console_shim(console: &Console) -> JsValue {
    let obj = Object::new();
    let levels = [
        ("log", LogLevel::Log),
        ("info", LogLevel::Info),
        ("warn", LogLevel::Warn),
        ("error", LogLevel::Error),
        ("debug", LogLevel::Debug),
    ];
    for (name, level) in levels {
        let console = console.clone();
        method(&obj, name, move |args| {
            let text = args.iter().map(|a| format_arg(&a)).collect::<Vec<_>>().join(" ");
            console.text(level, &text);
            Ok(JsValue::UNDEFINED)
        });
    }
    obj.into()
}

fn format_arg(value: &JsValue) -> String {
    if let Some(text) = value.as_string() {
        return text;
    }
    if let Some(err) = value.dyn_ref::<js_sys::Error>() {
        return String::from(err.to_string());
    }
    if value.is_object()
        && !value.is_function()
        && let Ok(json) = js_sys::JSON::stringify(value)
    {
        return String::from(json);
    }
    String::from(js_sys::JsString::from(value.clone()))
}

// ============================================================================
// Buffer
// ============================================================================

/// A `Uint8Array` whose `toString` takes an encoding
fn buffer_value(buf: &Buffer) -> JsValue {
    let array = Uint8Array::from(buf.as_bytes());
    let bytes = buf.clone();
    set(
        &array,
        "toString",
        &native(move |args| {
            let encoding = encoding_arg(&args.get(0)).unwrap_or(Encoding::Utf8);
            Ok(JsValue::from_str(&bytes.to_string(encoding)))
        }),
    );
    array.into()
}

fn buffer_shim() -> JsValue {
    let obj = Object::new();
    method(&obj, "from", |args| {
        let data = args.get(0);
        match data.as_string() {
            Some(text) => {
                let encoding = encoding_arg(&args.get(1)).unwrap_or(Encoding::Utf8);
                Buffer::from_str(&text, encoding)
                    .map(|b| buffer_value(&b))
                    .map_err(throw)
            }
            None if Array::is_array(&data) => {
                let bytes: Vec<u8> = Array::from(&data)
                    .iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as u8)
                    .collect();
                Ok(buffer_value(&Buffer::from(bytes)))
            }
            None => Ok(buffer_value(&Buffer::from(bytes_of(&data)))),
        }
    });
    method(&obj, "alloc", |args| {
        let len = args.get(0).as_f64().unwrap_or(0.0).max(0.0) as usize;
        Ok(buffer_value(&Buffer::alloc(len)))
    });
    method(&obj, "concat", |args| {
        let parts: Vec<Buffer> = Array::from(&args.get(0))
            .iter()
            .map(|p| Buffer::from(bytes_of(&p)))
            .collect();
        Ok(buffer_value(&Buffer::concat(&parts)))
    });
    method(&obj, "byteLength", |args| {
        let text = string_arg(&args, 0)?;
        let encoding = encoding_arg(&args.get(1)).unwrap_or(Encoding::Utf8);
        Buffer::from_str(&text, encoding)
            .map(|b| JsValue::from_f64(b.len() as f64))
            .map_err(throw)
    });
    method(&obj, "isBuffer", |args| Ok(JsValue::from_bool(args.get(0).is_instance_of::<Uint8Array>())));
    obj.into()
}

// ============================================================================
// process, tty, os
// ============================================================================

fn stream_shim(process: &ProcessObject, stderr: bool) -> JsValue {
    let obj = Object::new();
    let stream = if stderr { process.stderr() } else { process.stdout() };
    set(&obj, "isTTY", &JsValue::from_bool(stream.is_tty()));
    set(&obj, "columns", &JsValue::from_f64(stream.columns() as f64));
    set(&obj, "rows", &JsValue::from_f64(stream.rows() as f64));
    let process = process.clone();
    method(&obj, "write", move |args| {
        let stream = if stderr { process.stderr() } else { process.stdout() };
        let data = args.get(0);
        let written = match data.as_string() {
            Some(text) => stream.write(&text),
            None => stream.write_bytes(&Buffer::from(bytes_of(&data))),
        };
        Ok(JsValue::from_bool(written))
    });
    obj.into()
}

fn process_shim(process: &ProcessObject) -> JsValue {
    let obj = Object::new();
    set(&obj, "pid", &JsValue::from_f64(process.pid() as f64));
    set(&obj, "platform", &JsValue::from_str(process.platform()));
    set(
        &obj,
        "argv",
        &process.argv().iter().map(|a| JsValue::from_str(a)).collect::<Array>(),
    );
    let env = Object::new();
    for (key, value) in process.env_vars() {
        set(&env, &key, &JsValue::from_str(&value));
    }
    set(&obj, "env", &env);
    set(&obj, "stdout", &stream_shim(process, false));
    set(&obj, "stderr", &stream_shim(process, true));

    let stdin = Object::new();
    let p = process.clone();
    method(&stdin, "on", move |args| {
        let event = string_arg(&args, 0)?;
        if let Some(f) = function_arg(&args, 1) {
            p.stdin().on(&event, listener(f));
        }
        Ok(JsValue::UNDEFINED)
    });
    set(&obj, "stdin", &stdin);

    let p = process.clone();
    method(&obj, "cwd", move |_| Ok(JsValue::from_str(&p.cwd())));
    let p = process.clone();
    method(&obj, "chdir", move |args| {
        p.chdir(&string_arg(&args, 0)?);
        Ok(JsValue::UNDEFINED)
    });
    let p = process.clone();
    method(&obj, "nextTick", move |args| {
        let Some(f) = function_arg(&args, 0) else {
            return Err(throw("callback must be a function"));
        };
        let rest = args.slice(1, args.length());
        p.next_tick(move || {
            if let Err(e) = f.apply(&JsValue::NULL, &rest) {
                crate::console_log!("[nextTick] {}", script_error(e));
            }
        });
        Ok(JsValue::UNDEFINED)
    });
    let p = process.clone();
    method(&obj, "exit", move |args| {
        p.exit(args.get(0).as_f64().unwrap_or(0.0) as i32);
        Ok(JsValue::UNDEFINED)
    });
    for name in ["on", "once"] {
        let p = process.clone();
        method(&obj, name, move |args| {
            let event = string_arg(&args, 0)?;
            if let Some(f) = function_arg(&args, 1) {
                if name == "on" {
                    p.on(&event, listener(f));
                } else {
                    p.once(&event, listener(f));
                }
            }
            Ok(JsValue::UNDEFINED)
        });
    }
    let p = process.clone();
    method(&obj, "emit", move |args| {
        let event = string_arg(&args, 0)?;
        let rest: Vec<Value> = args.iter().skip(1).map(|a| from_js(&a)).collect();
        Ok(JsValue::from_bool(p.emit(&event, &rest)))
    });
    obj.into()
}

fn tty_shim(tty: TtyModule) -> JsValue {
    let obj = Object::new();
    method(&obj, "isatty", move |args| {
        Ok(JsValue::from_bool(tty.isatty(args.get(0).as_f64().unwrap_or(-1.0) as i32)))
    });
    obj.into()
}

fn os_shim(os: &OsModule) -> JsValue {
    let obj = Object::new();
    set(&obj, "EOL", &JsValue::from_str(os.eol()));
    let o = os.clone();
    method(&obj, "platform", move |_| Ok(JsValue::from_str(o.platform())));
    let o = os.clone();
    method(&obj, "hostname", move |_| Ok(JsValue::from_str(o.hostname())));
    let o = os.clone();
    method(&obj, "homedir", move |_| Ok(JsValue::from_str(&o.homedir())));
    let o = os.clone();
    method(&obj, "tmpdir", move |_| Ok(JsValue::from_str(o.tmpdir())));
    obj.into()
}

// ============================================================================
// path, url, events
// ============================================================================

fn path_shim(path: &PathModule) -> JsValue {
    let obj = Object::new();
    set(&obj, "sep", &JsValue::from_str(PathModule::SEP));
    set(&obj, "delimiter", &JsValue::from_str(PathModule::DELIMITER));
    let p = path.clone();
    method(&obj, "join", move |args| {
        let parts = strings(&args);
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
        Ok(JsValue::from_str(&p.join(&parts)))
    });
    let p = path.clone();
    method(&obj, "resolve", move |args| {
        let parts = strings(&args);
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
        Ok(JsValue::from_str(&p.resolve(&parts)))
    });
    let p = path.clone();
    method(&obj, "normalize", move |args| Ok(JsValue::from_str(&p.normalize(&string_arg(&args, 0)?))));
    let p = path.clone();
    method(&obj, "dirname", move |args| Ok(JsValue::from_str(&p.dirname(&string_arg(&args, 0)?))));
    let p = path.clone();
    method(&obj, "basename", move |args| {
        let full = string_arg(&args, 0)?;
        let ext = args.get(1).as_string();
        Ok(JsValue::from_str(p.basename(&full, ext.as_deref())))
    });
    let p = path.clone();
    method(&obj, "extname", move |args| Ok(JsValue::from_str(p.extname(&string_arg(&args, 0)?))));
    let p = path.clone();
    method(&obj, "isAbsolute", move |args| Ok(JsValue::from_bool(p.is_absolute(&string_arg(&args, 0)?))));
    obj.into()
}

fn url_shim(url: UrlModule) -> JsValue {
    let obj = Object::new();
    method(&obj, "parse", move |args| {
        let text = string_arg(&args, 0)?;
        let Some(parts) = url.parse(&text) else {
            return Ok(JsValue::NULL);
        };
        let out = Object::new();
        set(&out, "href", &JsValue::from_str(&text));
        set(&out, "protocol", &JsValue::from_str(&parts.protocol));
        set(&out, "hostname", &JsValue::from_str(&parts.hostname));
        set(&out, "host", &JsValue::from_str(&parts.host()));
        set(
            &out,
            "port",
            &parts.port.map(|p| JsValue::from_str(&p.to_string())).unwrap_or(JsValue::NULL),
        );
        set(&out, "pathname", &JsValue::from_str(&parts.pathname));
        set(&out, "search", &JsValue::from_str(&parts.search));
        set(&out, "hash", &JsValue::from_str(&parts.hash));
        Ok(out.into())
    });
    method(&obj, "fileURLToPath", move |args| {
        let text = string_arg(&args, 0)?;
        url.file_url_to_path(&text)
            .map(|p| JsValue::from_str(&p))
            .ok_or_else(|| throw(format!("not a file URL: {}", text)))
    });
    method(&obj, "pathToFileURL", move |args| {
        let out = Object::new();
        set(&out, "href", &JsValue::from_str(&url.path_to_file_url(&string_arg(&args, 0)?)));
        Ok(out.into())
    });
    obj.into()
}

fn events_shim() -> JsValue {
    let class = EMITTER.with(JsValue::clone);
    let obj = Object::new();
    set(&obj, "EventEmitter", &class);
    set(&obj, "default", &class);
    obj.into()
}

// ============================================================================
// fs
// ============================================================================

fn metadata_value(meta: &crate::vfs::Metadata) -> JsValue {
    let obj = Object::new();
    let is_dir = meta.kind.is_dir();
    set(&obj, "size", &JsValue::from_f64(meta.size as f64));
    method(&obj, "isDirectory", move |_| Ok(JsValue::from_bool(is_dir)));
    method(&obj, "isFile", move |_| Ok(JsValue::from_bool(!is_dir)));
    obj.into()
}

fn names(entries: Vec<crate::vfs::DirEntry>) -> JsValue {
    entries
        .into_iter()
        .map(|e| JsValue::from_str(&e.name))
        .collect::<Array>()
        .into()
}

fn fs_shim(fs: &FsModule) -> JsValue {
    let obj = Object::new();

    let f = fs.clone();
    method(&obj, "readFileSync", move |args| {
        let p = string_arg(&args, 0)?;
        match encoding_arg(&args.get(1)) {
            Some(Encoding::Utf8) => f.read_to_string_sync(&p).map(|s| JsValue::from_str(&s)).map_err(throw),
            Some(encoding) => f
                .read_file_sync(&p)
                .map(|b| JsValue::from_str(&b.to_string(encoding)))
                .map_err(throw),
            None => f.read_file_sync(&p).map(|b| buffer_value(&b)).map_err(throw),
        }
    });
    let f = fs.clone();
    method(&obj, "writeFileSync", move |args| {
        let p = string_arg(&args, 0)?;
        f.write_file_sync(&p, &bytes_of(&args.get(1)))
            .map(|_| JsValue::UNDEFINED)
            .map_err(throw)
    });
    let f = fs.clone();
    method(&obj, "existsSync", move |args| Ok(JsValue::from_bool(f.exists_sync(&string_arg(&args, 0)?))));
    let f = fs.clone();
    method(&obj, "readdirSync", move |args| {
        f.readdir_sync(&string_arg(&args, 0)?).map(names).map_err(throw)
    });
    let f = fs.clone();
    method(&obj, "statSync", move |args| {
        f.stat_sync(&string_arg(&args, 0)?)
            .map(|m| metadata_value(&m))
            .map_err(throw)
    });
    let f = fs.clone();
    method(&obj, "mkdirSync", move |args| {
        f.mkdir_sync(&string_arg(&args, 0)?)
            .map(|_| JsValue::UNDEFINED)
            .map_err(throw)
    });
    for name in ["rmSync", "unlinkSync"] {
        let f = fs.clone();
        method(&obj, name, move |args| {
            f.rm_sync(&string_arg(&args, 0)?)
                .map(|_| JsValue::UNDEFINED)
                .map_err(throw)
        });
    }

    set(&obj, "promises", &fs_promises(fs));
    obj.into()
}

fn fs_promises(fs: &FsModule) -> JsValue {
    let obj = Object::new();

    let f = fs.clone();
    method(&obj, "readFile", move |args| {
        let p = string_arg(&args, 0)?;
        let encoding = encoding_arg(&args.get(1));
        let f = f.clone();
        Ok(promise(async move {
            let buf = f.read_file(&p).await?;
            Ok(match encoding {
                Some(encoding) => JsValue::from_str(&buf.to_string(encoding)),
                None => buffer_value(&buf),
            })
        }))
    });
    let f = fs.clone();
    method(&obj, "writeFile", move |args| {
        let p = string_arg(&args, 0)?;
        let data = bytes_of(&args.get(1));
        let f = f.clone();
        Ok(promise(async move { f.write_file(&p, &data).await.map(|_| JsValue::UNDEFINED) }))
    });
    let f = fs.clone();
    method(&obj, "readdir", move |args| {
        let p = string_arg(&args, 0)?;
        let f = f.clone();
        Ok(promise(async move { f.readdir(&p).await.map(names) }))
    });
    let f = fs.clone();
    method(&obj, "stat", move |args| {
        let p = string_arg(&args, 0)?;
        let f = f.clone();
        Ok(promise(async move { f.stat(&p).await.map(|m| metadata_value(&m)) }))
    });
    let f = fs.clone();
    method(&obj, "mkdir", move |args| {
        let p = string_arg(&args, 0)?;
        let f = f.clone();
        Ok(promise(async move { f.mkdir(&p).await.map(|_| JsValue::UNDEFINED) }))
    });
    for name in ["rm", "unlink"] {
        let f = fs.clone();
        method(&obj, name, move |args| {
            let p = string_arg(&args, 0)?;
            let f = f.clone();
            Ok(promise(async move { f.rm(&p).await.map(|_| JsValue::UNDEFINED) }))
        });
    }
    obj.into()
}

// ============================================================================
// http, https
// ============================================================================

fn headers_value(headers: &crate::kernel::protocol::Headers) -> JsValue {
    let obj = Object::new();
    for (name, value) in headers {
        set(&obj, name, &JsValue::from_str(value));
    }
    obj.into()
}

fn headers_from(value: &JsValue) -> crate::kernel::protocol::Headers {
    let mut headers = crate::kernel::protocol::Headers::new();
    if !value.is_object() {
        return headers;
    }
    for entry in Object::entries(value.unchecked_ref()).iter() {
        let pair = Array::from(&entry);
        if let Some(name) = pair.get(0).as_string() {
            headers.insert(name, format_arg(&pair.get(1)));
        }
    }
    headers
}

fn request_value(request: &IncomingRequest) -> JsValue {
    let obj = Object::new();
    set(&obj, "method", &JsValue::from_str(&request.method));
    set(&obj, "url", &JsValue::from_str(&request.url));
    set(&obj, "headers", &headers_value(&request.headers));
    set(&obj, "body", &JsValue::from_str(&request.text()));
    obj.into()
}

fn response_value(response: ServerResponse) -> JsValue {
    let obj = Object::new();
    set(&obj, "statusCode", &JsValue::from_f64(200.0));
    // `res.statusCode = n` is a plain property write; pick it up on output
    let sync_status = {
        let obj = obj.clone();
        let response = response.clone();
        move || {
            if let Some(code) = get(&obj, "statusCode").as_f64() {
                response.set_status(code as u16);
            }
        }
    };

    let r = response.clone();
    method(&obj, "setHeader", move |args| {
        r.set_header(&string_arg(&args, 0)?, &format_arg(&args.get(1)));
        Ok(JsValue::UNDEFINED)
    });
    let r = response.clone();
    method(&obj, "getHeader", move |args| {
        Ok(r.header(&string_arg(&args, 0)?)
            .map(|v| JsValue::from_str(&v))
            .unwrap_or(JsValue::UNDEFINED))
    });
    let (r, target) = (response.clone(), obj.clone());
    method(&obj, "writeHead", move |args| {
        let status = args.get(0).as_f64().unwrap_or(200.0);
        set(&target, "statusCode", &JsValue::from_f64(status));
        let headers = headers_from(&args.get(1));
        let pairs: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        r.write_head(status as u16, &pairs);
        Ok(target.clone().into())
    });
    let (r, sync) = (response.clone(), sync_status.clone());
    method(&obj, "write", move |args| {
        sync();
        Ok(JsValue::from_bool(r.write(Buffer::from(bytes_of(&args.get(0))))))
    });
    let (r, sync) = (response, sync_status);
    method(&obj, "end", move |args| {
        sync();
        let data = args.get(0);
        let chunk = if data.is_undefined() || data.is_null() {
            None
        } else {
            Some(Buffer::from(bytes_of(&data)))
        };
        r.end(chunk);
        Ok(JsValue::UNDEFINED)
    });
    obj.into()
}

fn server_value(server: HttpServer) -> JsValue {
    let obj = Object::new();
    let (s, target) = (server.clone(), obj.clone());
    method(&obj, "listen", move |args| {
        let port = args.get(0).as_f64().unwrap_or(0.0) as u16;
        if let Some(f) = args.iter().skip(1).find_map(|a| a.dyn_into::<Function>().ok()) {
            s.on("listening", listener(f));
        }
        s.listen(port);
        Ok(target.clone().into())
    });
    let s = server.clone();
    method(&obj, "close", move |_| {
        s.close();
        Ok(JsValue::UNDEFINED)
    });
    let s = server.clone();
    method(&obj, "address", move |_| {
        Ok(match s.address() {
            Some(port) => {
                let addr = Object::new();
                set(&addr, "port", &JsValue::from_f64(port as f64));
                addr.into()
            }
            None => JsValue::NULL,
        })
    });
    let (s, target) = (server, obj.clone());
    method(&obj, "on", move |args| {
        let event = string_arg(&args, 0)?;
        if let Some(f) = function_arg(&args, 1) {
            s.on(&event, listener(f));
        }
        Ok(target.clone().into())
    });
    obj.into()
}

fn fetch_response_value(response: &FetchResponse) -> JsValue {
    let obj = Object::new();
    set(&obj, "status", &JsValue::from_f64(response.status as f64));
    set(&obj, "statusCode", &JsValue::from_f64(response.status as f64));
    set(&obj, "ok", &JsValue::from_bool(response.is_ok()));
    set(&obj, "headers", &headers_value(&response.headers));
    set(
        &obj,
        "body",
        &JsValue::from_str(&String::from_utf8_lossy(&response.body)),
    );
    obj.into()
}

/// Method, headers and body from a request options object
fn request_from(url: &str, options: &JsValue) -> FetchRequest {
    let mut request = FetchRequest::get(url);
    if !options.is_object() {
        return request;
    }
    if let Some(method) = get(options, "method").as_string() {
        request = request.method(&method);
    }
    request.headers = headers_from(&get(options, "headers"));
    let body = get(options, "body");
    if !body.is_undefined() && !body.is_null() {
        request = request.body(bytes_of(&body));
    }
    request
}

fn url_of(target: &JsValue) -> Option<String> {
    target.as_string().or_else(|| get(target, "url").as_string())
}

/// `request(url | options, [callback])`, settled with the whole response
fn outbound(http: &HttpModule, args: &Array) -> Result<JsValue, JsValue> {
    let target = args.get(0);
    let url = url_of(&target).ok_or_else(|| throw("request needs a url"))?;
    let callback = function_arg(args, 1);
    let pending = http.request(request_from(&url, &target));
    Ok(promise(async move {
        let response = fetch_response_value(&pending.await?);
        if let Some(f) = callback {
            f.call1(&JsValue::NULL, &response).map_err(|e| script_error(e).message)?;
        }
        Ok(response)
    }))
}

/// The module-level `fetch(url, init)`; every call is a `net-fetch` syscall
fn fetch_fn(fetcher: &Fetcher) -> JsValue {
    let fetcher = fetcher.clone();
    native(move |args| {
        let target = args.get(0);
        let url = url_of(&target).ok_or_else(|| throw("fetch needs a url"))?;
        let init = args.get(1);
        let options = if init.is_object() { init } else { target };
        let pending = fetcher.fetch(request_from(&url, &options));
        Ok(promise(async move { Ok(body_methods(pending.await?)) }))
    })
}

/// A Response-like object: the plain fields plus `text`, `json`, `arrayBuffer`
fn body_methods(response: FetchResponse) -> JsValue {
    let obj: Object = fetch_response_value(&response).unchecked_into();
    let body = Rc::new(response.body);

    let b = body.clone();
    method(&obj, "text", move |_| {
        Ok(js_sys::Promise::resolve(&JsValue::from_str(&String::from_utf8_lossy(&b))).into())
    });
    let b = body.clone();
    method(&obj, "json", move |_| {
        let parsed = match js_sys::JSON::parse(&String::from_utf8_lossy(&b)) {
            Ok(value) => js_sys::Promise::resolve(&value),
            Err(e) => js_sys::Promise::reject(&e),
        };
        Ok(parsed.into())
    });
    let b = body;
    method(&obj, "arrayBuffer", move |_| {
        Ok(js_sys::Promise::resolve(&Uint8Array::from(&b[..]).buffer()).into())
    });
    obj.into()
}

fn http_shim(http: &HttpModule) -> JsValue {
    let obj = Object::new();
    let h = http.clone();
    method(&obj, "createServer", move |args| {
        let handler = args
            .iter()
            .find_map(|a| a.dyn_into::<Function>().ok())
            .ok_or_else(|| throw("createServer needs a request handler"))?;
        let server = h.create_server(move |request: IncomingRequest, response: ServerResponse| {
            handler
                .call2(&JsValue::NULL, &request_value(&request), &response_value(response))
                .map(|_| ())
                .map_err(script_error)
        });
        Ok(server_value(server))
    });
    for name in ["request", "get"] {
        let h = http.clone();
        method(&obj, name, move |args| outbound(&h, &args));
    }
    obj.into()
}

// ============================================================================
// net, tls
// ============================================================================

fn socket_value(socket: VirtualSocket) -> JsValue {
    let obj = Object::new();
    set(&obj, "remoteAddress", &JsValue::from_str(socket.host()));
    set(&obj, "remotePort", &JsValue::from_f64(socket.port() as f64));
    set(&obj, "encrypted", &JsValue::from_bool(socket.is_tls()));

    let (s, target) = (socket.clone(), obj.clone());
    method(&obj, "on", move |args| {
        let event = string_arg(&args, 0)?;
        if let Some(f) = function_arg(&args, 1) {
            s.on(&event, listener(f));
        }
        Ok(target.clone().into())
    });
    let s = socket.clone();
    method(&obj, "write", move |args| Ok(JsValue::from_bool(s.write(&bytes_of(&args.get(0))))));
    let s = socket.clone();
    method(&obj, "end", move |args| {
        let data = args.get(0);
        if !data.is_undefined() {
            s.write(&bytes_of(&data));
        }
        s.end();
        Ok(JsValue::UNDEFINED)
    });
    let s = socket;
    method(&obj, "destroy", move |_| {
        s.destroy();
        Ok(JsValue::UNDEFINED)
    });
    obj.into()
}

/// `connect(port, host)` or `connect({ host, port, servername, rejectUnauthorized })`
fn connect_options(args: &Array) -> Result<ConnectOptions, JsValue> {
    let first = args.get(0);
    if let Some(port) = first.as_f64() {
        let host = args.get(1).as_string().unwrap_or_else(|| "localhost".to_string());
        return Ok(ConnectOptions::new(&host, port as u16));
    }
    let port = get(&first, "port")
        .as_f64()
        .ok_or_else(|| throw("connect needs a port"))?;
    let host = get(&first, "host").as_string().unwrap_or_else(|| "localhost".to_string());
    let mut options = ConnectOptions::new(&host, port as u16);
    options.server_name = get(&first, "servername").as_string();
    options.insecure = get(&first, "rejectUnauthorized").as_bool() == Some(false);
    Ok(options)
}

fn net_shim(net: &NetModule) -> JsValue {
    let obj = Object::new();
    for name in ["connect", "createConnection"] {
        let n = net.clone();
        method(&obj, name, move |args| {
            let socket = n.connect(connect_options(&args)?);
            if let Some(f) = args.iter().find_map(|a| a.dyn_into::<Function>().ok()) {
                socket.on("connect", listener(f));
            }
            Ok(socket_value(socket))
        });
    }
    obj.into()
}

fn builtin_shim(builtin: &Builtin) -> JsValue {
    match builtin {
        Builtin::Fs(fs) => fs_shim(fs),
        Builtin::Path(path) => path_shim(path),
        Builtin::Http(http) | Builtin::Https(http) => http_shim(http),
        Builtin::Net(net) | Builtin::Tls(net) => net_shim(net),
        Builtin::Events(_) => events_shim(),
        Builtin::Buffer(_) => {
            let obj = Object::new();
            set(&obj, "Buffer", &buffer_shim());
            obj.into()
        }
        Builtin::Process(process) => process_shim(process),
        Builtin::Tty(tty) => tty_shim(*tty),
        Builtin::Url(url) => url_shim(*url),
        Builtin::Os(os) => os_shim(os),
    }
}
