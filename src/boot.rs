//! Boot sequence and page exports
//!
//! `boot` builds the page's supervisor (Worker contexts, an in-memory
//! filesystem, console output, relay egress when configured) and starts the
//! frame loop. The remaining exports are the host-facing operations a UI
//! needs: spawn, kill, input, files and loopback requests.

use crate::config::KernelConfig;
use crate::console_log;
use crate::kernel::netbridge::RelayNetwork;
use crate::kernel::web::WebSocketTransport;
use crate::kernel::worker::WorkerFactory;
use crate::kernel::{ConsoleSink, FetchRequest, Pid, Supervisor, WindowId};
use crate::runtime;
use crate::vfs::{self, FileSystem, MemoryFs, path};
use serde_json::json;
use std::rc::Rc;
use wasm_bindgen::prelude::*;

fn js_error(e: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&e.to_string())
}

fn supervisor<R>(f: impl FnOnce(&mut Supervisor) -> R) -> Result<R, JsValue> {
    runtime::with_supervisor(f).ok_or_else(|| js_error("kernel not booted"))
}

/// Boot the kernel
///
/// `glue_url` is this crate's wasm-bindgen module, loaded by every worker.
/// `config` is an optional JSON `KernelConfig`; `relay_url` enables network
/// egress through a relay server.
#[wasm_bindgen]
pub fn boot(glue_url: String, config: Option<String>, relay_url: Option<String>) -> Result<(), JsValue> {
    let config = match config {
        Some(text) => KernelConfig::from_json(&text).map_err(js_error)?,
        None => KernelConfig::default(),
    };

    let mut fs = MemoryFs::new();
    init_filesystem(&mut fs, &config).map_err(js_error)?;

    let mut kernel = Supervisor::new(
        config,
        Box::new(WorkerFactory::new(&glue_url)),
        Box::new(fs),
        Rc::new(ConsoleSink),
    );
    if let Some(url) = relay_url {
        let transport = WebSocketTransport::connect(&url).map_err(js_error)?;
        kernel = kernel.with_network(Box::new(RelayNetwork::new(transport)));
        console_log!("[boot] egress via {}", url);
    }

    runtime::SUPERVISOR.with(|slot| *slot.borrow_mut() = Some(kernel));
    runtime::start();
    Ok(())
}

/// Home and temp directories every process expects
fn init_filesystem(fs: &mut MemoryFs, config: &KernelConfig) -> std::io::Result<()> {
    let home = config.env.get("HOME").map(String::as_str).unwrap_or("/home/user");
    vfs::create_dir_all(fs, home)?;
    vfs::create_dir_all(fs, "/tmp")?;
    vfs::create_dir_all(fs, "/etc")?;
    fs.write_file("/etc/version", concat!("cinder ", env!("CARGO_PKG_VERSION"), "\n").as_bytes())
}

/// Stop the frame loop; processes stay registered
#[wasm_bindgen]
pub fn shutdown() {
    runtime::stop();
}

/// Spawn `source` as the main module at `path`; returns the pid
#[wasm_bindgen]
pub fn spawn_process(source: String, path: String) -> Result<u32, JsValue> {
    supervisor(|k| k.spawn(&source, &path))?
        .map(|pid| pid.0)
        .map_err(js_error)
}

#[wasm_bindgen]
pub fn kill_process(pid: u32) -> Result<(), JsValue> {
    supervisor(|k| k.kill(Pid(pid)))
}

/// Keyboard input for a process's stdin
#[wasm_bindgen]
pub fn send_input(pid: u32, data: String) -> Result<(), JsValue> {
    supervisor(|k| k.send_input(Pid(pid), &data))?.map_err(js_error)
}

/// Associate a process with a UI window
#[wasm_bindgen]
pub fn attach_window(pid: u32, window: u64) -> Result<(), JsValue> {
    supervisor(|k| k.attach_window(Pid(pid), WindowId(window)))?.map_err(js_error)
}

/// Write a file into the host filesystem, creating parent directories.
/// Processes spawned afterwards see it.
#[wasm_bindgen]
pub fn write_file(file: String, content: Vec<u8>) -> Result<(), JsValue> {
    supervisor(|k| {
        let fs = k.fs_mut();
        vfs::create_dir_all(fs, &path::dirname(&file))?;
        fs.write_file(&file, &content)
    })?
    .map_err(js_error)
}

/// JSON array describing every registered process
#[wasm_bindgen]
pub fn list_processes() -> Result<String, JsValue> {
    let listing = supervisor(|k| {
        k.list()
            .into_iter()
            .map(|info| {
                json!({
                    "pid": info.pid.0,
                    "name": info.name,
                    "status": info.status.to_string(),
                    "startedAt": info.started_at,
                    "ports": info.ports,
                    "window": info.window.map(|w| w.0),
                })
            })
            .collect::<Vec<_>>()
    })?;
    Ok(json!({ "frames": runtime::frame_count(), "processes": listing }).to_string())
}

/// Loopback HTTP GET against a port served by a process; resolves to
/// `{ status, headers, body }`
#[wasm_bindgen]
pub fn loopback_fetch(url: String) -> Result<js_sys::Promise, JsValue> {
    let call = supervisor(|k| k.fetch(FetchRequest::get(&url)))?;
    Ok(wasm_bindgen_futures::future_to_promise(async move {
        let response = call.await.map_err(js_error)?;
        let body = String::from_utf8_lossy(&response.body).into_owned();
        let value = json!({
            "status": response.status,
            "headers": response.headers,
            "body": body,
        });
        js_sys::JSON::parse(&value.to_string())
    }))
}
