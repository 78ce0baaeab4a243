//! Web Worker execution contexts
//!
//! One dedicated module worker per process. The worker script is generated
//! at spawn time: it loads this crate's own wasm-bindgen glue, buffers any
//! message that arrives before the module is ready and hands everything to
//! `sandbox_start`. Messages cross the boundary as JSON text.

#![cfg(target_arch = "wasm32")]

use super::context::{ContextFactory, ContextOptions, ExecutionContext};
use super::error::{KernelError, KernelResult};
use super::process::Pid;
use super::protocol::{self, FromContext, ToContext};
use crate::console_log;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;

/// Body of the generated worker module
fn worker_source(glue_url: &str, pid: u32, name: &str, config: &str) -> Result<String, String> {
    let quote = |s: &str| serde_json::to_string(s).map_err(|e| e.to_string());
    Ok(format!(
        "import init, {{ sandbox_start }} from {glue};\n\
         const queued = [];\n\
         self.onmessage = (e) => queued.push(e.data);\n\
         await init();\n\
         sandbox_start({pid}, {name}, {config}, queued);\n",
        glue = quote(glue_url)?,
        pid = pid,
        name = quote(name)?,
        config = quote(config)?,
    ))
}

/// A process running in its own Web Worker
pub struct WorkerContext {
    pid: Pid,
    worker: Option<web_sys::Worker>,
    script_url: String,
    inbox: Rc<RefCell<Vec<String>>>,
    crashed: Rc<Cell<bool>>,
    _onmessage: Closure<dyn FnMut(web_sys::MessageEvent)>,
    _onerror: Closure<dyn FnMut(web_sys::ErrorEvent)>,
}

impl WorkerContext {
    fn spawn(pid: Pid, glue_url: &str, options: &ContextOptions) -> KernelResult<Self> {
        let context = |e: String| KernelError::Context(e);
        let config = options.config.to_json().map_err(|e| context(e.to_string()))?;
        let source = worker_source(glue_url, pid.0, &options.name, &config).map_err(context)?;

        let bag = web_sys::BlobPropertyBag::new();
        bag.set_type("text/javascript");
        let parts = js_sys::Array::of1(&JsValue::from_str(&source));
        let blob = web_sys::Blob::new_with_str_sequence_and_options(&parts, &bag)
            .map_err(|e| context(format!("worker blob: {:?}", e)))?;
        let script_url = web_sys::Url::create_object_url_with_blob(&blob)
            .map_err(|e| context(format!("worker url: {:?}", e)))?;

        let opts = web_sys::WorkerOptions::new();
        opts.set_type(web_sys::WorkerType::Module);
        opts.set_name(&format!("pid-{}", pid.0));
        let worker = web_sys::Worker::new_with_options(&script_url, &opts)
            .map_err(|e| context(format!("worker start: {:?}", e)))?;

        let inbox = Rc::new(RefCell::new(Vec::new()));
        let sink = inbox.clone();
        let onmessage = Closure::wrap(Box::new(move |e: web_sys::MessageEvent| match e.data().as_string() {
            Some(text) => sink.borrow_mut().push(text),
            None => console_log!("[pid {}] dropped non-text message", pid.0),
        }) as Box<dyn FnMut(_)>);
        worker.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));

        let crashed = Rc::new(Cell::new(false));
        let flag = crashed.clone();
        let onerror = Closure::wrap(Box::new(move |e: web_sys::ErrorEvent| {
            console_log!("[pid {}] worker error: {}", pid.0, e.message());
            flag.set(true);
        }) as Box<dyn FnMut(_)>);
        worker.set_onerror(Some(onerror.as_ref().unchecked_ref()));

        Ok(Self {
            pid,
            worker: Some(worker),
            script_url,
            inbox,
            crashed,
            _onmessage: onmessage,
            _onerror: onerror,
        })
    }

    fn post_text(&self, text: &str) {
        if let Some(worker) = &self.worker
            && let Err(e) = worker.post_message(&JsValue::from_str(text))
        {
            console_log!("[pid {}] post failed: {:?}", self.pid.0, e);
        }
    }
}

impl ExecutionContext for WorkerContext {
    fn post(&mut self, message: ToContext) {
        match protocol::encode(&message) {
            Ok(text) => self.post_text(&text),
            Err(e) => console_log!("[pid {}] {} not sent: {}", self.pid.0, message.kind(), e),
        }
    }

    fn poll(&mut self) -> Vec<FromContext> {
        let raw: Vec<String> = self.inbox.borrow_mut().drain(..).collect();
        let mut messages = Vec::with_capacity(raw.len());
        for text in raw {
            match protocol::decode_from_context(&text) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    console_log!("[pid {}] {}", self.pid.0, e);
                    if let Some(reply) = protocol::rejection(&text, &e) {
                        self.post(reply);
                    }
                }
            }
        }
        messages
    }

    fn terminate(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.set_onmessage(None);
            worker.set_onerror(None);
            worker.terminate();
            let _ = web_sys::Url::revoke_object_url(&self.script_url);
        }
        self.inbox.borrow_mut().clear();
    }

    fn is_alive(&self) -> bool {
        self.worker.is_some() && !self.crashed.get()
    }
}

impl Drop for WorkerContext {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Starts one module worker per process
pub struct WorkerFactory {
    /// URL of the wasm-bindgen glue module (`--target web`)
    glue_url: String,
}

impl WorkerFactory {
    pub fn new(glue_url: &str) -> Self {
        Self {
            glue_url: glue_url.to_string(),
        }
    }
}

impl ContextFactory for WorkerFactory {
    fn create(&self, pid: Pid, options: &ContextOptions) -> KernelResult<Box<dyn ExecutionContext>> {
        Ok(Box::new(WorkerContext::spawn(pid, &self.glue_url, options)?))
    }
}
