//! Worker entry point
//!
//! The generated worker module calls `sandbox_start` once the wasm module
//! is ready. From then on every message from the supervisor is handled in
//! arrival order, and a short interval keeps timers, JS-side promise
//! completions and syscall timeouts moving between messages.

#![cfg(target_arch = "wasm32")]

use super::{Sandbox, SandboxOptions};
use crate::config::KernelConfig;
use crate::console_log;
use crate::kernel::protocol;
use crate::loader::js::JsEngine;
use std::cell::RefCell;
use std::rc::Rc;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;

/// Milliseconds between housekeeping turns
const TURN_INTERVAL_MS: i32 = 16;

thread_local! {
    static SANDBOX: RefCell<Option<Sandbox>> = const { RefCell::new(None) };
}

fn global() -> Result<web_sys::DedicatedWorkerGlobalScope, JsValue> {
    js_sys::global()
        .dyn_into::<web_sys::DedicatedWorkerGlobalScope>()
        .map_err(|_| JsValue::from_str("sandbox_start must run in a dedicated worker"))
}

/// Bring up the sandbox for process `pid` and replay what arrived early
#[wasm_bindgen]
pub fn sandbox_start(pid: u32, name: String, config: String, queued: js_sys::Array) -> Result<(), JsValue> {
    let scope = global()?;
    let config = KernelConfig::from_json(&config).map_err(|e| JsValue::from_str(&e.to_string()))?;
    let sandbox = Sandbox::new(SandboxOptions { pid, name, config }, Rc::new(JsEngine::new()));
    SANDBOX.with(|slot| *slot.borrow_mut() = Some(sandbox));

    let onmessage = Closure::wrap(Box::new(move |e: web_sys::MessageEvent| {
        receive(e.data());
    }) as Box<dyn FnMut(_)>);
    scope.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));
    onmessage.forget(); // Lives as long as the worker

    for message in queued.iter() {
        receive(message);
    }

    let interval = Closure::wrap(Box::new(turn) as Box<dyn FnMut()>);
    scope.set_interval_with_callback_and_timeout_and_arguments_0(
        interval.as_ref().unchecked_ref(),
        TURN_INTERVAL_MS,
    )?;
    interval.forget();

    console_log!("[pid {}] sandbox up", pid);
    Ok(())
}

fn receive(data: JsValue) {
    let Some(text) = data.as_string() else {
        console_log!("[sandbox] dropped non-text message");
        return;
    };
    match protocol::decode_to_context(&text) {
        Ok(message) => SANDBOX.with(|slot| {
            if let Some(sandbox) = slot.borrow_mut().as_mut() {
                sandbox.handle(message);
            }
        }),
        Err(e) => console_log!("[sandbox] {}", e),
    }
    turn();
}

/// Advance the clock, run ready work and ship the outbox
fn turn() {
    let outgoing = SANDBOX.with(|slot| {
        let mut slot = slot.borrow_mut();
        let Some(sandbox) = slot.as_mut() else {
            return Vec::new();
        };
        sandbox.tick(js_sys::Date::now());
        sandbox.run_tasks();
        sandbox.take_outbox()
    });
    if outgoing.is_empty() {
        return;
    }

    let Ok(scope) = global() else {
        return;
    };
    for message in outgoing {
        match protocol::encode(&message) {
            Ok(text) => {
                if let Err(e) = scope.post_message(&JsValue::from_str(&text)) {
                    console_log!("[sandbox] post failed: {:?}", e);
                }
            }
            Err(e) => console_log!("[sandbox] encode failed: {}", e),
        }
    }
}
