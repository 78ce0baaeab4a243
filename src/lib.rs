//! cinder - the process kernel of a browser-hosted OS
//!
//! Two halves talk only through messages:
//! - the supervisor (`kernel`) owns the process table, the port bindings and
//!   every privileged resource (filesystem, network)
//! - each execution context runs a `sandbox`: emulated process globals, a
//!   module loader and a virtual network stack whose I/O is done by the
//!   supervisor
//!
//! Platform support:
//! - Browser (wasm32-unknown-unknown): one Web Worker per process, relay
//!   WebSocket for egress
//! - Native: in-process contexts, used by tests and embedders

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

pub mod config;
pub mod kernel;
pub mod loader;
pub mod sandbox;
pub mod vfs;

#[cfg(target_arch = "wasm32")]
mod boot;

#[cfg(target_arch = "wasm32")]
mod runtime;

pub use config::KernelConfig;

/// Initialize panic hook for better error messages in browser console
#[cfg(target_arch = "wasm32")]
fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// Module start. Runs in the page and in every worker; the page additionally
/// calls `boot`, workers call `sandbox_start`.
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(start)]
pub fn main() {
    init_panic_hook();
}

/// Console logging helper
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = console)]
    fn log(s: &str);
}

/// Log to browser console (WASM)
#[cfg(target_arch = "wasm32")]
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        $crate::log(&format!($($t)*))
    };
}

/// Log to stderr (native)
#[cfg(not(target_arch = "wasm32"))]
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        eprintln!($($t)*)
    };
}
