//! Browser runtime integration
//!
//! requestAnimationFrame drives the supervisor: every frame advances its
//! clock and pumps messages until it is idle. Nothing else runs the
//! supervisor on the page.

use crate::console_log;
use crate::kernel::Supervisor;
use std::cell::RefCell;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;

/// State for the animation frame loop
struct RuntimeState {
    /// Callback for requestAnimationFrame (stored to prevent GC)
    frame_closure: Option<Closure<dyn FnMut(f64)>>,
    running: bool,
    frame_count: u64,
}

thread_local! {
    static STATE: RefCell<RuntimeState> = RefCell::new(RuntimeState {
        frame_closure: None,
        running: false,
        frame_count: 0,
    });

    /// The page's one supervisor
    pub static SUPERVISOR: RefCell<Option<Supervisor>> = const { RefCell::new(None) };
}

/// Run `f` against the supervisor, if one is booted
pub fn with_supervisor<R>(f: impl FnOnce(&mut Supervisor) -> R) -> Option<R> {
    SUPERVISOR.with(|slot| slot.borrow_mut().as_mut().map(f))
}

/// Start the runtime loop
pub fn start() {
    let already = STATE.with(|state| {
        let mut state = state.borrow_mut();
        std::mem::replace(&mut state.running, true)
    });
    if already {
        console_log!("[runtime] Already running");
        return;
    }

    console_log!("[runtime] Starting frame loop...");
    request_animation_frame();
}

/// Stop the runtime loop
pub fn stop() {
    STATE.with(|state| {
        state.borrow_mut().running = false;
    });
    console_log!("[runtime] Stopped");
}

fn request_animation_frame() {
    let Some(window) = web_sys::window() else {
        console_log!("[runtime] No window object");
        return;
    };

    let closure = Closure::wrap(Box::new(move |timestamp: f64| {
        frame_tick(timestamp);
    }) as Box<dyn FnMut(f64)>);

    STATE.with(|state| {
        let mut state = state.borrow_mut();
        let _ = window.request_animation_frame(closure.as_ref().unchecked_ref());
        state.frame_closure = Some(closure);
    });
}

/// Called every frame by requestAnimationFrame
fn frame_tick(timestamp: f64) {
    let should_continue = STATE.with(|state| {
        let mut state = state.borrow_mut();
        if !state.running {
            return false;
        }
        state.frame_count += 1;
        true
    });

    if !should_continue {
        return;
    }

    with_supervisor(|supervisor| {
        supervisor.tick(timestamp);
        supervisor.run_until_idle();
    });

    request_animation_frame();
}

/// Frames run since `start`
pub fn frame_count() -> u64 {
    STATE.with(|state| state.borrow().frame_count)
}
