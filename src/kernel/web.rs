//! Browser network plumbing
//!
//! - `WebSocketTransport`: the relay pipe behind `RelayNetwork`
//! - `browser_fetch`: a direct Fetch API request, used only for the
//!   unmediated fallback when a host enables it
//!
//! Limitations (browser sandbox):
//! - No raw TCP; sockets go through the relay
//! - Direct fetches are subject to CORS

#![cfg(target_arch = "wasm32")]

use super::netbridge::RelayTransport;
use super::protocol::{FetchRequest, FetchResponse, Headers};
use crate::console_log;
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::JsFuture;

#[wasm_bindgen]
extern "C" {
    /// `fetch` on whatever global this runs in (page or worker)
    #[wasm_bindgen(js_name = fetch)]
    fn global_fetch(request: &web_sys::Request) -> js_sys::Promise;
}

// ============================================================================
// Relay transport
// ============================================================================

/// Connection state of the relay socket
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WsState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// WebSocket to the relay server
///
/// Messages sent while the socket is still connecting are queued and
/// flushed once it opens. Incoming text frames are buffered until `recv`.
pub struct WebSocketTransport {
    ws: web_sys::WebSocket,
    inbound: Rc<RefCell<VecDeque<String>>>,
    outbound: VecDeque<String>,
    // Kept alive for the socket's lifetime
    _onmessage: Closure<dyn FnMut(web_sys::MessageEvent)>,
    _onerror: Closure<dyn FnMut(web_sys::ErrorEvent)>,
    _onclose: Closure<dyn FnMut(web_sys::CloseEvent)>,
}

impl WebSocketTransport {
    pub fn connect(url: &str) -> Result<Self, String> {
        let ws = web_sys::WebSocket::new(url)
            .map_err(|e| format!("WebSocket creation failed: {:?}", e))?;

        let inbound = Rc::new(RefCell::new(VecDeque::new()));
        let sink = inbound.clone();
        let onmessage = Closure::wrap(Box::new(move |e: web_sys::MessageEvent| {
            match e.data().dyn_into::<js_sys::JsString>() {
                Ok(text) => sink.borrow_mut().push_back(String::from(text)),
                Err(_) => console_log!("[relay] dropped non-text frame"),
            }
        }) as Box<dyn FnMut(_)>);
        ws.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));

        let onerror = Closure::wrap(Box::new(move |_e: web_sys::ErrorEvent| {
            console_log!("[relay] error");
        }) as Box<dyn FnMut(_)>);
        ws.set_onerror(Some(onerror.as_ref().unchecked_ref()));

        let onclose = Closure::wrap(Box::new(move |e: web_sys::CloseEvent| {
            console_log!("[relay] closed ({})", e.code());
        }) as Box<dyn FnMut(_)>);
        ws.set_onclose(Some(onclose.as_ref().unchecked_ref()));

        Ok(Self {
            ws,
            inbound,
            outbound: VecDeque::new(),
            _onmessage: onmessage,
            _onerror: onerror,
            _onclose: onclose,
        })
    }

    pub fn state(&self) -> WsState {
        match self.ws.ready_state() {
            web_sys::WebSocket::CONNECTING => WsState::Connecting,
            web_sys::WebSocket::OPEN => WsState::Open,
            web_sys::WebSocket::CLOSING => WsState::Closing,
            _ => WsState::Closed,
        }
    }

    fn flush(&mut self) -> Result<(), String> {
        while let Some(text) = self.outbound.front() {
            self.ws
                .send_with_str(text)
                .map_err(|e| format!("Send failed: {:?}", e))?;
            self.outbound.pop_front();
        }
        Ok(())
    }
}

impl RelayTransport for WebSocketTransport {
    fn send(&mut self, text: &str) -> Result<(), String> {
        match self.state() {
            WsState::Connecting => {
                self.outbound.push_back(text.to_string());
                Ok(())
            }
            WsState::Open => {
                self.outbound.push_back(text.to_string());
                self.flush()
            }
            WsState::Closing | WsState::Closed => Err("relay connection closed".to_string()),
        }
    }

    fn recv(&mut self) -> Vec<String> {
        if self.state() == WsState::Open
            && let Err(e) = self.flush()
        {
            console_log!("[relay] {}", e);
        }
        self.inbound.borrow_mut().drain(..).collect()
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.ws.set_onmessage(None);
        self.ws.set_onerror(None);
        self.ws.set_onclose(None);
        let _ = self.ws.close();
    }
}

// ============================================================================
// Direct fetch
// ============================================================================

/// Perform `request` with the Fetch API of the current global
pub fn browser_fetch(request: FetchRequest) -> LocalBoxFuture<'static, Result<FetchResponse, String>> {
    send(request).boxed_local()
}

async fn send(request: FetchRequest) -> Result<FetchResponse, String> {
    let opts = web_sys::RequestInit::new();
    opts.set_method(&request.method);
    opts.set_mode(web_sys::RequestMode::Cors);
    if let Some(body) = &request.body {
        let bytes = js_sys::Uint8Array::from(body.as_slice());
        opts.set_body(&bytes);
    }

    let req = web_sys::Request::new_with_str_and_init(&request.url, &opts)
        .map_err(|e| format!("Failed to create request: {:?}", e))?;
    for (name, value) in &request.headers {
        req.headers()
            .set(name, value)
            .map_err(|e| format!("Failed to set header: {:?}", e))?;
    }

    let resp_value = JsFuture::from(global_fetch(&req))
        .await
        .map_err(|e| format!("Fetch failed: {:?}", e))?;
    let resp: web_sys::Response = resp_value
        .dyn_into()
        .map_err(|_| "Failed to cast response".to_string())?;

    let headers = read_headers(&resp.headers());
    let array_buffer = JsFuture::from(
        resp.array_buffer()
            .map_err(|e| format!("Failed to get body: {:?}", e))?,
    )
    .await
    .map_err(|e| format!("Failed to read body: {:?}", e))?;

    Ok(FetchResponse {
        status: resp.status(),
        headers,
        body: js_sys::Uint8Array::new(&array_buffer).to_vec(),
    })
}

/// Every `[name, value]` pair the response exposes
fn read_headers(headers: &web_sys::Headers) -> Headers {
    let mut out = Headers::new();
    let Ok(Some(entries)) = js_sys::try_iter(headers) else {
        return out;
    };
    for entry in entries.flatten() {
        let pair: js_sys::Array = entry.unchecked_into();
        if let (Some(name), Some(value)) = (pair.get(0).as_string(), pair.get(1).as_string()) {
            out.insert(name, value);
        }
    }
    out
}
