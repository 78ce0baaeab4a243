//! Development server for cinder
//!
//! A minimal static file server. Every response carries the cross-origin
//! isolation headers module workers need. No dependencies beyond
//! tiny_http.

use std::fs;
use std::path::Path;
use tiny_http::{Header, Response, Server};

const DEFAULT_PORT: u16 = 8080;

/// Sent with every file
const ISOLATION: [(&str, &str); 2] = [
    ("Cross-Origin-Opener-Policy", "same-origin"),
    ("Cross-Origin-Embedder-Policy", "require-corp"),
];

fn main() {
    let port = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let addr = format!("0.0.0.0:{}", port);
    let server = match Server::http(&addr) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Failed to start server on {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    println!("cinder dev server on http://localhost:{}", port);

    for request in server.incoming_requests() {
        let url_path = request.url().split(['?', '#']).next().unwrap_or("/").to_string();
        let file_path = if url_path == "/" {
            "index.html".to_string()
        } else {
            url_path.trim_start_matches('/').to_string()
        };

        let response = serve_file(&file_path);
        if let Err(e) = request.respond(response) {
            eprintln!("{}: {}", url_path, e);
        }
    }
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

fn serve_file(path: &str) -> Response<std::io::Cursor<Vec<u8>>> {
    let path = Path::new(path);
    // No escaping the served directory
    let escapes = path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir));

    let (response, mime) = match fs::read(path) {
        Ok(contents) if !escapes => (Response::from_data(contents), mime_type(path)),
        _ => (
            Response::from_string("404 Not Found").with_status_code(404),
            "text/plain",
        ),
    };

    ISOLATION
        .iter()
        .chain(std::iter::once(&("Content-Type", mime)))
        .filter_map(|(name, value)| header(name, value))
        .fold(response, |response, h| response.with_header(h))
}

fn mime_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") | Some("mjs") => "application/javascript",
        Some("wasm") => "application/wasm",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_response_is_cross_origin_isolated() {
        for path in ["missing.html", "../Cargo.toml"] {
            let response = serve_file(path);
            assert_eq!(response.status_code().0, 404);
            for (name, value) in ISOLATION {
                assert!(
                    response
                        .headers()
                        .iter()
                        .any(|h| h.field.equiv(name) && h.value.as_str() == value)
                );
            }
        }
        assert_eq!(mime_type(Path::new("pkg/cinder_bg.wasm")), "application/wasm");
    }
}
