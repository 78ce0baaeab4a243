//! Built-in module registry
//!
//! Every built-in is a concrete Rust type; `require("http")` hands back
//! `Builtin::Http(HttpModule)` and callers match on it. The sandbox decides
//! how each facility is wired through `BuiltinProvider`.

use crate::sandbox::bootstrap::{OsModule, ProcessObject, TtyModule};
use crate::sandbox::buffer::BufferModule;
use crate::sandbox::events::EventEmitter;
use crate::sandbox::fs::FsModule;
use crate::sandbox::net::{HttpModule, NetModule};
use crate::vfs::path;
use regex::Regex;
use std::sync::LazyLock;

/// Prefix reserved for built-ins, stripped before lookup
pub const RESERVED_PREFIX: &str = "node:";

/// Names of the built-in modules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinModule {
    Fs,
    Path,
    Http,
    Https,
    Net,
    Tls,
    Events,
    Buffer,
    Process,
    Tty,
    Url,
    Os,
}

impl BuiltinModule {
    pub const ALL: [BuiltinModule; 12] = [
        BuiltinModule::Fs,
        BuiltinModule::Path,
        BuiltinModule::Http,
        BuiltinModule::Https,
        BuiltinModule::Net,
        BuiltinModule::Tls,
        BuiltinModule::Events,
        BuiltinModule::Buffer,
        BuiltinModule::Process,
        BuiltinModule::Tty,
        BuiltinModule::Url,
        BuiltinModule::Os,
    ];

    /// Look up a specifier, with or without the reserved prefix
    pub fn parse(specifier: &str) -> Option<Self> {
        let name = specifier.strip_prefix(RESERVED_PREFIX).unwrap_or(specifier);
        match name {
            "fs" | "fs/promises" => Some(BuiltinModule::Fs),
            "path" | "path/posix" => Some(BuiltinModule::Path),
            "http" => Some(BuiltinModule::Http),
            "https" => Some(BuiltinModule::Https),
            "net" => Some(BuiltinModule::Net),
            "tls" => Some(BuiltinModule::Tls),
            "events" => Some(BuiltinModule::Events),
            "buffer" => Some(BuiltinModule::Buffer),
            "process" => Some(BuiltinModule::Process),
            "tty" => Some(BuiltinModule::Tty),
            "url" => Some(BuiltinModule::Url),
            "os" => Some(BuiltinModule::Os),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BuiltinModule::Fs => "fs",
            BuiltinModule::Path => "path",
            BuiltinModule::Http => "http",
            BuiltinModule::Https => "https",
            BuiltinModule::Net => "net",
            BuiltinModule::Tls => "tls",
            BuiltinModule::Events => "events",
            BuiltinModule::Buffer => "buffer",
            BuiltinModule::Process => "process",
            BuiltinModule::Tty => "tty",
            BuiltinModule::Url => "url",
            BuiltinModule::Os => "os",
        }
    }
}

/// An instantiated built-in
#[derive(Clone)]
pub enum Builtin {
    Fs(FsModule),
    Path(PathModule),
    Http(HttpModule),
    Https(HttpModule),
    Net(NetModule),
    Tls(NetModule),
    Events(EventsModule),
    Buffer(BufferModule),
    Process(ProcessObject),
    Tty(TtyModule),
    Url(UrlModule),
    Os(OsModule),
}

impl Builtin {
    pub fn module(&self) -> BuiltinModule {
        match self {
            Builtin::Fs(_) => BuiltinModule::Fs,
            Builtin::Path(_) => BuiltinModule::Path,
            Builtin::Http(_) => BuiltinModule::Http,
            Builtin::Https(_) => BuiltinModule::Https,
            Builtin::Net(_) => BuiltinModule::Net,
            Builtin::Tls(_) => BuiltinModule::Tls,
            Builtin::Events(_) => BuiltinModule::Events,
            Builtin::Buffer(_) => BuiltinModule::Buffer,
            Builtin::Process(_) => BuiltinModule::Process,
            Builtin::Tty(_) => BuiltinModule::Tty,
            Builtin::Url(_) => BuiltinModule::Url,
            Builtin::Os(_) => BuiltinModule::Os,
        }
    }

    pub fn as_fs(&self) -> Option<&FsModule> {
        match self {
            Builtin::Fs(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&PathModule> {
        match self {
            Builtin::Path(m) => Some(m),
            _ => None,
        }
    }

    /// `http` or `https`
    pub fn as_http(&self) -> Option<&HttpModule> {
        match self {
            Builtin::Http(m) | Builtin::Https(m) => Some(m),
            _ => None,
        }
    }

    /// `net` or `tls`
    pub fn as_net(&self) -> Option<&NetModule> {
        match self {
            Builtin::Net(m) | Builtin::Tls(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_events(&self) -> Option<&EventsModule> {
        match self {
            Builtin::Events(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_process(&self) -> Option<&ProcessObject> {
        match self {
            Builtin::Process(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_url(&self) -> Option<&UrlModule> {
        match self {
            Builtin::Url(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_os(&self) -> Option<&OsModule> {
        match self {
            Builtin::Os(m) => Some(m),
            _ => None,
        }
    }
}

/// Supplies the instance behind each built-in name
pub trait BuiltinProvider {
    fn builtin(&self, module: BuiltinModule) -> Builtin;
}

// ============================================================================
// Facilities with no sandbox state
// ============================================================================

/// The `path` built-in (POSIX flavor)
#[derive(Clone)]
pub struct PathModule {
    process: ProcessObject,
}

impl PathModule {
    pub const SEP: &'static str = "/";
    pub const DELIMITER: &'static str = ":";

    pub fn new(process: ProcessObject) -> Self {
        Self { process }
    }

    /// Join and normalize; relative results stay relative
    pub fn join(&self, parts: &[&str]) -> String {
        let joined = parts
            .iter()
            .filter(|p| !p.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("/");
        if joined.is_empty() {
            return ".".to_string();
        }
        let normalized = path::normalize(&joined);
        if joined.starts_with('/') {
            normalized
        } else {
            let rel = normalized.trim_start_matches('/');
            if rel.is_empty() { ".".to_string() } else { rel.to_string() }
        }
    }

    /// Absolute path: the parts applied right to left onto the cwd
    pub fn resolve(&self, parts: &[&str]) -> String {
        parts
            .iter()
            .fold(self.process.cwd(), |acc, part| path::join(&acc, part))
    }

    pub fn normalize(&self, p: &str) -> String {
        path::normalize(p)
    }

    pub fn dirname(&self, p: &str) -> String {
        path::dirname(p)
    }

    pub fn basename<'a>(&self, p: &'a str, ext: Option<&str>) -> &'a str {
        let base = path::basename(p);
        match ext {
            Some(ext) if base != ext => base.strip_suffix(ext).unwrap_or(base),
            _ => base,
        }
    }

    pub fn extname<'a>(&self, p: &'a str) -> &'a str {
        path::extname(p)
    }

    pub fn is_absolute(&self, p: &str) -> bool {
        p.starts_with('/')
    }
}

/// The `events` built-in
#[derive(Debug, Clone, Copy, Default)]
pub struct EventsModule;

impl EventsModule {
    pub fn create(&self) -> EventEmitter {
        EventEmitter::new()
    }
}

static URL: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z][A-Za-z0-9+.\-]*:)//([^/?#:]*)(?::(\d+))?([^?#]*)(\?[^#]*)?(#.*)?$").ok()
});

/// Components of a parsed URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    /// Scheme with its colon, e.g. `http:`
    pub protocol: String,
    pub hostname: String,
    pub port: Option<u16>,
    pub pathname: String,
    pub search: String,
    pub hash: String,
}

impl UrlParts {
    pub fn host(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.hostname, port),
            None => self.hostname.clone(),
        }
    }
}

/// The `url` built-in
#[derive(Debug, Clone, Copy, Default)]
pub struct UrlModule;

impl UrlModule {
    pub fn parse(&self, url: &str) -> Option<UrlParts> {
        let caps = URL.as_ref()?.captures(url.trim())?;
        let text = |i: usize| caps.get(i).map(|m| m.as_str().to_string()).unwrap_or_default();
        let port = match caps.get(3) {
            Some(m) => Some(m.as_str().parse().ok()?),
            None => None,
        };
        let pathname = text(4);
        Some(UrlParts {
            protocol: text(1).to_ascii_lowercase(),
            hostname: text(2),
            port,
            pathname: if pathname.is_empty() { "/".to_string() } else { pathname },
            search: text(5),
            hash: text(6),
        })
    }

    pub fn file_url_to_path(&self, url: &str) -> Option<String> {
        url.strip_prefix("file://").map(path::normalize)
    }

    pub fn path_to_file_url(&self, p: &str) -> String {
        format!("file://{}", path::normalize(p))
    }
}
