//! Kernel configuration
//!
//! One plain struct, every field defaulted. Hosts usually start from
//! `KernelConfig::default()` and override a field or two, or ship a JSON
//! document next to the page.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How `require` treats a path it has already loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
    /// Every require re-reads and re-executes the file
    #[default]
    Reexecute,
    /// One record per absolute path; a module still loading hands out its
    /// partial exports, which is what makes cycles terminate
    PathKeyed,
}

/// What to do with a module whose top level suspends
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "mode")]
pub enum TopLevelAwait {
    /// Queue the completion and drain it once the main script returns
    #[default]
    Deferred,
    /// Poll the completion in place until it finishes or the timeout passes
    #[serde(rename_all = "camelCase")]
    Blocking { timeout_ms: f64, interval_ms: f64 },
}

/// Kernel-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KernelConfig {
    /// Live-process ceiling enforced by spawn
    pub max_processes: usize,
    /// Reject loopback calls and syscalls that stay unsettled this long
    pub call_timeout_ms: Option<f64>,
    pub module_cache: CachePolicy,
    pub top_level_await: TopLevelAwait,
    /// Let user fetches bypass the supervisor when the syscall path fails
    pub allow_unmediated_fetch: bool,
    /// Base environment for every process
    pub env: BTreeMap<String, String>,
    pub tty_columns: u16,
    pub tty_rows: u16,
    /// Nesting limit for `require` chains
    pub max_require_depth: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("HOME".to_string(), "/home/user".to_string());
        env.insert("USER".to_string(), "user".to_string());
        env.insert(
            "PATH".to_string(),
            "/usr/local/bin:/usr/bin:/bin".to_string(),
        );
        env.insert("TERM".to_string(), "xterm-256color".to_string());

        Self {
            max_processes: 16,
            call_timeout_ms: None,
            module_cache: CachePolicy::Reexecute,
            top_level_await: TopLevelAwait::Deferred,
            allow_unmediated_fetch: false,
            env,
            tty_columns: 80,
            tty_rows: 24,
            max_require_depth: 256,
        }
    }
}

impl KernelConfig {
    /// Parse a JSON config document; missing fields keep their defaults
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialized form, as shipped to worker contexts
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
