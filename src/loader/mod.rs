//! Module loader
//!
//! `require` in a sandbox:
//! 1. resolve the specifier (`resolve`)
//! 2. built-ins come from the sandbox's `BuiltinProvider`
//! 3. `.json` files parse straight to a value
//! 4. everything else is read from the mirror, rewritten (`transform`) and
//!    evaluated by the `ScriptEngine` inside its own `ModuleScope`
//!
//! What `require` returns is the module's `module.exports` after its
//! top-level code ran. Caching follows `CachePolicy`; top-level code that
//! suspends follows `TopLevelAwait`.

pub mod builtins;
pub mod engine;
pub mod error;
pub mod resolve;
pub mod scope;
pub mod transform;
pub mod value;

#[cfg(target_arch = "wasm32")]
pub mod js;

pub use builtins::{Builtin, BuiltinModule, BuiltinProvider};
pub use engine::{Completion, NativeEngine, ScriptEngine, ScriptUnit};
pub use error::{ModuleError, ModuleResult, ScriptError};
pub use resolve::Resolved;
pub use scope::ModuleScope;
pub use value::Value;

use crate::config::{CachePolicy, KernelConfig, TopLevelAwait};
use crate::sandbox::bootstrap::Globals;
use crate::sandbox::fs::Mirror;
use crate::vfs::{self, path};
use futures::future::LocalBoxFuture;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// Loader settings, taken from the kernel config
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoaderOptions {
    pub policy: CachePolicy,
    pub top_level_await: TopLevelAwait,
    pub max_depth: usize,
}

impl From<&KernelConfig> for LoaderOptions {
    fn from(config: &KernelConfig) -> Self {
        Self {
            policy: config.module_cache,
            top_level_await: config.top_level_await,
            max_depth: config.max_require_depth,
        }
    }
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self::from(&KernelConfig::default())
    }
}

/// Top-level code still suspended once its module returned
pub struct Deferred {
    pub path: String,
    pub completion: LocalBoxFuture<'static, Result<(), ScriptError>>,
}

/// The services a loader draws on
pub struct LoaderParts {
    pub fs: Mirror,
    pub engine: Rc<dyn ScriptEngine>,
    pub builtins: Rc<dyn BuiltinProvider>,
    pub globals: Globals,
    pub options: LoaderOptions,
}

struct LoaderInner {
    parts: LoaderParts,
    depth: Cell<usize>,
    /// Module objects by absolute path (PathKeyed only)
    cache: RefCell<HashMap<String, Value>>,
    deferred: RefCell<Vec<Deferred>>,
}

/// Cheap handle; every `ModuleScope` carries one
#[derive(Clone)]
pub struct ModuleLoader {
    inner: Rc<LoaderInner>,
}

/// Holds one level of require nesting for as long as it lives
struct DepthGuard<'a>(&'a Cell<usize>);

impl<'a> DepthGuard<'a> {
    fn enter(depth: &'a Cell<usize>) -> Self {
        depth.set(depth.get() + 1);
        Self(depth)
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

impl ModuleLoader {
    pub fn new(parts: LoaderParts) -> Self {
        Self {
            inner: Rc::new(LoaderInner {
                parts,
                depth: Cell::new(0),
                cache: RefCell::new(HashMap::new()),
                deferred: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn globals(&self) -> &Globals {
        &self.inner.parts.globals
    }

    pub fn options(&self) -> LoaderOptions {
        self.inner.parts.options
    }

    /// Resolve `specifier` from `from_dir` and return the module's exports
    pub fn require(&self, specifier: &str, from_dir: &str) -> ModuleResult<Value> {
        let resolved = {
            let fs = self.inner.parts.fs.borrow();
            resolve::resolve(&*fs, specifier, from_dir)?
        };
        match resolved {
            Resolved::Builtin(module) => Ok(Value::Builtin(self.inner.parts.builtins.builtin(module))),
            Resolved::File(file) => self.load_file(&file),
        }
    }

    /// Run `source` as the main module at `main_path`
    pub fn run_main(&self, source: &str, main_path: &str) -> ModuleResult<Value> {
        self.load_source(&path::normalize(main_path), source)
    }

    /// Drain top-level completions queued by deferred modules
    pub fn take_deferred(&self) -> Vec<Deferred> {
        std::mem::take(&mut *self.inner.deferred.borrow_mut())
    }

    /// Whether `path` has a record in the module cache
    pub fn is_cached(&self, module_path: &str) -> bool {
        self.inner.cache.borrow().contains_key(module_path)
    }

    fn load_file(&self, file: &str) -> ModuleResult<Value> {
        if let Some(exports) = self.cached(file) {
            return Ok(exports);
        }
        // Released before evaluation: module code writes through `fs`
        let source = {
            let fs = self.inner.parts.fs.borrow();
            vfs::read_to_string(&*fs, file).map_err(|e| ModuleError::Io {
                path: file.to_string(),
                message: e.to_string(),
            })?
        };
        self.load_source(file, &source)
    }

    fn cached(&self, file: &str) -> Option<Value> {
        if self.inner.parts.options.policy != CachePolicy::PathKeyed {
            return None;
        }
        self.inner
            .cache
            .borrow()
            .get(file)
            .map(|module| module.get("exports"))
    }

    fn load_source(&self, file: &str, source: &str) -> ModuleResult<Value> {
        if let Some(exports) = self.cached(file) {
            return Ok(exports);
        }

        let depth = self.inner.depth.get();
        if depth >= self.inner.parts.options.max_depth {
            return Err(ModuleError::RecursionLimit {
                path: file.to_string(),
                depth,
            });
        }

        let source = strip_shebang(source);
        let keyed = self.inner.parts.options.policy == CachePolicy::PathKeyed;

        if path::extname(file) == ".json" {
            let json: serde_json::Value =
                serde_json::from_str(source).map_err(|e| ModuleError::InvalidJson {
                    path: file.to_string(),
                    message: e.to_string(),
                })?;
            let exports = Value::from_json(&json);
            if keyed {
                let module = new_module(file);
                module.set("exports", exports.clone());
                module.set("loaded", Value::Bool(true));
                self.inner.cache.borrow_mut().insert(file.to_string(), module);
            }
            return Ok(exports);
        }

        let rewritten = transform::transform(source);
        let unit = ScriptUnit {
            path: file.to_string(),
            is_async: transform::has_top_level_await(&rewritten.code),
            source: rewritten.code,
            transformed: rewritten.rewritten,
        };

        let module = new_module(file);
        if keyed {
            // Visible before evaluation so a cycle sees the partial exports
            self.inner
                .cache
                .borrow_mut()
                .insert(file.to_string(), module.clone());
        }

        let scope = ModuleScope::new(self.clone(), file, module.clone());
        let outcome = {
            let _depth = DepthGuard::enter(&self.inner.depth);
            self.inner
                .parts
                .engine
                .evaluate(&unit, &scope)
                .map_err(|e| script_failure(file, e))
                .and_then(|completion| self.finish(file, completion))
        };

        if let Err(e) = outcome {
            if keyed {
                self.inner.cache.borrow_mut().remove(file);
            }
            return Err(e);
        }
        module.set("loaded", Value::Bool(true));
        Ok(module.get("exports"))
    }

    fn finish(&self, file: &str, completion: Completion) -> ModuleResult<()> {
        let Completion::Pending(completion) = completion else {
            return Ok(());
        };
        match self.inner.parts.options.top_level_await {
            #[cfg(not(target_arch = "wasm32"))]
            TopLevelAwait::Blocking {
                timeout_ms,
                interval_ms,
            } => block_on_top_level(file, completion, timeout_ms, interval_ms),
            // The page thread cannot sleep; wasm degrades to deferred
            _ => {
                self.inner.deferred.borrow_mut().push(Deferred {
                    path: file.to_string(),
                    completion,
                });
                Ok(())
            }
        }
    }
}

fn new_module(file: &str) -> Value {
    let module = Value::object();
    module.set("exports", Value::object());
    module.set("id", Value::from(file));
    module.set("filename", Value::from(file));
    module.set("loaded", Value::Bool(false));
    module
}

/// A failed nested require keeps its own error; anything else is this
/// module's failure
fn script_failure(file: &str, error: ScriptError) -> ModuleError {
    match error.origin {
        Some(origin) => origin,
        None => ModuleError::Script {
            path: file.to_string(),
            message: error.message,
        },
    }
}

/// Blank the `#!` line, keeping line numbers
fn strip_shebang(source: &str) -> &str {
    if source.starts_with("#!") {
        &source[source.find('\n').unwrap_or(source.len())..]
    } else {
        source
    }
}

/// Poll a suspended top level in place until it settles or time runs out
///
/// Nothing else in the sandbox runs meanwhile, so only completions that do
/// not wait on the supervisor can finish here.
#[cfg(not(target_arch = "wasm32"))]
fn block_on_top_level(
    file: &str,
    mut completion: LocalBoxFuture<'static, Result<(), ScriptError>>,
    timeout_ms: f64,
    interval_ms: f64,
) -> ModuleResult<()> {
    use std::task::{Context, Poll};
    use std::time::{Duration, Instant};

    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);
    let started = Instant::now();
    loop {
        if let Poll::Ready(result) = completion.as_mut().poll(&mut cx) {
            return result.map_err(|e| script_failure(file, e));
        }
        let waited_ms = started.elapsed().as_secs_f64() * 1000.0;
        if waited_ms >= timeout_ms {
            return Err(ModuleError::TopLevelAwaitTimeout {
                path: file.to_string(),
                waited_ms,
            });
        }
        std::thread::sleep(Duration::from_secs_f64(interval_ms.max(0.0) / 1000.0));
    }
}
