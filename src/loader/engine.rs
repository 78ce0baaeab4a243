//! Script engines
//!
//! The loader prepares a `ScriptUnit` (rewritten source plus its wrapper)
//! and hands it to an engine together with the module's scope. On wasm32
//! the engine is the browser's own JS runtime; natively, modules are Rust
//! closures registered per path, which is what the test suites use.

use super::error::ScriptError;
use super::scope::ModuleScope;
use futures::future::LocalBoxFuture;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Parameters of the module wrapper, in call order
pub const WRAPPER_PARAMS: [&str; 12] = [
    "exports",
    "require",
    "module",
    "__filename",
    "__dirname",
    "__moduleUrl",
    "__importDefault",
    "__import",
    "process",
    "Buffer",
    "console",
    "fetch",
];

/// One module, ready to evaluate
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptUnit {
    /// Absolute path of the module
    pub path: String,
    /// Source after rewriting
    pub source: String,
    /// Whether import/export rewriting happened
    pub transformed: bool,
    /// Top-level `await` present; the wrapper is async
    pub is_async: bool,
}

impl ScriptUnit {
    /// The wrapper function expression around the source
    pub fn wrapper(&self) -> String {
        format!(
            "({}function ({}) {{\n{}\n}})",
            if self.is_async { "async " } else { "" },
            WRAPPER_PARAMS.join(", "),
            self.source
        )
    }
}

/// How evaluation ended
pub enum Completion {
    /// Top-level code ran to the end
    Done,
    /// Top-level code is suspended on an `await`
    Pending(LocalBoxFuture<'static, Result<(), ScriptError>>),
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Done => write!(f, "Done"),
            Completion::Pending(_) => write!(f, "Pending"),
        }
    }
}

pub trait ScriptEngine {
    /// Run the module's top-level code against `scope`
    fn evaluate(&self, unit: &ScriptUnit, scope: &ModuleScope) -> Result<Completion, ScriptError>;
}

/// Body of a native module
pub type NativeModule = Rc<dyn Fn(&ModuleScope) -> Result<Completion, ScriptError>>;

/// Engine whose modules are Rust closures keyed by absolute path
///
/// The file must still exist in the filesystem for resolution; its text is
/// rewritten as usual and recorded, but the closure is what runs.
#[derive(Clone, Default)]
pub struct NativeEngine {
    modules: Rc<RefCell<HashMap<String, NativeModule>>>,
    evaluated: Rc<RefCell<Vec<ScriptUnit>>>,
}

impl NativeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module whose top-level code may suspend
    pub fn register<F>(&self, path: &str, body: F)
    where
        F: Fn(&ModuleScope) -> Result<Completion, ScriptError> + 'static,
    {
        self.modules
            .borrow_mut()
            .insert(path.to_string(), Rc::new(body));
    }

    /// Register a module that runs to completion synchronously
    pub fn register_sync<F>(&self, path: &str, body: F)
    where
        F: Fn(&ModuleScope) -> Result<(), ScriptError> + 'static,
    {
        self.register(path, move |scope| body(scope).map(|_| Completion::Done));
    }

    /// Every unit evaluated so far, in order
    pub fn evaluated(&self) -> Vec<ScriptUnit> {
        self.evaluated.borrow().clone()
    }
}

impl ScriptEngine for NativeEngine {
    fn evaluate(&self, unit: &ScriptUnit, scope: &ModuleScope) -> Result<Completion, ScriptError> {
        self.evaluated.borrow_mut().push(unit.clone());
        // Cloned out: the body may require other modules
        let body = self.modules.borrow().get(&unit.path).cloned();
        match body {
            Some(body) => body(scope),
            None => Err(ScriptError::new(format!(
                "no native module registered for {}",
                unit.path
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapper_shape() {
        let unit = ScriptUnit {
            path: "/main.js".to_string(),
            source: "console.log(1);".to_string(),
            transformed: false,
            is_async: false,
        };
        assert_eq!(
            unit.wrapper(),
            "(function (exports, require, module, __filename, __dirname, __moduleUrl, __importDefault, __import, process, Buffer, console, fetch) {\nconsole.log(1);\n})"
        );

        let unit = ScriptUnit {
            is_async: true,
            ..unit
        };
        assert!(unit.wrapper().starts_with("(async function ("));
    }
}
