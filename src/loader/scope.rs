//! Per-module scope
//!
//! Everything the module wrapper receives besides the globals: its own
//! `module`/`exports` pair, its location and a `require` bound to its
//! directory.

use super::ModuleLoader;
use super::error::ScriptError;
use super::value::{Value, interop_default};
use crate::sandbox::bootstrap::Globals;
use crate::vfs::path;
use futures::FutureExt;
use futures::future::LocalBoxFuture;

#[derive(Clone)]
pub struct ModuleScope {
    loader: ModuleLoader,
    path: String,
    dir: String,
    module: Value,
}

impl ModuleScope {
    pub(crate) fn new(loader: ModuleLoader, module_path: &str, module: Value) -> Self {
        Self {
            loader,
            path: module_path.to_string(),
            dir: path::dirname(module_path),
            module,
        }
    }

    /// `__filename`
    pub fn filename(&self) -> &str {
        &self.path
    }

    /// `__dirname`
    pub fn dirname(&self) -> &str {
        &self.dir
    }

    /// `import.meta.url`
    pub fn module_url(&self) -> String {
        format!("file://{}", self.path)
    }

    /// The `module` object
    pub fn module(&self) -> &Value {
        &self.module
    }

    /// Current `module.exports`
    pub fn exports(&self) -> Value {
        self.module.get("exports")
    }

    /// `exports.<name> = value`
    pub fn export(&self, name: &str, value: impl Into<Value>) {
        self.exports().set(name, value.into());
    }

    /// `module.exports = value`
    pub fn set_module_exports(&self, value: impl Into<Value>) {
        self.module.set("exports", value.into());
    }

    pub fn require(&self, specifier: &str) -> Result<Value, ScriptError> {
        self.loader
            .require(specifier, &self.dir)
            .map_err(ScriptError::from)
    }

    /// `__importDefault`: the default binding of a rewritten import
    pub fn import_default(&self, specifier: &str) -> Result<Value, ScriptError> {
        self.require(specifier).map(interop_default)
    }

    /// `__import`: dynamic `import()`, settled with the module's exports
    pub fn import(&self, specifier: &str) -> LocalBoxFuture<'static, Result<Value, ScriptError>> {
        futures::future::ready(self.require(specifier)).boxed_local()
    }

    pub fn globals(&self) -> &Globals {
        self.loader.globals()
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }
}
