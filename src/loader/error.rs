//! Loader error types

/// Why a `require` produced no module
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleError {
    /// Every resolution rule was exhausted
    NotFound { specifier: String, from: String },
    /// A `.json` module did not parse
    InvalidJson { path: String, message: String },
    /// The module's own code failed
    Script { path: String, message: String },
    /// Nested requires went deeper than the configured limit
    RecursionLimit { path: String, depth: usize },
    /// A blocking top-level await did not finish in time
    TopLevelAwaitTimeout { path: String, waited_ms: f64 },
    /// The module file could not be read
    Io { path: String, message: String },
}

impl std::fmt::Display for ModuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleError::NotFound { specifier, from } => {
                write!(f, "Cannot find module '{}' from '{}'", specifier, from)
            }
            ModuleError::InvalidJson { path, message } => {
                write!(f, "{}: invalid JSON: {}", path, message)
            }
            ModuleError::Script { path, message } => write!(f, "{}: {}", path, message),
            ModuleError::RecursionLimit { path, depth } => {
                write!(f, "{}: require depth limit {} exceeded", path, depth)
            }
            ModuleError::TopLevelAwaitTimeout { path, waited_ms } => {
                write!(f, "{}: top-level await still pending after {}ms", path, waited_ms)
            }
            ModuleError::Io { path, message } => write!(f, "{}: {}", path, message),
        }
    }
}

impl std::error::Error for ModuleError {}

pub type ModuleResult<T> = Result<T, ModuleError>;

/// An exception escaping user code
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptError {
    pub message: String,
    /// Set when the exception is a failed `require` passing through
    pub origin: Option<ModuleError>,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            origin: None,
        }
    }
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ScriptError {}

impl From<ModuleError> for ScriptError {
    fn from(e: ModuleError) -> Self {
        Self {
            message: e.to_string(),
            origin: Some(e),
        }
    }
}

impl From<String> for ScriptError {
    fn from(message: String) -> Self {
        ScriptError::new(message)
    }
}
