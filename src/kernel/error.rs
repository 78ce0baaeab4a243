//! Kernel error types

use super::process::Pid;

/// Errors surfaced by supervisor operations
#[derive(Debug, Clone, PartialEq)]
pub enum KernelError {
    /// Spawn rejected: the live-process ceiling is reached
    ProcessLimit { limit: usize },
    /// No process with this id is registered
    NoSuchProcess(Pid),
    /// The execution context could not be created
    Context(String),
    /// An inbound message could not be decoded
    Transport(TransportError),
}

impl std::fmt::Display for KernelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelError::ProcessLimit { limit } => {
                write!(f, "process limit reached ({} live processes)", limit)
            }
            KernelError::NoSuchProcess(pid) => write!(f, "no such process: {}", pid),
            KernelError::Context(msg) => write!(f, "execution context error: {}", msg),
            KernelError::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<TransportError> for KernelError {
    fn from(e: TransportError) -> Self {
        KernelError::Transport(e)
    }
}

/// A malformed message on the supervisor/context wire
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Not JSON, missing fields, or violates a message invariant
    Malformed(String),
    /// Well-formed JSON with a `type` nobody handles
    UnknownType(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Malformed(msg) => write!(f, "malformed message: {}", msg),
            TransportError::UnknownType(ty) => write!(f, "unknown message type: {}", ty),
        }
    }
}

impl std::error::Error for TransportError {}

pub type KernelResult<T> = Result<T, KernelError>;
