//! Process records and the port table
//!
//! A process here is one supervisor-managed execution context, not an OS
//! process. The table owns each context exclusively; nothing else holds a
//! handle to it.

use super::context::ExecutionContext;
use std::collections::BTreeMap;

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle of a UI window showing a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(pub u64);

/// Process status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Spawned; filesystem sync and execute queued
    Starting,
    /// The context has picked up its messages
    Running,
    /// Called exit with this code
    Exited(i32),
    /// The context died without exiting
    Error,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Starting => write!(f, "starting"),
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Exited(code) => write!(f, "exited({})", code),
            ProcessStatus::Error => write!(f, "error"),
        }
    }
}

/// A live process
pub struct Process {
    pub pid: Pid,
    /// Source path the process was started from
    pub name: String,
    pub status: ProcessStatus,
    pub started_at: f64,
    /// Display-only back-reference; the window is owned by the UI
    pub window: Option<WindowId>,
    pub context: Box<dyn ExecutionContext>,
}

impl Process {
    pub fn new(pid: Pid, name: &str, started_at: f64, context: Box<dyn ExecutionContext>) -> Self {
        Self {
            pid,
            name: name.to_string(),
            status: ProcessStatus::Starting,
            started_at,
            window: None,
            context,
        }
    }
}

/// Snapshot of a process for listings
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub name: String,
    pub status: ProcessStatus,
    pub started_at: f64,
    pub ports: Vec<u16>,
    pub window: Option<WindowId>,
}

/// Exclusive port → process bindings
///
/// At most one process per port. Callers decide what to do about a
/// conflict; the table never displaces an owner on its own.
#[derive(Debug, Default)]
pub struct PortTable {
    bindings: BTreeMap<u16, Pid>,
}

impl PortTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self, port: u16) -> Option<Pid> {
        self.bindings.get(&port).copied()
    }

    /// Bind a free port. On conflict returns the current owner and leaves
    /// the binding untouched.
    pub fn bind(&mut self, port: u16, pid: Pid) -> Result<(), Pid> {
        match self.bindings.get(&port) {
            Some(&owner) => Err(owner),
            None => {
                self.bindings.insert(port, pid);
                Ok(())
            }
        }
    }

    /// Drop a binding regardless of owner, returning who held it
    pub fn evict(&mut self, port: u16) -> Option<Pid> {
        self.bindings.remove(&port)
    }

    /// Release every port held by `pid`
    pub fn release_all(&mut self, pid: Pid) -> Vec<u16> {
        let ports = self.ports_of(pid);
        for port in &ports {
            self.bindings.remove(port);
        }
        ports
    }

    pub fn ports_of(&self, pid: Pid) -> Vec<u16> {
        self.bindings
            .iter()
            .filter(|(_, owner)| **owner == pid)
            .map(|(port, _)| *port)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
