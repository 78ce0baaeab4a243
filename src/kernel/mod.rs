//! The kernel - supervisor, execution contexts, and the message wire
//!
//! The supervisor is the only privileged party:
//! - it owns the process table and the port table
//! - it performs filesystem and network I/O on behalf of processes
//! - it never blocks; hosts drive it with `pump` and `tick`
//!
//! Processes are reached exclusively through `ExecutionContext` messages.

pub mod context;
pub mod error;
pub mod executor;
pub mod ipc;
pub mod netbridge;
pub mod pending;
pub mod process;
pub mod protocol;
pub mod router;
pub mod sink;
pub mod supervisor;

#[cfg(target_arch = "wasm32")]
pub mod web;
#[cfg(target_arch = "wasm32")]
pub mod worker;

pub use context::{ContextFactory, ContextOptions, EngineFactory, ExecutionContext, LocalContext, LocalContextFactory};
pub use error::{KernelError, KernelResult, TransportError};
pub use executor::{Executor, Spawner, TaskId};
pub use ipc::{Receiver, Sender, channel};
pub use netbridge::{DeniedNetwork, HostNetwork, HostOp, NetCompletion, RelayNetwork, RelayTransport};
pub use process::{Pid, ProcessInfo, ProcessStatus, WindowId};
pub use protocol::{FetchRequest, FetchResponse, FromContext, ToContext};
pub use router::{LoopbackCall, LoopbackError};
pub use sink::{ConsoleSink, MemorySink, Style, UiSink};
pub use supervisor::Supervisor;
