//! Virtual network stack
//!
//! Sockets and servers live in the sandbox; their I/O is performed by the
//! supervisor. Everything here only produces and consumes transport
//! messages.

pub mod fetch;
pub mod http;
pub mod socket;

pub use fetch::{Fetcher, UnmediatedFetch};
pub use http::{Dispatchers, HttpModule, HttpServer, IncomingRequest, ServerResponse};
pub use socket::{ConnectOptions, NetModule, SocketTable, VirtualSocket};
