//! Tool-protocol plumbing: JSON-RPC over a child's stdio, the per-server client,
//! and the per-request [`ToolSession`].

mod client;
mod session;
mod transport;
pub mod types;

pub use client::{ConnectError, McpClient};
pub use session::{
    ServerLauncher, SessionState, StdioLauncher, ToolServer, ToolSession, ToolSessionError,
};
pub use transport::{StdioTransport, TransportError};
