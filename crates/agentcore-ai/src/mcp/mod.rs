//! MCP (Model Context Protocol) client pool: provider resolution,
//! transports, sessions and registry proxies.

pub mod config;
mod connection;
mod pool;
#[cfg(test)]
pub(crate) mod test_server;
mod tool;
pub mod transport;

pub use config::{
    HttpProfileResolver, McpConnectionRequest, McpProvider, McpResolver, PipedreamAuth,
    PipedreamCredentials, ProfileResolver, ResolvedServer,
};
pub use connection::{McpConnection, McpToolInfo, normalize_content};
pub use pool::{McpClientPool, McpTimeouts};
pub use tool::McpProxyTool;
pub use transport::{McpTransport, TransportKind};
