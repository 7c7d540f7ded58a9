/// MCP protocol implementation
///
/// This module holds the Model Context Protocol payload types shared by the
/// broker (server role) and the runner (client role).

pub mod protocol;

// Re-export main types
pub use protocol::*;
