/// Tool for installing a server found in the registry
///
/// This module implements the `__mcp__install_server` built-in. Installing
/// from inside a session is not supported yet; the tool validates its
/// arguments and then reports that it is not implemented.

use schemars::JsonSchema;
use serde::Deserialize;

use crate::jsonrpc::{internal_error, RpcError};
use crate::mcp::ToolCallResult;

pub(crate) const DESCRIPTION: &str = "\
Install a child MCP Server based on a server discovered via `__mcp__search_registry`.

ONLY use this tool if you discover a server that can fulfill the request. If you are not sure
whether the server can fulfill the request, indicate that you CAN'T fulfill the request.";

/// Parameters of `__mcp__install_server`
#[derive(Debug, Deserialize, JsonSchema)]
pub struct InstallServerParams {
    /// Package name as listed by the registry
    pub name: String,
    /// Exact package version
    pub version: String,
}

pub fn install_server(params: InstallServerParams) -> Result<ToolCallResult, RpcError> {
    if params.name.trim().is_empty() || params.version.trim().is_empty() {
        return Err(RpcError::invalid_params("name and version must not be empty"));
    }

    tracing::debug!(name = %params.name, version = %params.version, "install requested");
    Err(internal_error("tool not implemented"))
}
