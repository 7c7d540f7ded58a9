/// Tool for suggesting servers that would be worth installing
///
/// This module implements the `__mcp__suggest_tool` built-in. Suggestions are
/// validated and logged; recording them is not implemented yet.

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::jsonrpc::{internal_error, RpcError};
use crate::mcp::ToolCallResult;

pub(crate) const DESCRIPTION: &str =
    "Suggest a child MCP server that would be generically useful for the request and other anticipated requests.";

/// A tool the client wishes existed
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SuggestedTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

/// Parameters of `__mcp__suggest_tool`
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SuggestToolParams {
    #[serde(default)]
    pub tools: Vec<SuggestedTool>,
}

pub fn suggest_tool(params: SuggestToolParams) -> Result<ToolCallResult, RpcError> {
    for tool in &params.tools {
        tracing::info!(name = %tool.name, description = %tool.description, "tool suggested");
    }

    Err(internal_error("tool not implemented"))
}
