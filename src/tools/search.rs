/// Tool for searching the package registry
///
/// This module implements the `__mcp__search_registry` built-in on top of a
/// `RegistryClient`.

use schemars::JsonSchema;
use serde::Deserialize;

use crate::jsonrpc::RpcError;
use crate::mcp::ToolCallResult;
use crate::registry::RegistryClient;

pub(crate) const DESCRIPTION: &str = "\
Search the MCP registry for Servers that provide the capabilities necessary to fulfill the request.

When using this tool, DO NOT simply pass on the user's request. Instead, try to come up with
search terms that would be useful for finding a server that can fulfill the request.";

/// Parameters of `__mcp__search_registry`
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct SearchRegistryParams {
    /// Search terms separated by whitespace
    #[serde(default)]
    pub query: String,
}

pub async fn search_registry(
    registry: &dyn RegistryClient,
    params: SearchRegistryParams,
) -> Result<ToolCallResult, RpcError> {
    let terms: Vec<String> = params.query.split_whitespace().map(str::to_string).collect();
    if terms.is_empty() {
        return Ok(ToolCallResult::error("query must not be empty".to_string()));
    }

    let hits = match registry.search(&terms).await {
        Ok(hits) => hits,
        Err(e) => {
            tracing::warn!(error = %e, "registry search failed");
            return Ok(ToolCallResult::error(format!("registry search failed: {}", e)));
        }
    };

    tracing::debug!(query = %params.query, hits = hits.len(), "registry search");

    if hits.is_empty() {
        return Ok(ToolCallResult::success(format!(
            "no servers found matching {:?}",
            params.query
        )));
    }

    let lines: Vec<String> = hits
        .iter()
        .map(|hit| format!("{} {}: {}", hit.name, hit.version, hit.description))
        .collect();
    Ok(ToolCallResult::success(lines.join("\n")))
}
