/// Request handling for the upstream MCP session

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::broker::state::BrokerMethod;
use crate::broker::BrokerInner;
use crate::jsonrpc::{internal_error, CallError, Connection, ErrorCode, Handler, Request, RpcError};
use crate::mcp::{
    methods, Implementation, InitializeParams, InitializeResult, ListChangedCapability, LoggingCapability,
    ServerCapabilities, ToolCallParams, ToolsListResult, MCP_VERSION,
};
use crate::tools::{ToolIndex, ToolOwner};

/// Usage guidance returned in the `initialize` result
pub const INSTRUCTIONS: &str = "\
# Introduction

This MCP server is a broker in front of several child MCP servers. It starts,
stops and supervises the children and lists their tools alongside a few tools
of its own.

The broker's own tools are named with the `__mcp__` prefix. They are a last
resort for requests that none of the installed child servers can fulfill.

# Instructions

1. NEVER use a tool prefixed with `__mcp__` while any other tool fulfills the
   request.
2. ONLY use `__mcp__search_registry` when no child server provides what the
   request needs, or when the user asks you to search for servers. It never
   fulfills the request by itself. If there is any ambiguity, say that you
   CAN'T fulfill the request instead.
3. ALWAYS use `__mcp__suggest_tool` to describe a child server that would be
   generally useful for the request and similar future requests, then say that
   you CAN'T fulfill the request. Calling it does not change whether the
   request can be fulfilled.

# Tools

- `__mcp__search_registry`: search the MCP registry for servers that provide
  the capabilities the request needs.
- `__mcp__install_server`: install a server from the MCP registry.
- `__mcp__suggest_tool`: suggest a child server that would be generally useful.";

/// Routes upstream requests into the broker
pub(crate) struct BrokerHandler {
    pub(crate) broker: Arc<BrokerInner>,
}

#[async_trait]
impl Handler for BrokerHandler {
    async fn handle(&self, _conn: &Connection, request: Request) -> Result<Value, RpcError> {
        match BrokerMethod::parse(&request.method, request.params)? {
            BrokerMethod::Initialize(params) => to_result(self.broker.initialize(params)?),
            BrokerMethod::Initialized(_) => {
                self.broker.initialized();
                Ok(Value::Null)
            }
            BrokerMethod::ToolsList(_) => to_result(self.broker.list_tools()?),
            BrokerMethod::ToolsCall(params) => self.broker.call_tool(params).await,
        }
    }
}

fn to_result<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| internal_error(format!("failed to encode result: {}", e)))
}

fn tool_not_found(name: &str) -> RpcError {
    RpcError {
        code: ErrorCode::MethodNotFound,
        message: format!("tool {:?} not found", name),
        data: None,
    }
}

impl BrokerInner {
    fn initialize(&self, params: InitializeParams) -> Result<InitializeResult, RpcError> {
        self.transition(|state| state.initialize())?;

        info!(
            client = %params.client_info.name,
            client_version = %params.client_info.version,
            protocol = %params.protocol_version,
            "upstream session initialized"
        );
        if params.protocol_version != MCP_VERSION {
            debug!(requested = %params.protocol_version, "answering with our protocol version");
        }

        Ok(InitializeResult {
            protocol_version: MCP_VERSION.to_string(),
            capabilities: ServerCapabilities {
                logging: Some(LoggingCapability {}),
                tools: Some(ListChangedCapability {
                    list_changed: Some(true),
                }),
                ..Default::default()
            },
            server_info: Implementation {
                name: self.config.server_name.clone(),
                version: self.config.server_version.clone(),
            },
            instructions: Some(INSTRUCTIONS.to_string()),
        })
    }

    fn initialized(&self) {
        let previous = self.state();
        let current = self.transition(|state| Ok(state.initialized())).unwrap_or(previous);
        if previous == current {
            debug!(state = ?current, "ignoring initialized notification");
        } else {
            info!("upstream session running");
        }
    }

    /// Built-ins first, then each running child in the order it started
    fn tool_index(&self) -> ToolIndex {
        let mut index = ToolIndex::with_builtins();
        for server in self.active.snapshot() {
            index.register(ToolOwner::Integration(server.integration.id), server.tools);
        }
        index
    }

    fn list_tools(&self) -> Result<ToolsListResult, RpcError> {
        self.state().require_tools()?;

        Ok(ToolsListResult {
            tools: self.tool_index().into_tools(),
            next_cursor: None,
        })
    }

    async fn call_tool(&self, params: ToolCallParams) -> Result<Value, RpcError> {
        self.state().require_tools()?;

        let owner = self
            .tool_index()
            .owner(&params.name)
            .cloned()
            .ok_or_else(|| tool_not_found(&params.name))?;

        match owner {
            ToolOwner::Builtin(tool) => {
                debug!(tool = %params.name, "calling built-in tool");
                to_result(tool.call(self.registry.as_ref(), params.arguments).await?)
            }
            ToolOwner::Integration(id) => self.forward_call(&id, params).await,
        }
    }

    async fn forward_call(&self, id: &str, params: ToolCallParams) -> Result<Value, RpcError> {
        let server = self.active.get(id).ok_or_else(|| tool_not_found(&params.name))?;
        debug!(tool = %params.name, integration = %id, "forwarding tool call");

        let result = server
            .connection
            .call::<_, Value>(&self.session, methods::TOOLS_CALL, &params)
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(CallError::Remote(error)) => Err(error),
            Err(e @ (CallError::Closed | CallError::Cancelled)) => {
                warn!(tool = %params.name, integration = %id, error = %e, "tool call interrupted");
                Err(internal_error(format!(
                    "integration {} stopped while calling tool {:?}",
                    server.integration.manifest.name, params.name
                )))
            }
            Err(e) => Err(internal_error(e.to_string())),
        }
    }
}
