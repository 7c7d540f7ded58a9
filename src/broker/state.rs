/// Session phases and the method table of the upstream connection

use serde_json::Value;

use crate::jsonrpc::{invalid_request, method_not_found, parse_params, RpcError};
use crate::mcp::{methods, InitializeParams, InitializedParams, ToolCallParams, ToolsListParams};

/// Phase of the upstream MCP session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Running,
    Closed,
}

impl SessionState {
    /// State after an `initialize` request
    pub fn initialize(self) -> Result<SessionState, RpcError> {
        match self {
            SessionState::Uninitialized => Ok(SessionState::Initialized),
            SessionState::Closed => Err(invalid_request("session is closed")),
            _ => Err(invalid_request("session already initialized")),
        }
    }

    /// State after the `initialized` notification
    ///
    /// A notification that arrives out of order leaves the state unchanged.
    pub fn initialized(self) -> SessionState {
        match self {
            SessionState::Initialized => SessionState::Running,
            other => other,
        }
    }

    /// Fails unless the session may list and call tools
    pub fn require_tools(self) -> Result<(), RpcError> {
        match self {
            SessionState::Initialized | SessionState::Running => Ok(()),
            SessionState::Uninitialized => Err(invalid_request("session not initialized")),
            SessionState::Closed => Err(invalid_request("session is closed")),
        }
    }
}

/// Every method the broker serves, with typed params
#[derive(Debug)]
pub enum BrokerMethod {
    Initialize(InitializeParams),
    Initialized(InitializedParams),
    ToolsList(ToolsListParams),
    ToolsCall(ToolCallParams),
}

impl BrokerMethod {
    /// Resolve a method name and decode its params
    pub fn parse(method: &str, params: Option<Value>) -> Result<Self, RpcError> {
        match method {
            methods::INITIALIZE => Ok(BrokerMethod::Initialize(parse_params(params)?)),
            methods::INITIALIZED | methods::NOTIFICATIONS_INITIALIZED => {
                Ok(BrokerMethod::Initialized(parse_params(params)?))
            }
            methods::TOOLS_LIST => Ok(BrokerMethod::ToolsList(parse_params(params)?)),
            methods::TOOLS_CALL => Ok(BrokerMethod::ToolsCall(parse_params(params)?)),
            other => Err(method_not_found(other)),
        }
    }
}
