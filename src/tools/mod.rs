/// Built-in MCP tools and tool aggregation
///
/// The broker exposes a few tools of its own, all named with the reserved
/// `__mcp__` prefix. They are listed ahead of every child tool and are meant
/// as a last resort when no installed integration can serve a request.

pub mod aggregate;
pub mod install;
pub mod search;
pub mod suggest;

pub use aggregate::{ToolIndex, ToolOwner};
pub use install::InstallServerParams;
pub use search::SearchRegistryParams;
pub use suggest::{SuggestToolParams, SuggestedTool};

use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde_json::{Map, Value};

use crate::jsonrpc::{parse_params, RpcError};
use crate::mcp::{ToolCallResult, ToolDefinition};
use crate::registry::RegistryClient;

/// Prefix reserved for tools implemented by the broker itself
pub const BUILTIN_PREFIX: &str = "__mcp__";

/// The broker's own tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinTool {
    InstallServer,
    SearchRegistry,
    SuggestTool,
}

impl BuiltinTool {
    /// All built-ins, in listing order
    pub const ALL: [BuiltinTool; 3] = [
        BuiltinTool::InstallServer,
        BuiltinTool::SearchRegistry,
        BuiltinTool::SuggestTool,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BuiltinTool::InstallServer => "__mcp__install_server",
            BuiltinTool::SearchRegistry => "__mcp__search_registry",
            BuiltinTool::SuggestTool => "__mcp__suggest_tool",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.name() == name)
    }

    fn description(&self) -> &'static str {
        match self {
            BuiltinTool::InstallServer => install::DESCRIPTION,
            BuiltinTool::SearchRegistry => search::DESCRIPTION,
            BuiltinTool::SuggestTool => suggest::DESCRIPTION,
        }
    }

    fn input_schema(&self) -> Value {
        match self {
            BuiltinTool::InstallServer => input_schema::<InstallServerParams>(),
            BuiltinTool::SearchRegistry => input_schema::<SearchRegistryParams>(),
            BuiltinTool::SuggestTool => input_schema::<SuggestToolParams>(),
        }
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: Some(self.description().to_string()),
            input_schema: self.input_schema(),
            extra: Map::new(),
        }
    }

    /// Run the tool with raw `tools/call` arguments
    ///
    /// Malformed arguments fail with "invalid params" before the tool runs.
    pub async fn call(
        &self,
        registry: &dyn RegistryClient,
        arguments: Option<Map<String, Value>>,
    ) -> Result<ToolCallResult, RpcError> {
        let arguments = arguments.map(Value::Object);
        match self {
            BuiltinTool::InstallServer => install::install_server(parse_params(arguments)?),
            BuiltinTool::SearchRegistry => {
                search::search_registry(registry, parse_params(arguments)?).await
            }
            BuiltinTool::SuggestTool => suggest::suggest_tool(parse_params(arguments)?),
        }
    }
}

/// Definitions of every built-in tool
pub fn builtin_definitions() -> Vec<ToolDefinition> {
    BuiltinTool::ALL.iter().map(BuiltinTool::definition).collect()
}

/// JSON schema of a params type, inlined into a single object schema
fn input_schema<T: JsonSchema>() -> Value {
    let generator = SchemaSettings::draft07()
        .with(|settings| {
            settings.inline_subschemas = true;
            settings.option_add_null_type = false;
        })
        .into_generator();

    let schema = generator.into_root_schema_for::<T>();
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}));
    if let Some(object) = value.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
        object.remove("description");
        object.remove("definitions");
    }
    value
}
