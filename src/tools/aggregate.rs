/// Aggregated tool listing across the broker and its children
///
/// Tools are registered source by source. The first source to register a
/// name owns it; later tools with the same name are dropped with a warning.
/// The same index answers both `tools/list` and the routing of `tools/call`,
/// so a listed tool always routes to the owner that listed it.

use std::collections::HashMap;

use crate::mcp::ToolDefinition;
use crate::tools::BuiltinTool;

/// Who serves a tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOwner {
    Builtin(BuiltinTool),
    /// A running integration, by integration id
    Integration(String),
}

/// Duplicate-free tool listing with owners
#[derive(Debug, Default)]
pub struct ToolIndex {
    tools: Vec<ToolDefinition>,
    owners: HashMap<String, ToolOwner>,
}

impl ToolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// An index holding only the built-in tools
    pub fn with_builtins() -> Self {
        let mut index = Self::new();
        for tool in BuiltinTool::ALL {
            index.register(ToolOwner::Builtin(tool), [tool.definition()]);
        }
        index
    }

    /// Add `tools` served by `owner`, skipping names already taken
    ///
    /// Returns how many tools were accepted.
    pub fn register<I>(&mut self, owner: ToolOwner, tools: I) -> usize
    where
        I: IntoIterator<Item = ToolDefinition>,
    {
        let mut accepted = 0;
        for tool in tools {
            if let Some(existing) = self.owners.get(&tool.name) {
                tracing::warn!(
                    tool = %tool.name,
                    kept = ?existing,
                    dropped = ?owner,
                    "duplicate tool name, keeping the first registration"
                );
                continue;
            }

            self.owners.insert(tool.name.clone(), owner.clone());
            self.tools.push(tool);
            accepted += 1;
        }
        accepted
    }

    pub fn owner(&self, name: &str) -> Option<&ToolOwner> {
        self.owners.get(name)
    }

    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn into_tools(self) -> Vec<ToolDefinition> {
        self.tools
    }
}
