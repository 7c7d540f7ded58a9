/// Built-in tools and tool aggregation
use mcp_broker::jsonrpc::ErrorCode;
use mcp_broker::mcp::ToolDefinition;
use mcp_broker::tools::{builtin_definitions, BuiltinTool, ToolIndex, ToolOwner};
use mcp_broker::BundledRegistry;
use serde_json::{json, Map, Value};
use tokio_test::{assert_err, assert_ok};

fn tool(name: &str) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: None,
        input_schema: json!({"type": "object"}),
        extra: Map::new(),
    }
}

fn arguments(value: Value) -> Option<Map<String, Value>> {
    value.as_object().cloned()
}

#[test]
fn test_duplicate_names_across_sources_are_listed_once() {
    let mut index = ToolIndex::with_builtins();
    let a = ToolOwner::Integration("a".to_string());
    let b = ToolOwner::Integration("b".to_string());

    assert_eq!(index.register(a.clone(), [tool("search"), tool("fetch")]), 2);
    assert_eq!(index.register(b.clone(), [tool("search"), tool("__mcp__suggest_tool")]), 0);

    let names: Vec<&str> = index.tools().iter().map(|t| t.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "__mcp__install_server",
            "__mcp__search_registry",
            "__mcp__suggest_tool",
            "search",
            "fetch"
        ]
    );
    assert_eq!(index.owner("search"), Some(&a));
    assert_eq!(
        index.owner("__mcp__suggest_tool"),
        Some(&ToolOwner::Builtin(BuiltinTool::SuggestTool))
    );
}

#[test]
fn test_aggregation_is_idempotent() {
    let build = || {
        let mut index = ToolIndex::with_builtins();
        index.register(ToolOwner::Integration("a".into()), [tool("x"), tool("x")]);
        index.register(ToolOwner::Integration("b".into()), [tool("y"), tool("x")]);
        index.into_tools()
    };

    let first = build();
    assert_eq!(first, build());
    assert_eq!(first.len(), 5);
}

#[test]
fn test_builtin_definitions_have_object_schemas() {
    let definitions = builtin_definitions();
    assert_eq!(definitions.len(), 3);
    for definition in definitions {
        assert_eq!(definition.input_schema["type"], json!("object"));
        assert!(definition.description.is_some());
    }
}

#[tokio::test]
async fn test_builtin_calls() {
    let registry = BundledRegistry::new().unwrap();

    let found = assert_ok!(
        BuiltinTool::SearchRegistry
            .call(&registry, arguments(json!({"query": "github"})))
            .await
    );
    assert!(!found.is_error);
    assert!(found.content[0].text.contains("@modelcontextprotocol/server-github"));

    let none = BuiltinTool::SearchRegistry
        .call(&registry, arguments(json!({"query": "zzzz-nothing-matches"})))
        .await
        .unwrap();
    assert!(!none.is_error);
    assert!(none.content[0].text.starts_with("no servers found"));

    let err = assert_err!(
        BuiltinTool::InstallServer
            .call(&registry, arguments(json!({"name": "only-a-name"})))
            .await
    );
    assert_eq!(err.code, ErrorCode::InvalidParams);

    let err = BuiltinTool::SuggestTool
        .call(
            &registry,
            arguments(json!({"tools": [{"name": "translate", "description": "Translate text"}]})),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InternalError);
}
