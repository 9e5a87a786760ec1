use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::llm::ToolDefinition;

/// Executes one tool call. Handlers for remote tools (database, knowledge
/// base) resolve an endpoint through the registry on every call; handlers
/// may also be pure in-process logic (relevance signalling).
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: serde_json::Value) -> Result<String>;
}

pub struct ToolSpec {
    pub definition: ToolDefinition,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolSpec {
    pub fn new(
        name: &str,
        description: &str,
        parameters: serde_json::Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            definition: ToolDefinition {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
            handler,
        }
    }
}

/// The tool set offered to one loop invocation.
#[derive(Default)]
pub struct ToolCatalog {
    tools: HashMap<String, ToolSpec>,
    order: Vec<String>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: ToolSpec) {
        self.order.push(spec.definition.name.clone());
        self.tools.insert(spec.definition.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|spec| spec.definition.clone())
            .collect()
    }
}

/// Validate tool-call arguments against the advertised JSON schema. Covers
/// what the stage schemas actually use: an object with typed properties and
/// a `required` list.
pub fn validate_args(schema: &serde_json::Value, args: &serde_json::Value) -> Result<(), String> {
    let object = match args {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null if required_names(schema).is_empty() => return Ok(()),
        other => return Err(format!("expected an object of arguments, got {other}")),
    };

    for name in required_names(schema) {
        if !object.contains_key(&name) {
            return Err(format!("missing required argument '{name}'"));
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, value) in object {
            let Some(prop) = properties.get(key) else {
                return Err(format!("unknown argument '{key}'"));
            };
            let Some(expected) = prop.get("type").and_then(|t| t.as_str()) else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "boolean" => value.is_boolean(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(format!("argument '{key}' should be of type {expected}"));
            }
        }
    }

    Ok(())
}

fn required_names(schema: &serde_json::Value) -> Vec<String> {
    schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|names| {
            names
                .iter()
                .filter_map(|n| n.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// Schema helper: an object schema from (name, type, description) triples
/// where every listed property is required.
pub fn object_schema(props: &[(&str, &str, &str)]) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for (name, kind, description) in props {
        properties.insert(
            name.to_string(),
            serde_json::json!({ "type": kind, "description": description }),
        );
        required.push(serde_json::Value::String(name.to_string()));
    }
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, args: serde_json::Value) -> Result<String> {
            Ok(args.to_string())
        }
    }

    #[test]
    fn catalog_preserves_registration_order() {
        let mut catalog = ToolCatalog::new();
        for name in ["search_knowledge_base", "list_tables", "describe_table"] {
            catalog.register(ToolSpec::new(name, "", object_schema(&[]), Arc::new(Echo)));
        }
        let names: Vec<String> = catalog.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec!["search_knowledge_base", "list_tables", "describe_table"]
        );
    }

    #[test]
    fn validate_rejects_missing_required() {
        let schema = object_schema(&[("name", "string", "table name")]);
        let err = validate_args(&schema, &serde_json::json!({})).unwrap_err();
        assert!(err.contains("missing required argument 'name'"));
    }

    #[test]
    fn validate_rejects_wrong_type() {
        let schema = object_schema(&[("name", "string", "table name")]);
        let err = validate_args(&schema, &serde_json::json!({ "name": 7 })).unwrap_err();
        assert!(err.contains("should be of type string"));
    }

    #[test]
    fn validate_rejects_unknown_argument() {
        let schema = object_schema(&[("query", "string", "search text")]);
        let err =
            validate_args(&schema, &serde_json::json!({ "query": "x", "k": 4 })).unwrap_err();
        assert!(err.contains("unknown argument 'k'"));
    }

    #[test]
    fn validate_accepts_null_args_for_parameterless_tools() {
        let schema = object_schema(&[]);
        assert!(validate_args(&schema, &serde_json::Value::Null).is_ok());
    }

    #[test]
    fn validate_accepts_well_typed_args() {
        let schema = object_schema(&[
            ("reason", "string", "why"),
            ("is_relevant", "boolean", "verdict"),
        ]);
        let args = serde_json::json!({ "reason": "off topic", "is_relevant": false });
        assert!(validate_args(&schema, &args).is_ok());
    }
}
