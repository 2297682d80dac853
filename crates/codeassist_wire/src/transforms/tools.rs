use log::warn;
use serde_json::{json, Map, Value};

use crate::apis::codeassist::{
    FunctionCallingConfig, FunctionCallingMode, FunctionDeclaration, ProviderTool, ToolConfig,
};
use crate::apis::openai::{Tool, ToolChoice};

/// Collect every function tool into a single `functionDeclarations` entry.
///
/// Returns `None` when nothing survives so the field is omitted upstream.
pub fn to_provider_tools(tools: &[Tool]) -> Option<Vec<ProviderTool>> {
    let declarations: Vec<FunctionDeclaration> = tools
        .iter()
        .filter_map(|tool| match (&tool.function, tool.kind.as_str()) {
            (Some(function), "function") => Some(FunctionDeclaration {
                name: function.name.clone(),
                description: function.description.clone(),
                parameters: sanitize_parameters(function.parameters.as_ref()),
            }),
            (function, kind) => {
                let name = function.as_ref().map(|f| f.name.as_str()).unwrap_or("<unnamed>");
                warn!("dropping tool '{}' of unsupported type '{}'", name, kind);
                None
            }
        })
        .collect();

    if declarations.is_empty() {
        None
    } else {
        Some(vec![ProviderTool {
            function_declarations: declarations,
        }])
    }
}

/// Schemas pass through as-is apart from the `$schema` meta key, which the
/// provider rejects.
pub fn sanitize_parameters(parameters: Option<&Value>) -> Value {
    match parameters {
        Some(Value::Object(schema)) => {
            let mut schema: Map<String, Value> = schema.clone();
            schema.remove("$schema");
            Value::Object(schema)
        }
        _ => empty_object_schema(),
    }
}

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

pub fn to_tool_config(choice: &ToolChoice) -> Option<ToolConfig> {
    let (mode, allowed) = match choice {
        ToolChoice::Mode(mode) => match mode.as_str() {
            "none" => (FunctionCallingMode::None, None),
            "auto" => (FunctionCallingMode::Auto, None),
            "required" => (FunctionCallingMode::Any, None),
            other => {
                warn!("ignoring unknown tool_choice '{}'", other);
                return None;
            }
        },
        ToolChoice::Named(named) => (
            FunctionCallingMode::Any,
            Some(vec![named.function.name.clone()]),
        ),
    };
    Some(ToolConfig {
        function_calling_config: FunctionCallingConfig {
            mode,
            allowed_function_names: allowed,
        },
    })
}
