//! Function documentation for system prompts.
//!
//! Wrappers describe the callable functions to the model in the style the
//! model was trained on: TypeScript-like signatures, Llama 3.2 JSON lines or
//! OpenAI-style tool objects. The schema → TypeScript type conversion lives
//! here as well.

use anyhow::{bail, Result};
use serde_json::{json, Map, Value};

use super::render::json_dumps;
use crate::history::{ChatModelFunction, ChatModelFunctions};

/// Longest run of repeated element types written out for array schemas.
const MAX_TYPE_REPETITION: u64 = 10;

pub struct FunctionsDocumentationGenerator<'a> {
    functions: &'a ChatModelFunctions,
}

fn description_of(function: &ChatModelFunction) -> Option<&str> {
    function.description.as_deref().filter(|d| !d.trim().is_empty())
}

fn comment_lines(text: &str) -> String {
    format!("// {}", text.split('\n').collect::<Vec<_>>().join("\n// "))
}

impl<'a> FunctionsDocumentationGenerator<'a> {
    pub fn new(functions: &'a ChatModelFunctions) -> Self {
        Self { functions }
    }

    pub fn has_any_functions(&self) -> bool {
        !self.functions.is_empty()
    }

    /// ```text
    /// // Retrieve the current date
    /// function getDate();
    ///
    /// // Retrieve the current time
    /// function getTime(params: {hours: "24" | "12", seconds: boolean});
    /// ```
    pub fn typescript_function_signatures(&self, document_params: bool) -> String {
        self.functions
            .iter()
            .map(|(name, function)| {
                let mut res = String::new();
                if let Some(description) = description_of(function) {
                    res.push_str(&comment_lines(description));
                    res.push('\n');
                }
                res.push_str("function ");
                res.push_str(name);
                res.push('(');
                match (&function.params, document_params) {
                    (Some(params), true) => {
                        res.push_str("params: ");
                        res.push_str(&typescript_type_for_schema(params));
                    }
                    (Some(_), false) => res.push_str("params"),
                    (None, _) => {}
                }
                res.push_str(");");
                res
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// ```text
    /// // Retrieve the current time
    /// type getTime = (_: {hours: "24" | "12"}) => any;
    /// ```
    pub fn typescript_function_types(&self, document_params: bool, reserved_function_names: &[&str]) -> Result<String> {
        let mut entries = Vec::with_capacity(self.functions.len());
        for (name, function) in self.functions.iter() {
            if reserved_function_names.contains(&name) {
                bail!("Function name \"{name}\" is reserved and cannot be used");
            }

            let mut res = String::new();
            if let Some(description) = description_of(function) {
                res.push_str(&comment_lines(description));
                res.push('\n');
            }
            res.push_str("type ");
            res.push_str(name);
            res.push_str(" = (");
            if let (Some(params), true) = (&function.params, document_params) {
                res.push_str("_: ");
                res.push_str(&typescript_type_for_schema(params));
            }
            res.push_str(") => any;");
            entries.push(res);
        }
        Ok(entries.join("\n\n"))
    }

    /// One `{"name": .., "description": .., "parameters": ..}` JSON object per
    /// function, separated by a blank line.
    pub fn llama3_2_lightweight_function_signatures(&self, document_params: bool) -> String {
        self.functions
            .iter()
            .map(|(name, function)| {
                let mut entry = Map::new();
                entry.insert("name".into(), Value::String(name.to_string()));
                if let Some(description) = description_of(function) {
                    entry.insert("description".into(), Value::String(description.to_string()));
                }
                if let (Some(params), true) = (&function.params, document_params) {
                    entry.insert("parameters".into(), params.clone());
                }
                json_dumps(&Value::Object(entry))
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// OpenAI-style tool objects, as chat templates receive them in `tools`.
    pub fn tool_definitions(&self, document_params: bool) -> Vec<Value> {
        self.functions
            .iter()
            .map(|(name, function)| {
                let mut definition = Map::new();
                definition.insert("name".into(), Value::String(name.to_string()));
                if let Some(description) = description_of(function) {
                    definition.insert("description".into(), Value::String(description.to_string()));
                }
                if let (Some(params), true) = (&function.params, document_params) {
                    definition.insert("parameters".into(), params.clone());
                }
                json!({"type": "function", "function": Value::Object(definition)})
            })
            .collect()
    }

    /// Tool objects, one per line.
    pub fn qwen_function_signatures(&self, document_params: bool) -> String {
        self.tool_definitions(document_params)
            .iter()
            .map(json_dumps)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn seed_function_signatures(&self, document_params: bool) -> String {
        self.qwen_function_signatures(document_params)
    }
}

// =============================================================================
// Schema → TypeScript
// =============================================================================

fn wrap_with_parens_if_needed(text: &str) -> String {
    if text.contains([' ', '|', '&', '\n', '\t']) {
        format!("({text})")
    } else {
        text.to_string()
    }
}

fn schema_types(schema: &Map<String, Value>) -> Vec<&str> {
    match schema.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

fn is_object_schema(schema: &Map<String, Value>) -> bool {
    schema_types(schema) == ["object"]
}

fn is_array_schema(schema: &Map<String, Value>) -> bool {
    schema_types(schema) == ["array"]
}

fn u64_field(schema: &Map<String, Value>, key: &str) -> Option<u64> {
    schema.get(key).and_then(|v| v.as_f64()).map(|v| v.max(0.0).floor() as u64)
}

/// Comment line with length, format, item and property limits of a
/// property schema.
fn property_info(schema: &Map<String, Value>) -> Vec<String> {
    let mut info = Vec::new();
    let min_of = |key: &str| u64_field(schema, key).unwrap_or(0);

    if schema_types(schema) == ["string"] {
        if let Some(format) = schema.get("format").and_then(Value::as_str) {
            if format == "date-time" {
                info.push("format: ISO 8601 date-time".to_string());
            } else {
                info.push(format!("format: {format}"));
            }
        } else {
            if min_of("minLength") > 0 {
                info.push(format!("minimum length: {}", min_of("minLength")));
            }
            if let Some(max) = u64_field(schema, "maxLength") {
                info.push(format!("maximum length: {}", max.max(min_of("minLength"))));
            }
        }
    } else if is_array_schema(schema) {
        if min_of("minItems") > MAX_TYPE_REPETITION {
            info.push(format!("minimum items: {}", min_of("minItems")));
        }
        if let Some(max) = u64_field(schema, "maxItems") {
            info.push(format!("maximum items: {}", max.max(min_of("minItems"))));
        }
    } else if is_object_schema(schema) {
        if min_of("minProperties") > 0 {
            info.push(format!("minimum number of properties: {}", min_of("minProperties")));
        }
        if let Some(max) = u64_field(schema, "maxProperties") {
            info.push(format!("maximum number of properties: {}", max.max(min_of("minProperties"))));
        }
    }

    info
}

fn object_type(schema: &Map<String, Value>) -> String {
    let mut multiline = false;
    let mut entries: Vec<String> = Vec::new();

    if let Some(Value::Object(properties)) = schema.get("properties") {
        for (name, property) in properties {
            let escaped = Value::String(name.clone()).to_string();
            let key = if escaped[1..escaped.len() - 1] == *name { name.clone() } else { escaped };
            let value_type = typescript_type_for_schema(property);
            if key.is_empty() || value_type.is_empty() {
                continue;
            }
            let mapping = format!("{key}: {value_type}");

            let mut description: Vec<String> = Vec::new();
            if let Value::Object(property) = property {
                if let Some(text) = property.get("description").and_then(Value::as_str).filter(|d| !d.is_empty()) {
                    description.push(text.to_string());
                }
                let info = property_info(property);
                if !info.is_empty() {
                    description.push(info.join(", "));
                }
            }

            if description.is_empty() {
                entries.push(mapping);
            } else {
                multiline = true;
                entries.push(format!("\n{}\n{}", comment_lines(&description.join("\n")), mapping));
            }
        }
    }

    let known = if multiline && !entries.is_empty() {
        let body = entries
            .iter()
            .map(|entry| entry.replace('\n', "\n    "))
            .collect::<Vec<_>>()
            .join(",\n    ");
        format!("{{\n    {}\n}}", body.trim_start())
    } else {
        format!("{{{}}}", entries.join(", "))
    };

    let additional = match schema.get("additionalProperties") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => None,
        Some(Value::Bool(true)) => Some("{[key: string]: any}".to_string()),
        Some(other) => Some(format!("{{[key: string]: {}}}", typescript_type_for_schema(other))),
    };

    match additional {
        Some(additional) if entries.is_empty() => additional,
        Some(additional) => format!("{known} & {additional}"),
        None => known,
    }
}

fn array_type(schema: &Map<String, Value>) -> String {
    let max_items = u64_field(schema, "maxItems");
    let min_items = u64_field(schema, "minItems");
    if max_items == Some(0) {
        return "[]".to_string();
    }

    if let Some(prefix_items) = schema.get("prefixItems").and_then(Value::as_array).filter(|p| !p.is_empty()) {
        let mut value_types: Vec<String> = prefix_items.iter().map(typescript_type_for_schema).collect();
        let rest_type = schema
            .get("items")
            .map(typescript_type_for_schema)
            .unwrap_or_else(|| "any".to_string());

        if let Some(min_items) = min_items {
            let fill_to = (prefix_items.len() as u64 + MAX_TYPE_REPETITION).min(min_items);
            for _ in prefix_items.len() as u64..fill_to {
                value_types.push(rest_type.clone());
            }
        }
        if max_items.map_or(true, |max| max > value_types.len() as u64) {
            value_types.push(format!("...{}[]", wrap_with_parens_if_needed(&rest_type)));
        }
        return format!("[{}]", value_types.join(", "));
    }

    let Some(items) = schema.get("items") else {
        return "any[]".to_string();
    };
    let values_type = typescript_type_for_schema(items);
    if values_type.is_empty() {
        return "[]".to_string();
    }
    let wrapped = wrap_with_parens_if_needed(&values_type);

    match min_items {
        Some(min) if Some(min) == max_items => {
            if min < MAX_TYPE_REPETITION {
                format!("[{}]", vec![values_type.as_str(); min as usize].join(", "))
            } else {
                format!("[{}...{wrapped}[]]", format!("{values_type}, ").repeat(MAX_TYPE_REPETITION as usize))
            }
        }
        Some(min) if min > 0 && min < MAX_TYPE_REPETITION => {
            format!("[{}...{wrapped}[]]", format!("{values_type}, ").repeat(min as usize))
        }
        _ => format!("{wrapped}[]"),
    }
}

/// TypeScript type text for a JSON schema, as shown to models in function
/// signatures.
pub fn typescript_type_for_schema(schema: &Value) -> String {
    let Value::Object(schema) = schema else {
        return String::new();
    };

    if let Some(Value::Array(one_of)) = schema.get("oneOf") {
        return one_of
            .iter()
            .map(typescript_type_for_schema)
            .collect::<Vec<_>>()
            .join(" | ");
    }
    if let Some(value) = schema.get("const") {
        return value.to_string();
    }
    if let Some(Value::Array(values)) = schema.get("enum") {
        return values.iter().map(Value::to_string).collect::<Vec<_>>().join(" | ");
    }
    if is_object_schema(schema) {
        return object_type(schema);
    }
    if is_array_schema(schema) {
        return array_type(schema);
    }

    let types = schema_types(schema);
    let mut res = Vec::new();
    for (json_type, ts_type) in [
        ("string", "string"),
        ("number", "number"),
        ("integer", "bigint"),
        ("boolean", "boolean"),
        ("null", "null"),
    ] {
        if types.contains(&json_type) {
            res.push(ts_type);
        }
    }
    res.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn functions() -> ChatModelFunctions {
        ChatModelFunctions::new()
            .with("getDate", ChatModelFunction::new(Some("Retrieve the current date"), None))
            .with(
                "getTime",
                ChatModelFunction::new(
                    Some("Retrieve the current time"),
                    Some(json!({
                        "type": "object",
                        "properties": {
                            "hours": {"enum": ["24", "12"]},
                            "seconds": {"type": "boolean"}
                        }
                    })),
                ),
            )
    }

    #[test]
    fn typescript_signatures() {
        let functions = functions();
        let docs = FunctionsDocumentationGenerator::new(&functions);
        assert_eq!(
            docs.typescript_function_signatures(true),
            "// Retrieve the current date\nfunction getDate();\n\n\
             // Retrieve the current time\nfunction getTime(params: {hours: \"24\" | \"12\", seconds: boolean});"
        );
        assert!(docs.typescript_function_signatures(false).ends_with("function getTime(params);"));
    }

    #[test]
    fn typescript_types_reject_reserved_names() {
        let functions = functions();
        let docs = FunctionsDocumentationGenerator::new(&functions);
        let types = docs.typescript_function_types(true, &[]).unwrap();
        assert!(types.contains("type getDate = () => any;"));
        let err = docs.typescript_function_types(true, &["getDate"]).unwrap_err();
        assert_eq!(err.to_string(), "Function name \"getDate\" is reserved and cannot be used");
    }

    #[test]
    fn llama3_2_signatures_are_json_lines() {
        let functions = functions();
        let docs = FunctionsDocumentationGenerator::new(&functions);
        let text = docs.llama3_2_lightweight_function_signatures(false);
        assert_eq!(
            text,
            "{\"name\": \"getDate\", \"description\": \"Retrieve the current date\"}\n\n\
             {\"name\": \"getTime\", \"description\": \"Retrieve the current time\"}"
        );
    }

    #[test]
    fn qwen_signatures_wrap_tools() {
        let functions = ChatModelFunctions::new().with("f", ChatModelFunction::default());
        let docs = FunctionsDocumentationGenerator::new(&functions);
        assert_eq!(
            docs.qwen_function_signatures(true),
            "{\"type\": \"function\", \"function\": {\"name\": \"f\"}}"
        );
    }

    #[test]
    fn described_properties_go_multiline() {
        let schema = json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "Full name", "maxLength": 20},
                "age": {"type": "integer"}
            }
        });
        assert_eq!(
            typescript_type_for_schema(&schema),
            "{\n    // Full name\n    // maximum length: 20\n    name: string,\n    age: bigint\n}"
        );
    }

    #[test]
    fn array_shapes() {
        assert_eq!(typescript_type_for_schema(&json!({"type": "array", "items": {"type": "string"}})), "string[]");
        assert_eq!(
            typescript_type_for_schema(&json!({"type": "array", "items": {"type": "number"}, "minItems": 2, "maxItems": 2})),
            "[number, number]"
        );
        assert_eq!(
            typescript_type_for_schema(&json!({"type": "array", "items": {"type": ["string", "null"]}, "minItems": 1})),
            "[string | null, ...(string | null)[]]"
        );
        assert_eq!(
            typescript_type_for_schema(&json!({"type": "array", "prefixItems": [{"type": "string"}], "maxItems": 1})),
            "[string]"
        );
        assert_eq!(typescript_type_for_schema(&json!({"type": "array"})), "any[]");
    }

    #[test]
    fn additional_properties_map() {
        assert_eq!(
            typescript_type_for_schema(&json!({"type": "object", "additionalProperties": {"type": "number"}})),
            "{[key: string]: number}"
        );
        assert_eq!(
            typescript_type_for_schema(&json!({
                "type": "object",
                "properties": {"a": {"type": "null"}},
                "additionalProperties": true
            })),
            "{a: null} & {[key: string]: any}"
        );
    }

    #[test]
    fn non_identifier_keys_are_quoted() {
        let schema = json!({"type": "object", "properties": {"a\"b": {"const": 1}}});
        assert_eq!(typescript_type_for_schema(&schema), "{\"a\\\"b\": 1}");
    }
}
