//! JSON Schema support for function parameters.
//!
//! Two halves that must agree on what a schema accepts:
//! - [`SchemaConverter`] turns a schema into GBNF rules that constrain the
//!   model to emit matching JSON.
//! - [`validate`] checks a parsed value against the same schema after the
//!   call text was generated.
//!
//! # Supported features
//! - Types: string, integer, number, boolean, null, array, object, and
//!   unions of them
//! - Constraints: enum, const, minLength/maxLength, format (date, time,
//!   date-time)
//! - Arrays: items, prefixItems, minItems/maxItems
//! - Objects: properties, required, additionalProperties,
//!   minProperties/maxProperties (validation only)
//! - Composition: oneOf, anyOf, `$ref` into `$defs`/`definitions`

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use thiserror::Error;

/// Options for schema to grammar conversion.
#[derive(Debug, Clone)]
pub struct JsonSchemaOptions {
    /// Allow arbitrary whitespace between JSON tokens.
    pub any_whitespace: bool,
}

impl Default for JsonSchemaOptions {
    fn default() -> Self {
        Self { any_whitespace: true }
    }
}

/// Convert a schema into a standalone GBNF grammar whose `root` rule
/// accepts matching JSON values.
pub fn json_schema_to_ebnf(schema: &Value, options: &JsonSchemaOptions) -> Result<String> {
    let mut converter = SchemaConverter::new(options.clone());
    let root = converter.visit_root(schema, "value")?;
    let mut rules = vec![("root".to_string(), root)];
    rules.extend(converter.into_rules());
    Ok(rules_to_ebnf(&rules))
}

pub(crate) fn rules_to_ebnf(rules: &[(String, String)]) -> String {
    let mut out = String::new();
    for (name, body) in rules {
        out.push_str(name);
        out.push_str(" ::= ");
        out.push_str(body);
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// Converter
// ---------------------------------------------------------------------------

const JSON_CHAR: &str = r#"[^"\\\x7F\x00-\x1F] | "\\" (["\\/bfnrt] | "u" [0-9a-fA-F]{4})"#;
const JSON_NUMBER: &str = r#""-"? ("0" | [1-9] [0-9]*) ("." [0-9]+)? ([eE] [-+]? [0-9]+)?"#;
const JSON_INTEGER: &str = r#""-"? ("0" | [1-9] [0-9]*)"#;
const DATE: &str = r#"[0-9]{4} "-" ("0" [1-9] | "1" [0-2]) "-" ("0" [1-9] | [1-2] [0-9] | "3" [0-1])"#;
const TIME: &str =
    r#"([01] [0-9] | "2" [0-3]) ":" [0-5] [0-9] ":" [0-5] [0-9] ("." [0-9]{3})? ("Z" | [+-] ([01] [0-9] | "2" [0-3]) ":" [0-5] [0-9])"#;

/// Collects GBNF rules for one or more schemas. Rule names only use
/// alphanumerics and `-`, as llama.cpp grammars require.
pub struct SchemaConverter {
    options: JsonSchemaOptions,
    rules: Vec<(String, String)>,
    defined: HashSet<String>,
    aux_counter: usize,
    root: Value,
    ref_prefix: String,
}

impl SchemaConverter {
    pub fn new(options: JsonSchemaOptions) -> Self {
        Self {
            options,
            rules: Vec::new(),
            defined: HashSet::new(),
            aux_counter: 0,
            root: Value::Null,
            ref_prefix: String::new(),
        }
    }

    /// Visit a top-level schema. `$ref`s resolve against this schema and
    /// get rule names prefixed with `hint`.
    pub fn visit_root(&mut self, schema: &Value, hint: &str) -> Result<String> {
        self.root = schema.clone();
        self.ref_prefix = format!("{}-def", sanitize_rule_name(hint));
        self.visit_schema(schema, hint)
    }

    /// The rules collected so far, `ws` included when it was used.
    pub fn into_rules(self) -> Vec<(String, String)> {
        self.rules
    }

    fn ws(&self) -> &'static str {
        if self.options.any_whitespace {
            "ws"
        } else {
            "\"\""
        }
    }

    fn item_separator(&mut self) -> String {
        self.ensure_ws();
        let ws = self.ws();
        format!("{ws} \",\" {ws}")
    }

    fn key_separator(&mut self) -> String {
        self.ensure_ws();
        let ws = self.ws();
        format!("{ws} \":\" {ws}")
    }

    fn ensure_ws(&mut self) {
        if self.options.any_whitespace {
            self.ensure_rule("ws", r"[ \t\n]*");
        }
    }

    fn fresh_name(&mut self, prefix: &str) -> String {
        self.aux_counter += 1;
        format!("{}-{}", sanitize_rule_name(prefix), self.aux_counter)
    }

    fn add_rule(&mut self, name: &str, body: &str) {
        self.defined.insert(name.to_string());
        self.rules.push((name.to_string(), body.to_string()));
    }

    /// Add a shared rule once and return its name.
    fn ensure_rule(&mut self, name: &str, body: &str) -> String {
        if !self.defined.contains(name) {
            self.add_rule(name, body);
        }
        name.to_string()
    }

    fn json_string_rule(&mut self) -> String {
        let json_char = self.ensure_rule("json-char", JSON_CHAR);
        self.ensure_rule("json-string", &format!(r#""\"" {json_char}* "\"""#))
    }

    fn visit_schema(&mut self, schema: &Value, hint: &str) -> Result<String> {
        if let Some(b) = schema.as_bool() {
            if b {
                return Ok(self.visit_any());
            }
            bail!("false schema: no values are valid");
        }

        let Some(obj) = schema.as_object() else {
            bail!("schema must be an object or boolean");
        };

        if let Some(reference) = obj.get("$ref").and_then(Value::as_str) {
            return self.visit_ref(reference);
        }

        if let Some(value) = obj.get("const") {
            return Ok(json_value_to_ebnf_literal(value));
        }

        if let Some(values) = obj.get("enum") {
            let values = values.as_array().context("enum must be an array")?;
            let alts: Vec<String> = values.iter().map(json_value_to_ebnf_literal).collect();
            return Ok(format!("({})", alts.join(" | ")));
        }

        if let Some(any_of) = obj.get("oneOf").or_else(|| obj.get("anyOf")) {
            let schemas = any_of.as_array().context("oneOf must be an array")?;
            let mut alts = Vec::with_capacity(schemas.len());
            for (i, schema) in schemas.iter().enumerate() {
                alts.push(self.visit_schema(schema, &format!("{hint}-{i}"))?);
            }
            return Ok(format!("({})", alts.join(" | ")));
        }

        match obj.get("type") {
            Some(Value::String(t)) => self.visit_typed(obj, t, hint),
            Some(Value::Array(types)) => {
                let mut alts = Vec::with_capacity(types.len());
                for t in types {
                    let t = t.as_str().context("type entries must be strings")?;
                    alts.push(self.visit_typed(obj, t, hint)?);
                }
                Ok(format!("({})", alts.join(" | ")))
            }
            None => match inferred_type(obj) {
                Some(t) => self.visit_typed(obj, t, hint),
                None => Ok(self.visit_any()),
            },
            Some(_) => bail!("unexpected type value"),
        }
    }

    fn visit_ref(&mut self, reference: &str) -> Result<String> {
        let name = reference
            .strip_prefix("#/$defs/")
            .or_else(|| reference.strip_prefix("#/definitions/"));
        let Some(name) = name else {
            bail!("unsupported $ref: {reference}");
        };

        let rule_name = format!("{}-{}", self.ref_prefix, sanitize_rule_name(name));
        if self.defined.contains(&rule_name) {
            return Ok(rule_name);
        }

        let definition = lookup_ref(&self.root, reference)
            .with_context(|| format!("unresolved $ref: {reference}"))?
            .clone();
        // Reserve the name first so recursive definitions terminate.
        self.defined.insert(rule_name.clone());
        let body = self.visit_schema(&definition, &rule_name)?;
        self.rules.push((rule_name.clone(), body));
        Ok(rule_name)
    }

    fn visit_typed(&mut self, obj: &Map<String, Value>, type_name: &str, hint: &str) -> Result<String> {
        match type_name {
            "string" => self.visit_string(obj),
            "integer" => Ok(self.ensure_rule("json-integer", JSON_INTEGER)),
            "number" => Ok(self.ensure_rule("json-number", JSON_NUMBER)),
            "boolean" => Ok("(\"true\" | \"false\")".to_string()),
            "null" => Ok("\"null\"".to_string()),
            "array" => self.visit_array(obj, hint),
            "object" => self.visit_object(obj, hint),
            _ => bail!("unknown type: {type_name}"),
        }
    }

    fn visit_any(&mut self) -> String {
        if self.defined.contains("json-value") {
            return "json-value".to_string();
        }
        self.defined.insert("json-value".to_string());

        let string = self.json_string_rule();
        let number = self.ensure_rule("json-number", JSON_NUMBER);
        let sep = self.item_separator();
        let kv = self.key_separator();
        let ws = self.ws();

        self.add_rule(
            "json-object",
            &format!("\"{{\" {ws} ({string} {kv} json-value ({sep} {string} {kv} json-value)*)? {ws} \"}}\""),
        );
        self.add_rule("json-array", &format!("\"[\" {ws} (json-value ({sep} json-value)*)? {ws} \"]\""));
        self.rules.push((
            "json-value".to_string(),
            format!("json-object | json-array | {string} | {number} | \"true\" | \"false\" | \"null\""),
        ));
        "json-value".to_string()
    }

    fn visit_string(&mut self, obj: &Map<String, Value>) -> Result<String> {
        if let Some(format) = obj.get("format").and_then(Value::as_str) {
            let body = match format {
                "date" => Some(self.ensure_rule("json-date", DATE)),
                "time" => Some(self.ensure_rule("json-time", TIME)),
                "date-time" => {
                    let date = self.ensure_rule("json-date", DATE);
                    let time = self.ensure_rule("json-time", TIME);
                    Some(self.ensure_rule("json-date-time", &format!("{date} \"T\" {time}")))
                }
                _ => None,
            };
            if let Some(body) = body {
                return Ok(format!(r#""\"" {body} "\"""#));
            }
        }

        let min_len = obj.get("minLength").and_then(Value::as_u64).unwrap_or(0);
        let max_len = obj.get("maxLength").and_then(Value::as_u64).map(|max| max.max(min_len));
        if min_len == 0 && max_len.is_none() {
            return Ok(self.json_string_rule());
        }

        let json_char = self.ensure_rule("json-char", JSON_CHAR);
        let repeat = repetition_suffix(min_len as usize, max_len.map(|m| m as usize));
        if repeat.is_empty() {
            return Ok(r#""\"" "\"""#.to_string());
        }
        Ok(format!(r#""\"" {json_char}{repeat} "\"""#))
    }

    fn visit_array(&mut self, obj: &Map<String, Value>, hint: &str) -> Result<String> {
        let sep = self.item_separator();
        let ws = self.ws();

        let mut fixed = Vec::new();
        if let Some(prefix) = obj.get("prefixItems").and_then(Value::as_array) {
            for (i, item) in prefix.iter().enumerate() {
                fixed.push(self.visit_schema(item, &format!("{hint}-item-{i}"))?);
            }
        }

        let additional = match obj.get("items") {
            None | Some(Value::Bool(false)) => None,
            Some(items) => Some(self.visit_schema(items, &format!("{hint}-items"))?),
        };

        let min_items = (obj.get("minItems").and_then(Value::as_u64).unwrap_or(0) as usize).max(fixed.len());
        let max_items = obj
            .get("maxItems")
            .and_then(Value::as_u64)
            .map(|max| (max as usize).max(min_items));

        let mut body = format!("\"[\" {ws}");

        if fixed.is_empty() {
            let Some(item) = additional else {
                return Ok(format!("\"[\" {ws} \"]\""));
            };
            if max_items == Some(0) {
                return Ok(format!("\"[\" {ws} \"]\""));
            }
            let rest = repetition_suffix(min_items.saturating_sub(1), max_items.map(|m| m - 1));
            let rest = if rest.is_empty() {
                String::new()
            } else {
                format!(" ({sep} {item}){rest}")
            };
            if min_items == 0 {
                body.push_str(&format!(" ({item}{rest})?"));
            } else {
                body.push_str(&format!(" {item}{rest}"));
            }
        } else {
            for (i, element) in fixed.iter().enumerate() {
                if i == 0 {
                    body.push_str(&format!(" {element}"));
                } else {
                    body.push_str(&format!(" {sep} {element}"));
                }
            }
            if let Some(item) = additional {
                let rest = repetition_suffix(
                    min_items.saturating_sub(fixed.len()),
                    max_items.map(|m| m.saturating_sub(fixed.len())),
                );
                if !rest.is_empty() {
                    body.push_str(&format!(" ({sep} {item}){rest}"));
                }
            }
        }

        body.push_str(&format!(" {ws} \"]\""));
        Ok(body)
    }

    fn visit_object(&mut self, obj: &Map<String, Value>, hint: &str) -> Result<String> {
        let sep = self.item_separator();
        let kv = self.key_separator();
        let ws = self.ws();

        let empty = Map::new();
        let properties = obj.get("properties").and_then(Value::as_object).unwrap_or(&empty);
        let required = required_keys(obj, properties);

        let mut required_pairs = Vec::new();
        let mut optional_pairs = Vec::new();
        for (key, schema) in properties {
            let value = self.visit_schema(schema, &format!("{hint}-{}", sanitize_rule_name(key)))?;
            let pair = format!(r#""\"{}\"" {kv} {value}"#, escape_for_ebnf_string(&escape_json_string(key)));
            if required.contains(key.as_str()) {
                required_pairs.push(pair);
            } else {
                optional_pairs.push(pair);
            }
        }

        let additional_pair = match obj.get("additionalProperties") {
            None | Some(Value::Bool(false)) => None,
            Some(Value::Bool(true)) => {
                let value = self.visit_any();
                let key = self.json_string_rule();
                Some(format!("{key} {kv} {value}"))
            }
            Some(schema) => {
                let value = self.visit_schema(schema, &format!("{hint}-additional"))?;
                let key = self.json_string_rule();
                Some(format!("{key} {kv} {value}"))
            }
        };

        let mut body = format!("\"{{\" {ws}");
        if required_pairs.is_empty() {
            // Every member is optional: the first present one carries no
            // leading separator.
            let mut members = optional_pairs.clone();
            if let Some(pair) = &additional_pair {
                members.push(pair.clone());
            }
            if !members.is_empty() {
                let alternatives: Vec<String> = (0..members.len())
                    .map(|start| optional_tail(&members[start..], &sep, additional_pair.is_some()))
                    .collect();
                body.push_str(&format!(" ({})?", alternatives.join(" | ")));
            }
        } else {
            body.push(' ');
            body.push_str(&required_pairs.join(&format!(" {sep} ")));
            for pair in &optional_pairs {
                body.push_str(&format!(" ({sep} {pair})?"));
            }
            if let Some(pair) = &additional_pair {
                body.push_str(&format!(" ({sep} {pair})*"));
            }
        }
        body.push_str(&format!(" {ws} \"}}\""));

        if body.len() > 512 {
            let name = self.fresh_name(&format!("{hint}-object"));
            self.add_rule(&name, &body);
            return Ok(name);
        }
        Ok(body)
    }
}

/// `members[0]` followed by each later member as an optional item. When the
/// last member is the additional-properties pair it may repeat.
fn optional_tail(members: &[String], sep: &str, last_repeats: bool) -> String {
    let mut out = members[0].clone();
    let repeats_first = last_repeats && members.len() == 1;
    if repeats_first {
        out.push_str(&format!(" ({sep} {})*", members[0]));
        return out;
    }
    for (i, member) in members.iter().enumerate().skip(1) {
        let mark = if last_repeats && i == members.len() - 1 { "*" } else { "?" };
        out.push_str(&format!(" ({sep} {member}){mark}"));
    }
    out
}

fn inferred_type(obj: &Map<String, Value>) -> Option<&'static str> {
    let has = |keys: &[&str]| keys.iter().any(|key| obj.contains_key(*key));
    if has(&["properties", "required", "additionalProperties", "minProperties", "maxProperties"]) {
        Some("object")
    } else if has(&["items", "prefixItems", "minItems", "maxItems"]) {
        Some("array")
    } else if has(&["minLength", "maxLength", "format"]) {
        Some("string")
    } else {
        None
    }
}

/// Keys listed in `required`, or every property when `required` is absent.
fn required_keys<'a>(obj: &'a Map<String, Value>, properties: &'a Map<String, Value>) -> HashSet<&'a str> {
    match obj.get("required").and_then(Value::as_array) {
        Some(keys) => keys.iter().filter_map(Value::as_str).collect(),
        None => properties.keys().map(String::as_str).collect(),
    }
}

fn lookup_ref<'a>(root: &'a Value, reference: &str) -> Option<&'a Value> {
    let path = reference.strip_prefix("#/")?;
    path.split('/').try_fold(root, |node, segment| node.get(segment))
}

fn json_value_to_ebnf_literal(value: &Value) -> String {
    format!("\"{}\"", escape_for_ebnf_string(&value.to_string()))
}

fn escape_for_ebnf_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out
}

fn escape_json_string(s: &str) -> String {
    let quoted = Value::String(s.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

/// Quote `text` as a GBNF literal.
pub(crate) fn ebnf_literal(text: &str) -> String {
    format!("\"{}\"", escape_for_ebnf_string(text))
}

fn repetition_suffix(min: usize, max: Option<usize>) -> String {
    match (min, max) {
        (0, None) => "*".to_string(),
        (0, Some(0)) => String::new(),
        (1, None) => "+".to_string(),
        (0, Some(1)) => "?".to_string(),
        (min, None) => format!("{{{min},}}"),
        (min, Some(max)) if min == max => format!("{{{min}}}"),
        (min, Some(max)) => format!("{{{min},{max}}}"),
    }
}

pub(crate) fn sanitize_rule_name(name: &str) -> String {
    let out: String = name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '-' })
        .collect();
    if out.is_empty() {
        "rule".to_string()
    } else {
        out
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A value that does not match its schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SchemaValidationError {
    pub message: String,
}

impl SchemaValidationError {
    fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

type Validation = std::result::Result<(), SchemaValidationError>;

/// Check `value` against `schema`.
pub fn validate(value: &Value, schema: &Value) -> Validation {
    Validator { root: schema }.check(value, schema)
}

struct Validator<'s> {
    root: &'s Value,
}

impl Validator<'_> {
    fn check(&self, value: &Value, schema: &Value) -> Validation {
        let Some(obj) = schema.as_object() else {
            return match schema.as_bool() {
                Some(false) => Err(SchemaValidationError::new("No value matches a false schema")),
                _ => Ok(()),
            };
        };

        if let Some(reference) = obj.get("$ref").and_then(Value::as_str) {
            let target = lookup_ref(self.root, reference)
                .ok_or_else(|| SchemaValidationError::new(format!("Unresolved reference \"{reference}\"")))?;
            return self.check(value, target);
        }

        if let Some(expected) = obj.get("const") {
            if value == expected {
                return Ok(());
            }
            return Err(SchemaValidationError::new(format!("Expected {expected} but got {value}")));
        }

        if let Some(values) = obj.get("enum").and_then(Value::as_array) {
            if values.contains(value) {
                return Ok(());
            }
            let listed: Vec<String> = values.iter().map(Value::to_string).collect();
            return Err(SchemaValidationError::new(format!(
                "Expected one of [{}] but got {value}",
                listed.join(", ")
            )));
        }

        if let Some(options) = obj.get("oneOf").or_else(|| obj.get("anyOf")).and_then(Value::as_array) {
            if options.iter().any(|option| self.check(value, option).is_ok()) {
                return Ok(());
            }
            return Err(SchemaValidationError::new(format!(
                "Expected one of {} schemas but got {value}",
                options.len()
            )));
        }

        match obj.get("type") {
            Some(Value::String(t)) => self.check_typed(value, obj, t),
            Some(Value::Array(types)) => {
                for t in types.iter().filter_map(Value::as_str) {
                    if matches_type(value, t)? {
                        return match t {
                            "array" | "object" | "string" => self.check_typed(value, obj, t),
                            _ => Ok(()),
                        };
                    }
                }
                let listed: Vec<String> = types.iter().map(Value::to_string).collect();
                Err(SchemaValidationError::new(format!(
                    "Expected one type of [{}] but got type \"{}\"",
                    listed.join(", "),
                    js_type_name(value)
                )))
            }
            None => match inferred_type(obj) {
                Some(t) => self.check_typed(value, obj, t),
                None => Ok(()),
            },
            Some(other) => Err(SchemaValidationError::new(format!("Unknown immutable type {other}"))),
        }
    }

    fn check_typed(&self, value: &Value, obj: &Map<String, Value>, type_name: &str) -> Validation {
        match type_name {
            "array" => self.check_array(value, obj),
            "object" => self.check_object(value, obj),
            "string" => check_string(value, obj),
            _ => {
                if matches_type(value, type_name)? {
                    Ok(())
                } else {
                    Err(SchemaValidationError::new(format!(
                        "Expected type \"{type_name}\" but got \"{}\"",
                        js_type_name(value)
                    )))
                }
            }
        }
    }

    fn check_array(&self, value: &Value, obj: &Map<String, Value>) -> Validation {
        let Some(items) = value.as_array() else {
            return Err(SchemaValidationError::new(format!(
                "Expected an array but got \"{}\"",
                js_type_name(value)
            )));
        };

        let prefix = obj.get("prefixItems").and_then(Value::as_array);
        let min_items = (obj.get("minItems").and_then(Value::as_u64).unwrap_or(0) as usize)
            .max(prefix.map_or(0, Vec::len));
        let max_items = obj
            .get("maxItems")
            .and_then(Value::as_u64)
            .map(|max| (max as usize).max(min_items));
        check_count(items.len(), min_items, max_items, "items")?;

        let mut index = 0;
        if let Some(prefix) = prefix {
            for schema in prefix {
                self.check(&items[index], schema)?;
                index += 1;
            }
        }
        if let Some(schema) = obj.get("items") {
            for item in &items[index..] {
                self.check(item, schema)?;
            }
        }
        Ok(())
    }

    fn check_object(&self, value: &Value, obj: &Map<String, Value>) -> Validation {
        let Some(map) = value.as_object() else {
            return Err(SchemaValidationError::new(format!(
                "Expected an object but got \"{}\"",
                js_type_name(value)
            )));
        };

        let empty = Map::new();
        let properties = obj.get("properties").and_then(Value::as_object).unwrap_or(&empty);
        let required = required_keys(obj, properties);
        let additional = obj.get("additionalProperties");

        let extra: Vec<&String> = map.keys().filter(|key| !properties.contains_key(*key)).collect();
        if !extra.is_empty() {
            match additional {
                None | Some(Value::Bool(false)) => {
                    return Err(SchemaValidationError::new(format!("Unexpected keys: {}", quoted_keys(extra))));
                }
                Some(Value::Bool(true)) => {}
                Some(schema) => {
                    for key in &extra {
                        self.check(&map[key.as_str()], schema)?;
                    }
                }
            }
        }

        let missing: Vec<&String> = properties
            .keys()
            .filter(|key| required.contains(key.as_str()) && !map.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(SchemaValidationError::new(format!("Missing keys: {}", quoted_keys(missing))));
        }

        for (key, schema) in properties {
            if let Some(item) = map.get(key) {
                self.check(item, schema)?;
            }
        }

        if matches!(additional, Some(a) if a != &Value::Bool(false)) {
            let min = (obj.get("minProperties").and_then(Value::as_u64).unwrap_or(0) as usize).max(required.len());
            let max = obj
                .get("maxProperties")
                .and_then(Value::as_u64)
                .map(|max| (max as usize).max(min));
            check_count(map.len(), min, max, "properties")?;
        }
        Ok(())
    }
}

fn check_string(value: &Value, obj: &Map<String, Value>) -> Validation {
    let Some(text) = value.as_str() else {
        return Err(SchemaValidationError::new(format!(
            "Expected type \"string\" but got \"{}\"",
            js_type_name(value)
        )));
    };

    if let Some(format) = obj.get("format").and_then(Value::as_str) {
        let valid = match format {
            "date" => is_date(text),
            "time" => is_time(text),
            "date-time" => text.split_once('T').is_some_and(|(date, time)| is_date(date) && is_time(time)),
            _ => return Err(SchemaValidationError::new(format!("Unknown format \"{format}\""))),
        };
        if valid {
            return Ok(());
        }
        return Err(SchemaValidationError::new(format!(
            "Expected a valid {format} string but got {value}"
        )));
    }

    let min = obj.get("minLength").and_then(Value::as_u64).unwrap_or(0) as usize;
    let max = obj.get("maxLength").and_then(Value::as_u64).map(|max| (max as usize).max(min));
    check_count(text.chars().count(), min, max, "characters")
}

fn check_count(count: usize, min: usize, max: Option<usize>, unit: &str) -> Validation {
    let exact = max == Some(min);
    if count < min {
        if exact {
            return Err(SchemaValidationError::new(format!("Expected exactly {min} {unit} but got {count}")));
        }
        return Err(SchemaValidationError::new(format!("Expected at least {min} {unit} but got {count}")));
    }
    if let Some(max) = max.filter(|max| count > *max) {
        if exact {
            return Err(SchemaValidationError::new(format!("Expected exactly {min} {unit} but got {count}")));
        }
        return Err(SchemaValidationError::new(format!("Expected at most {max} {unit} but got {count}")));
    }
    Ok(())
}

fn matches_type(value: &Value, type_name: &str) -> std::result::Result<bool, SchemaValidationError> {
    Ok(match type_name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => match value {
            Value::Number(n) => n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0),
            _ => false,
        },
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        other => {
            return Err(SchemaValidationError::new(format!("Unknown immutable type \"{other}\"")));
        }
    })
}

/// The name JavaScript's `typeof` gives a JSON value, with `null` spelled
/// out.
fn js_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) | Value::Object(_) => "object",
    }
}

fn quoted_keys(keys: Vec<&String>) -> String {
    keys.iter()
        .map(|key| Value::String(key.to_string()).to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn digits(text: &str) -> Option<u32> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// `YYYY-MM-DD` with month 01-12 and day 01-31.
fn is_date(text: &str) -> bool {
    let parts: Vec<&str> = text.split('-').collect();
    let [year, month, day] = parts.as_slice() else {
        return false;
    };
    year.len() == 4
        && digits(year).is_some()
        && month.len() == 2
        && digits(month).is_some_and(|m| (1..=12).contains(&m))
        && day.len() == 2
        && digits(day).is_some_and(|d| (1..=31).contains(&d))
}

fn is_hh_mm(hours: &str, minutes: &str) -> bool {
    hours.len() == 2
        && digits(hours).is_some_and(|h| h <= 23)
        && minutes.len() == 2
        && digits(minutes).is_some_and(|m| m <= 59)
}

/// `HH:MM:SS[.mmm]` followed by `Z` or a `+HH:MM`/`-HH:MM` offset.
fn is_time(text: &str) -> bool {
    let (clock, zone) = match text.find(['Z', '+', '-']) {
        Some(i) => text.split_at(i),
        None => return false,
    };

    let zone_ok = zone == "Z"
        || match zone[1..].split_once(':') {
            Some((hours, minutes)) => (hours.is_empty() && minutes.len() == 2 && digits(minutes).is_some_and(|m| m <= 59))
                || is_hh_mm(hours, minutes),
            None => false,
        };
    if !zone_ok {
        return false;
    }

    let (clock, fraction) = match clock.split_once('.') {
        Some((clock, fraction)) => (clock, Some(fraction)),
        None => (clock, None),
    };
    if fraction.is_some_and(|f| f.len() != 3 || digits(f).is_none()) {
        return false;
    }

    let parts: Vec<&str> = clock.split(':').collect();
    let [hours, minutes, seconds] = parts.as_slice() else {
        return false;
    };
    is_hh_mm(hours, minutes) && seconds.len() == 2 && digits(seconds).is_some_and(|s| s <= 59)
}
