//! Function-call grammar and call parsing.
//!
//! The grammar accepts exactly one call in the active wrapper's syntax:
//!
//! ```text
//! root ::= [ ]? prefix ( "name" paramsPrefix params | ... ) suffix [\n]{4} [\n]*
//! ```
//!
//! Generation stops on `suffix` followed by four newlines, so a finished
//! call always carries that padding. [`parse_function_call`] pads the text
//! the same way before searching for the suffix, which also finds a suffix
//! at the very end of a call that stopped early.

use anyhow::{bail, Result};
use serde_json::Value;
use thiserror::Error;

use super::json_schema::{self, ebnf_literal, rules_to_ebnf, JsonSchemaOptions, SchemaConverter};
use crate::history::{ChatModelFunctionCall, ChatModelFunctions};
use crate::text::LlamaText;
use crate::wrapper::ChatWrapper;

const SUFFIX_PADDING: &str = "\n\n\n\n";

/// A generated call that does not fit the wrapper's syntax or the
/// function table.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct FunctionCallValidationError {
    pub message: String,
    pub call_text: String,
    pub function_names: Vec<String>,
    pub wrapper_name: String,
}

impl FunctionCallValidationError {
    fn new(message: String, call_text: &str, functions: &ChatModelFunctions, wrapper: &dyn ChatWrapper) -> Self {
        Self {
            message,
            call_text: call_text.to_string(),
            function_names: functions.names().map(str::to_string).collect(),
            wrapper_name: wrapper.wrapper_name().to_string(),
        }
    }
}

/// A parsed, validated call.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub function_name: String,
    pub params: Option<Value>,
    /// The call text up to and including the suffix.
    pub raw: String,
}

impl FunctionCall {
    /// The history entry for this call once its result is known.
    pub fn into_history_call(self, result: Option<Value>) -> ChatModelFunctionCall {
        ChatModelFunctionCall::new(self.function_name, self.params, result).with_raw(self.raw)
    }
}

// =============================================================================
// Grammar
// =============================================================================

/// GBNF grammar for one function call.
#[derive(Debug, Clone)]
pub struct FunctionCallGrammar {
    rules: Vec<(String, String)>,
    stop_generation_triggers: Vec<LlamaText>,
}

impl FunctionCallGrammar {
    pub fn new(functions: &ChatModelFunctions, wrapper: &dyn ChatWrapper, initial_function_call_engaged: bool) -> Result<Self> {
        for name in functions.names() {
            if name.contains([' ', '\n', '\t']) {
                bail!("Function name \"{name}\" contains spaces, new lines or tabs");
            }
        }

        let call = &wrapper.settings().functions.call;
        let params_prefix = call.params_prefix.to_string();
        let internal = wrapper.internal_builtin_functions(initial_function_call_engaged);

        let mut converter = SchemaConverter::new(JsonSchemaOptions::default());
        let mut alternatives = Vec::new();
        for (i, (name, function)) in functions.iter().chain(internal.iter()).enumerate() {
            let head = ebnf_literal(&format!("{name}{params_prefix}"));
            match &function.params {
                Some(schema) => {
                    let params = converter.visit_root(schema, &format!("fn{i}-params"))?;
                    alternatives.push(format!("{head} {params}"));
                }
                None => alternatives.push(head),
            }
        }
        if alternatives.is_empty() {
            bail!("A function call grammar needs at least one function");
        }

        let mut root = Vec::new();
        if call.optional_prefix_space {
            root.push("[ ]?".to_string());
        }
        let prefix = call.prefix.to_string();
        if !prefix.is_empty() {
            root.push(ebnf_literal(&prefix));
        }
        root.push(format!("({})", alternatives.join(" | ")));
        let suffix = call.suffix.to_string();
        if !suffix.is_empty() {
            root.push(ebnf_literal(&suffix));
        }
        root.push("[\\n] [\\n] [\\n] [\\n] [\\n]*".to_string());

        let mut rules = vec![("root".to_string(), root.join(" "))];
        rules.extend(converter.into_rules());

        Ok(Self {
            rules,
            stop_generation_triggers: vec![LlamaText::from_parts([
                call.suffix.clone(),
                LlamaText::from(SUFFIX_PADDING),
            ])],
        })
    }

    pub fn root_rule(&self) -> &str {
        &self.rules[0].1
    }

    pub fn rules(&self) -> &[(String, String)] {
        &self.rules
    }

    pub fn stop_generation_triggers(&self) -> &[LlamaText] {
        &self.stop_generation_triggers
    }

    pub fn to_ebnf(&self) -> String {
        rules_to_ebnf(&self.rules)
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Splits call text into its name and what follows the params prefix.
struct CallHead<'t> {
    text: &'t str,
    name: &'t str,
    params_start: usize,
}

fn parse_call_head<'t>(
    call_text: &'t str,
    functions: &ChatModelFunctions,
    wrapper: &dyn ChatWrapper,
) -> Result<CallHead<'t>, FunctionCallValidationError> {
    let call = &wrapper.settings().functions.call;
    let prefix = call.prefix.to_string();
    let params_prefix = call.params_prefix.to_string();
    let error = |message: String, text: &str| FunctionCallValidationError::new(message, text, functions, wrapper);

    let mut text = call_text;
    if call.optional_prefix_space && !text.starts_with(&prefix) && text.starts_with(' ') {
        text = &text[1..];
    }

    if !text.starts_with(&prefix) {
        return Err(error(
            format!(
                "Expected function call to start with function call prefix from \"{}\" chat wrapper",
                wrapper.wrapper_name()
            ),
            text,
        ));
    }

    let Some(params_index) = text[prefix.len()..].find(&params_prefix).map(|i| i + prefix.len()) else {
        return Err(error(
            format!(
                "Expected function call to contain params prefix from \"{}\" chat wrapper",
                wrapper.wrapper_name()
            ),
            text,
        ));
    };

    Ok(CallHead {
        text,
        name: &text[prefix.len()..params_index],
        params_start: params_index + params_prefix.len(),
    })
}

/// Parse and validate a completed call.
pub fn parse_function_call(
    call_text: &str,
    functions: &ChatModelFunctions,
    wrapper: &dyn ChatWrapper,
) -> Result<FunctionCall, FunctionCallValidationError> {
    let head = parse_call_head(call_text, functions, wrapper)?;
    let text = head.text;
    let error = |message: String| FunctionCallValidationError::new(message, text, functions, wrapper);

    let Some(function) = functions.get(head.name) else {
        return Err(error(format!(
            "Function name \"{}\" is not in the supplied functions object",
            head.name
        )));
    };

    let suffix = wrapper.settings().functions.call.suffix.to_string();
    let padded = format!("{text}{SUFFIX_PADDING}");
    let suffix_index = padded.rfind(&format!("{suffix}{SUFFIX_PADDING}"));
    let suffix_index = match suffix_index {
        Some(index) if index >= head.params_start => index,
        _ => {
            return Err(error(format!(
                "Expected function call to end with function call suffix from \"{}\" chat wrapper",
                wrapper.wrapper_name()
            )))
        }
    };

    let params_text = &text[head.params_start..suffix_index];
    let raw = text[..(suffix_index + suffix.len()).min(text.len())].to_string();

    let Some(schema) = &function.params else {
        if !params_text.trim().is_empty() {
            return Err(error(format!(
                "Expected function call to not contain params string but got \"{params_text}\""
            )));
        }
        return Ok(FunctionCall {
            function_name: head.name.to_string(),
            params: None,
            raw,
        });
    };

    let params: Value = serde_json::from_str(params_text)
        .map_err(|err| error(format!("Failed to parse function call params as JSON: {err}")))?;
    json_schema::validate(&params, schema).map_err(|err| error(err.message))?;

    Ok(FunctionCall {
        function_name: head.name.to_string(),
        params: Some(params),
        raw,
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ParseNameOptions {
    /// Also accept the wrapper's internal builtin functions.
    pub enable_internal_builtin_functions: bool,
    pub initial_function_call_engaged: bool,
}

/// Read only the function name of a call that may still be generating.
pub fn parse_function_name_from_partial_call(
    call_text: &str,
    functions: &ChatModelFunctions,
    wrapper: &dyn ChatWrapper,
    options: ParseNameOptions,
) -> Result<String, FunctionCallValidationError> {
    let head = parse_call_head(call_text, functions, wrapper)?;

    let mut found = functions.contains(head.name);
    if !found && options.enable_internal_builtin_functions {
        found = wrapper
            .internal_builtin_functions(options.initial_function_call_engaged)
            .contains(head.name);
    }
    if !found {
        return Err(FunctionCallValidationError::new(
            format!("Function name \"{}\" is not in the supplied functions object", head.name),
            head.text,
            functions,
            wrapper,
        ));
    }

    Ok(head.name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ChatModelFunction;
    use crate::wrapper::{GeneralChatWrapper, Llama3_2LightweightChatWrapper};
    use serde_json::json;

    fn functions() -> ChatModelFunctions {
        ChatModelFunctions::new()
            .with(
                "getWeather",
                ChatModelFunction::new(
                    Some("Get the weather"),
                    Some(json!({"type": "object", "properties": {"city": {"type": "string"}}})),
                ),
            )
            .with("getTime", ChatModelFunction::new(None, None))
    }

    #[test]
    fn parses_call_with_params() {
        let wrapper = GeneralChatWrapper::default();
        let call = parse_function_call("||call: getWeather({\"city\": \"Paris\"})\n\n\n\n", &functions(), &wrapper).unwrap();
        assert_eq!(call.function_name, "getWeather");
        assert_eq!(call.params, Some(json!({"city": "Paris"})));
        assert_eq!(call.raw, "||call: getWeather({\"city\": \"Paris\"})");
    }

    #[test]
    fn accepts_one_leading_space_and_missing_padding() {
        let wrapper = GeneralChatWrapper::default();
        let call = parse_function_call(" ||call: getTime()", &functions(), &wrapper).unwrap();
        assert_eq!(call.function_name, "getTime");
        assert_eq!(call.params, None);
        assert_eq!(call.raw, "||call: getTime()");
    }

    #[test]
    fn rejects_wrong_prefix() {
        let wrapper = GeneralChatWrapper::default();
        let err = parse_function_call("call: getTime()", &functions(), &wrapper).unwrap_err();
        assert_eq!(
            err.message,
            "Expected function call to start with function call prefix from \"General\" chat wrapper"
        );
        assert_eq!(err.wrapper_name, "General");
        assert_eq!(err.function_names, vec!["getWeather", "getTime"]);
    }

    #[test]
    fn rejects_unknown_function() {
        let wrapper = GeneralChatWrapper::default();
        let err = parse_function_call("||call: getDate()", &functions(), &wrapper).unwrap_err();
        assert_eq!(err.to_string(), "Function name \"getDate\" is not in the supplied functions object");
    }

    #[test]
    fn rejects_params_for_parameterless_function() {
        let wrapper = GeneralChatWrapper::default();
        let err = parse_function_call("||call: getTime({})", &functions(), &wrapper).unwrap_err();
        assert_eq!(err.message, "Expected function call to not contain params string but got \"{}\"");
    }

    #[test]
    fn schema_violations_are_validation_errors() {
        let wrapper = GeneralChatWrapper::default();
        let err = parse_function_call("||call: getWeather({\"city\": 3})", &functions(), &wrapper).unwrap_err();
        assert_eq!(err.message, "Expected type \"string\" but got \"number\"");
        assert_eq!(err.call_text, "||call: getWeather({\"city\": 3})");
    }

    #[test]
    fn missing_suffix_is_reported() {
        let wrapper = GeneralChatWrapper::default();
        let err = parse_function_call("||call: getWeather({\"city\": \"Paris\"}", &functions(), &wrapper).unwrap_err();
        assert_eq!(
            err.message,
            "Expected function call to end with function call suffix from \"General\" chat wrapper"
        );
    }

    #[test]
    fn partial_call_yields_name_only() {
        let wrapper = GeneralChatWrapper::default();
        let name = parse_function_name_from_partial_call(
            "||call: getWeather({\"ci",
            &functions(),
            &wrapper,
            ParseNameOptions::default(),
        )
        .unwrap();
        assert_eq!(name, "getWeather");

        let err = parse_function_name_from_partial_call("||call: getWea", &functions(), &wrapper, ParseNameOptions::default())
            .unwrap_err();
        assert!(err.message.starts_with("Expected function call to contain params prefix"));
    }

    #[test]
    fn grammar_lists_every_function() {
        let wrapper = GeneralChatWrapper::default();
        let grammar = FunctionCallGrammar::new(&functions(), &wrapper, false).unwrap();
        let root = grammar.root_rule();
        assert!(root.starts_with("[ ]? \"||call: \" (\"getWeather(\" "), "got {root}");
        assert!(root.contains(" | \"getTime(\")"));
        assert!(root.ends_with("\")\" [\\n] [\\n] [\\n] [\\n] [\\n]*"));
        assert!(grammar.to_ebnf().starts_with("root ::= "));
        assert_eq!(grammar.stop_generation_triggers()[0].to_string(), ")\n\n\n\n");
    }

    #[test]
    fn grammar_rejects_names_with_whitespace() {
        let wrapper = GeneralChatWrapper::default();
        let functions = ChatModelFunctions::new().with("get time", ChatModelFunction::default());
        let err = FunctionCallGrammar::new(&functions, &wrapper, false).unwrap_err();
        assert_eq!(err.to_string(), "Function name \"get time\" contains spaces, new lines or tabs");
    }

    #[test]
    fn json_call_syntax_round_trips_through_parser() {
        let wrapper = Llama3_2LightweightChatWrapper::default();
        let rendered = wrapper.generate_function_call("getWeather", Some(&json!({"city": "Paris"})));
        let call = parse_function_call(&rendered.to_string(), &functions(), &wrapper).unwrap();
        assert_eq!(call.params, Some(json!({"city": "Paris"})));
    }
}
