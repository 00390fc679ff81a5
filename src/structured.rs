//! Function calling on top of the chat wrappers.
//!
//! A model emits calls in the syntax of its wrapper. This module produces
//! a GBNF grammar that constrains generation to one such call and parses
//! and validates the generated text afterwards.
//!
//! # Usage
//!
//! 1. **Build a grammar** with [`FunctionCallGrammar::new`] once the model
//!    has started a call (or starts engaged in one)
//! 2. **Generate** under the grammar until a stop trigger fires
//! 3. **Parse** the text with [`parse_function_call`]
//!
//! ```rust
//! use llama_chat::history::{ChatModelFunction, ChatModelFunctions};
//! use llama_chat::structured::{parse_function_call, FunctionCallGrammar};
//! use llama_chat::wrapper::GeneralChatWrapper;
//! use serde_json::json;
//!
//! let functions = ChatModelFunctions::new().with(
//!     "getTime",
//!     ChatModelFunction::new(None, Some(json!({"type": "object", "properties": {"tz": {"type": "string"}}}))),
//! );
//! let wrapper = GeneralChatWrapper::default();
//!
//! let grammar = FunctionCallGrammar::new(&functions, &wrapper, false).unwrap();
//! assert!(grammar.to_ebnf().starts_with("root ::="));
//!
//! let call = parse_function_call("||call: getTime({\"tz\": \"UTC\"})", &functions, &wrapper).unwrap();
//! assert_eq!(call.params, Some(json!({"tz": "UTC"})));
//! ```

pub mod function_call;
pub mod json_schema;

pub use function_call::{
    parse_function_call, parse_function_name_from_partial_call, FunctionCall, FunctionCallGrammar,
    FunctionCallValidationError, ParseNameOptions,
};
pub use json_schema::{json_schema_to_ebnf, validate, JsonSchemaOptions, SchemaConverter, SchemaValidationError};
