//! Chat wrapper contract.
//!
//! A chat wrapper renders a whole conversation history into the exact
//! [`LlamaText`] a model family expects, together with the stop triggers
//! that end a model turn. Every concrete wrapper lives in its own submodule
//! and is reachable through the closed [`BuiltinChatWrapper`] enum.
//!
//! Wrappers share behavior only through free helper functions in
//! [`render`], [`docs`] and [`aggregate`]; the default methods of
//! [`ChatWrapper`] delegate to those helpers and a wrapper overrides only
//! the methods whose output differs for its family.

use std::borrow::Cow;

use anyhow::Result;
use serde_json::Value;

use crate::history::{ChatHistoryItem, ChatModelFunctionCall, ChatModelFunctions, ModelResponseItem, SegmentType};
use crate::llama_text;
use crate::resolve::{ModelFileInfo, WrapperType};
use crate::text::{special, LlamaText};
use crate::tokenizer::Tokenizer;

pub mod aggregate;
pub mod docs;
pub mod render;

pub mod alpaca;
pub mod chatml;
pub mod deepseek;
pub mod falcon;
pub mod gemma;
pub mod general;
pub mod jinja;
pub mod llama2;
pub mod llama3;
pub mod llama3_2;
pub mod mistral;
pub mod qwen;
pub mod seed;
pub mod template;

pub use alpaca::{AlpacaChatWrapper, AlpacaChatWrapperOptions};
pub use chatml::ChatMlChatWrapper;
pub use deepseek::{DeepSeekChatWrapper, DeepSeekChatWrapperOptions};
pub use falcon::{FalconChatWrapper, FalconChatWrapperOptions};
pub use gemma::GemmaChatWrapper;
pub use general::{GeneralChatWrapper, GeneralChatWrapperOptions};
pub use jinja::{JinjaTemplateChatWrapper, JinjaTemplateChatWrapperOptions};
pub use llama2::{Llama2ChatWrapper, Llama2ChatWrapperOptions};
pub use llama3::{Llama3ChatWrapper, Llama3ChatWrapperOptions};
pub use llama3_2::{Llama3_2LightweightChatWrapper, Llama3_2LightweightChatWrapperOptions, PreambleDate};
pub use mistral::{MistralChatWrapper, MistralChatWrapperOptions};
pub use qwen::{QwenChatWrapper, QwenChatWrapperOptions, QwenThoughts};
pub use seed::{SeedChatWrapper, SeedChatWrapperOptions};
pub use template::{TemplateChatWrapper, TemplateChatWrapperOptions};

// =============================================================================
// Settings
// =============================================================================

/// How a single function call is written.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCallSettings {
    /// A single space before `prefix` is accepted when parsing.
    pub optional_prefix_space: bool,
    pub prefix: LlamaText,
    pub params_prefix: LlamaText,
    pub suffix: LlamaText,
    /// Rendered in place of the params when a call has none.
    pub empty_call_params_placeholder: Option<Value>,
}

/// Text around a function result. Plain-text fragments may contain
/// `{{functionName}}` and `{{functionParams}}`.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionResultSettings {
    pub prefix: LlamaText,
    pub suffix: LlamaText,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallParallelism {
    pub section_prefix: LlamaText,
    pub between_calls: LlamaText,
    pub section_suffix: LlamaText,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultParallelism {
    pub section_prefix: LlamaText,
    pub between_results: LlamaText,
    pub section_suffix: LlamaText,
}

/// Grouping of several calls (then their results) into one section.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParallelismSettings {
    pub call: CallParallelism,
    pub result: ResultParallelism,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionsSettings {
    pub call: FunctionCallSettings,
    pub result: FunctionResultSettings,
    pub parallelism: Option<ParallelismSettings>,
}

/// Delimiters of one segment type.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentSettings {
    pub prefix: LlamaText,
    pub suffix: Option<LlamaText>,
    /// Open the segment again after function results when it was the
    /// innermost open segment.
    pub reopen_after_function_calls: bool,
}

impl SegmentSettings {
    pub fn new(prefix: impl Into<LlamaText>, suffix: impl Into<LlamaText>) -> Self {
        let suffix = suffix.into();
        Self {
            prefix: prefix.into(),
            suffix: (!suffix.is_empty()).then_some(suffix),
            reopen_after_function_calls: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SegmentsSettings {
    /// Closes every open segment at once when a segment ends without its
    /// own suffix.
    pub close_all_segments: Option<LlamaText>,
    /// Re-emit the prefixes of all open segments after function results.
    pub reiterate_stack_after_function_calls: bool,
    pub thought: Option<SegmentSettings>,
    pub comment: Option<SegmentSettings>,
}

impl SegmentsSettings {
    pub fn definition(&self, segment_type: SegmentType) -> Option<&SegmentSettings> {
        match segment_type {
            SegmentType::Thought => self.thought.as_ref(),
            SegmentType::Comment => self.comment.as_ref(),
        }
    }
}

/// Construction-time settings of a wrapper. Never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatWrapperSettings {
    pub supports_system_messages: bool,
    pub functions: FunctionsSettings,
    pub segments: Option<SegmentsSettings>,
}

impl Default for ChatWrapperSettings {
    fn default() -> Self {
        Self {
            supports_system_messages: true,
            functions: FunctionsSettings {
                call: FunctionCallSettings {
                    optional_prefix_space: true,
                    prefix: LlamaText::from("||call: "),
                    params_prefix: LlamaText::from(special("(")),
                    suffix: LlamaText::from(special(")")),
                    empty_call_params_placeholder: None,
                },
                result: FunctionResultSettings {
                    prefix: llama_text![special("\n"), "||result: "],
                    suffix: LlamaText::from(special("\n")),
                },
                parallelism: None,
            },
            segments: None,
        }
    }
}

// =============================================================================
// Context state
// =============================================================================

/// Input of [`ChatWrapper::generate_context_state`].
#[derive(Debug, Clone, Copy)]
pub struct ContextStateOptions<'a> {
    pub chat_history: &'a [ChatHistoryItem],
    pub available_functions: Option<&'a ChatModelFunctions>,
    pub document_function_params: bool,
}

impl<'a> ContextStateOptions<'a> {
    pub fn new(chat_history: &'a [ChatHistoryItem]) -> Self {
        Self {
            chat_history,
            available_functions: None,
            document_function_params: true,
        }
    }

    pub fn with_functions(mut self, functions: &'a ChatModelFunctions) -> Self {
        self.available_functions = Some(functions);
        self
    }

    pub fn with_document_params(mut self, document: bool) -> Self {
        self.document_function_params = document;
        self
    }

    /// The functions, if any were given and the table is non-empty.
    pub fn functions(&self) -> Option<&'a ChatModelFunctions> {
        self.available_functions.filter(|functions| !functions.is_empty())
    }
}

/// Whether generation starts inside a function call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FunctionCallState {
    pub initially_engaged: bool,
    /// Texts that, when generated first, leave the initially engaged call.
    pub disengage_initially_engaged: Vec<LlamaText>,
}

/// The rendered prompt and the signals the generation loop needs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContextState {
    pub context_text: LlamaText,
    pub stop_generation_triggers: Vec<LlamaText>,
    /// Leading texts the generation loop drops from the start of a response.
    pub ignore_start_text: Vec<LlamaText>,
    pub function_call: Option<FunctionCallState>,
}

impl ContextState {
    pub fn new(context_text: LlamaText, stop_generation_triggers: Vec<LlamaText>) -> Self {
        Self {
            context_text,
            stop_generation_triggers,
            ignore_start_text: Vec::new(),
            function_call: None,
        }
    }
}

// =============================================================================
// ChatWrapper
// =============================================================================

/// The rendering contract every wrapper implements.
///
/// `generate_context_state` must be a pure function of its input: rendering
/// the same history twice yields structurally identical text.
pub trait ChatWrapper: Send + Sync {
    /// Human readable wrapper name, used in error messages.
    fn wrapper_name(&self) -> &str;

    fn settings(&self) -> &ChatWrapperSettings;

    fn generate_context_state(&self, options: &ContextStateOptions<'_>) -> Result<ContextState>;

    fn generate_function_call(&self, name: &str, params: Option<&Value>) -> LlamaText {
        render::function_call(self.settings(), name, params)
    }

    fn generate_function_call_result(&self, name: &str, params: Option<&Value>, result: Option<&Value>) -> LlamaText {
        render::function_call_result(self.settings(), name, params, result)
    }

    fn generate_function_calls_and_results(&self, calls: &[ChatModelFunctionCall], use_raw_values: bool) -> LlamaText {
        render::function_calls_and_results(self, calls, use_raw_values)
    }

    fn generate_model_response_text(&self, response: &[ModelResponseItem], use_raw_values: bool) -> LlamaText {
        render::model_response_text(self, response, use_raw_values)
    }

    fn generate_available_functions_system_text(&self, functions: &ChatModelFunctions, document_params: bool) -> LlamaText {
        render::default_functions_system_text(self, functions, document_params)
    }

    fn add_available_functions_system_message_to_history<'h>(
        &self,
        history: &'h [ChatHistoryItem],
        functions: Option<&ChatModelFunctions>,
        document_params: bool,
    ) -> Cow<'h, [ChatHistoryItem]> {
        match functions.filter(|f| !f.is_empty()) {
            Some(functions) => {
                let text = self.generate_available_functions_system_text(functions, document_params);
                render::insert_functions_system_message(history, text)
            }
            None => Cow::Borrowed(history),
        }
    }

    fn generate_initial_chat_history(&self, system_prompt: Option<&str>) -> Vec<ChatHistoryItem> {
        render::initial_chat_history(system_prompt)
    }

    /// Wrapper-private functions accepted while parsing a call in progress.
    fn internal_builtin_functions(&self, _initial_function_call_engaged: bool) -> ChatModelFunctions {
        ChatModelFunctions::new()
    }
}

// =============================================================================
// Probes
// =============================================================================

/// What a wrapper may inspect when deciding whether it fits a model.
#[derive(Clone, Copy, Default)]
pub struct ModelCompatibility<'a> {
    pub tokenizer: Option<&'a dyn Tokenizer>,
    pub file_info: Option<&'a ModelFileInfo>,
}

/// One option combination a wrapper declares for equivalence testing
/// against an embedded Jinja template.
///
/// `test` patches the caller's options for the comparison; when the
/// comparison succeeds the wrapper is built with `apply` patched in instead.
pub struct Probe<O> {
    pub test: fn(&mut O),
    pub apply: fn(&mut O),
    /// Extra variables passed to the Jinja template for this probe.
    pub jinja_parameters: serde_json::Map<String, Value>,
    /// Only matches templates that render a `tools` list.
    pub requires_tool_rendering: bool,
}

impl<O> Probe<O> {
    /// A probe whose test and apply options are the same.
    pub fn same(patch: fn(&mut O)) -> Self {
        Self {
            test: patch,
            apply: patch,
            jinja_parameters: serde_json::Map::new(),
            requires_tool_rendering: false,
        }
    }

    pub fn pair(test: fn(&mut O), apply: fn(&mut O)) -> Self {
        Self {
            test,
            apply,
            jinja_parameters: serde_json::Map::new(),
            requires_tool_rendering: false,
        }
    }

    pub fn with_jinja_parameter(mut self, key: &str, value: Value) -> Self {
        self.jinja_parameters.insert(key.to_string(), value);
        self
    }

    pub fn requiring_tool_rendering(mut self) -> Self {
        self.requires_tool_rendering = true;
        self
    }
}

impl<O: Clone> Probe<O> {
    pub fn test_options(&self, base: &O) -> O {
        let mut options = base.clone();
        (self.test)(&mut options);
        options
    }

    pub fn apply_options(&self, base: &O) -> O {
        let mut options = base.clone();
        (self.apply)(&mut options);
        options
    }
}

/// Leave options untouched.
pub(crate) fn keep<O>(_: &mut O) {}

// =============================================================================
// BuiltinChatWrapper
// =============================================================================

/// Every wrapper this crate ships, as one closed set.
pub enum BuiltinChatWrapper {
    General(GeneralChatWrapper),
    Alpaca(AlpacaChatWrapper),
    Falcon(FalconChatWrapper),
    ChatMl(ChatMlChatWrapper),
    Llama2(Llama2ChatWrapper),
    Llama3(Llama3ChatWrapper),
    Llama3_2Lightweight(Llama3_2LightweightChatWrapper),
    Mistral(MistralChatWrapper),
    Gemma(GemmaChatWrapper),
    Qwen(QwenChatWrapper),
    DeepSeek(DeepSeekChatWrapper),
    Seed(SeedChatWrapper),
    Template(TemplateChatWrapper),
    JinjaTemplate(JinjaTemplateChatWrapper),
}

macro_rules! dispatch {
    ($self:expr, $w:ident => $body:expr) => {
        match $self {
            BuiltinChatWrapper::General($w) => $body,
            BuiltinChatWrapper::Alpaca($w) => $body,
            BuiltinChatWrapper::Falcon($w) => $body,
            BuiltinChatWrapper::ChatMl($w) => $body,
            BuiltinChatWrapper::Llama2($w) => $body,
            BuiltinChatWrapper::Llama3($w) => $body,
            BuiltinChatWrapper::Llama3_2Lightweight($w) => $body,
            BuiltinChatWrapper::Mistral($w) => $body,
            BuiltinChatWrapper::Gemma($w) => $body,
            BuiltinChatWrapper::Qwen($w) => $body,
            BuiltinChatWrapper::DeepSeek($w) => $body,
            BuiltinChatWrapper::Seed($w) => $body,
            BuiltinChatWrapper::Template($w) => $body,
            BuiltinChatWrapper::JinjaTemplate($w) => $body,
        }
    };
}

impl BuiltinChatWrapper {
    pub fn wrapper_type(&self) -> WrapperType {
        match self {
            BuiltinChatWrapper::General(_) => WrapperType::General,
            BuiltinChatWrapper::Alpaca(_) => WrapperType::Alpaca,
            BuiltinChatWrapper::Falcon(_) => WrapperType::Falcon,
            BuiltinChatWrapper::ChatMl(_) => WrapperType::ChatMl,
            BuiltinChatWrapper::Llama2(_) => WrapperType::Llama2,
            BuiltinChatWrapper::Llama3(_) => WrapperType::Llama3,
            BuiltinChatWrapper::Llama3_2Lightweight(_) => WrapperType::Llama3_2Lightweight,
            BuiltinChatWrapper::Mistral(_) => WrapperType::Mistral,
            BuiltinChatWrapper::Gemma(_) => WrapperType::Gemma,
            BuiltinChatWrapper::Qwen(_) => WrapperType::Qwen,
            BuiltinChatWrapper::DeepSeek(_) => WrapperType::DeepSeek,
            BuiltinChatWrapper::Seed(_) => WrapperType::Seed,
            BuiltinChatWrapper::Template(_) => WrapperType::Template,
            BuiltinChatWrapper::JinjaTemplate(_) => WrapperType::JinjaTemplate,
        }
    }

    /// The resolver type name of this wrapper.
    pub fn type_name(&self) -> &'static str {
        self.wrapper_type().as_str()
    }

    pub fn as_dyn(&self) -> &dyn ChatWrapper {
        dispatch!(self, w => w)
    }
}

impl std::fmt::Debug for BuiltinChatWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BuiltinChatWrapper").field(&self.type_name()).finish()
    }
}

impl ChatWrapper for BuiltinChatWrapper {
    fn wrapper_name(&self) -> &str {
        dispatch!(self, w => w.wrapper_name())
    }

    fn settings(&self) -> &ChatWrapperSettings {
        dispatch!(self, w => w.settings())
    }

    fn generate_context_state(&self, options: &ContextStateOptions<'_>) -> Result<ContextState> {
        dispatch!(self, w => w.generate_context_state(options))
    }

    fn generate_function_call(&self, name: &str, params: Option<&Value>) -> LlamaText {
        dispatch!(self, w => w.generate_function_call(name, params))
    }

    fn generate_function_call_result(&self, name: &str, params: Option<&Value>, result: Option<&Value>) -> LlamaText {
        dispatch!(self, w => w.generate_function_call_result(name, params, result))
    }

    fn generate_function_calls_and_results(&self, calls: &[ChatModelFunctionCall], use_raw_values: bool) -> LlamaText {
        dispatch!(self, w => w.generate_function_calls_and_results(calls, use_raw_values))
    }

    fn generate_model_response_text(&self, response: &[ModelResponseItem], use_raw_values: bool) -> LlamaText {
        dispatch!(self, w => w.generate_model_response_text(response, use_raw_values))
    }

    fn generate_available_functions_system_text(&self, functions: &ChatModelFunctions, document_params: bool) -> LlamaText {
        dispatch!(self, w => w.generate_available_functions_system_text(functions, document_params))
    }

    fn add_available_functions_system_message_to_history<'h>(
        &self,
        history: &'h [ChatHistoryItem],
        functions: Option<&ChatModelFunctions>,
        document_params: bool,
    ) -> Cow<'h, [ChatHistoryItem]> {
        dispatch!(self, w => w.add_available_functions_system_message_to_history(history, functions, document_params))
    }

    fn generate_initial_chat_history(&self, system_prompt: Option<&str>) -> Vec<ChatHistoryItem> {
        dispatch!(self, w => w.generate_initial_chat_history(system_prompt))
    }

    fn internal_builtin_functions(&self, initial_function_call_engaged: bool) -> ChatModelFunctions {
        dispatch!(self, w => w.internal_builtin_functions(initial_function_call_engaged))
    }
}

macro_rules! impl_from_wrapper {
    ($($variant:ident($ty:ty)),+ $(,)?) => {
        $(
            impl From<$ty> for BuiltinChatWrapper {
                fn from(wrapper: $ty) -> Self {
                    BuiltinChatWrapper::$variant(wrapper)
                }
            }
        )+
    };
}

impl_from_wrapper!(
    General(GeneralChatWrapper),
    Alpaca(AlpacaChatWrapper),
    Falcon(FalconChatWrapper),
    ChatMl(ChatMlChatWrapper),
    Llama2(Llama2ChatWrapper),
    Llama3(Llama3ChatWrapper),
    Llama3_2Lightweight(Llama3_2LightweightChatWrapper),
    Mistral(MistralChatWrapper),
    Gemma(GemmaChatWrapper),
    Qwen(QwenChatWrapper),
    DeepSeek(DeepSeekChatWrapper),
    Seed(SeedChatWrapper),
    Template(TemplateChatWrapper),
    JinjaTemplate(JinjaTemplateChatWrapper),
);
