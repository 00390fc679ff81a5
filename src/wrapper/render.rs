//! Rendering helpers shared by all wrappers.
//!
//! These are the bodies behind the default methods of
//! [`ChatWrapper`](super::ChatWrapper). They take the wrapper as a generic
//! parameter so that a wrapper overriding, say, `generate_function_call`
//! still has its override used by the call-section renderer.

use std::borrow::Cow;
use std::io;

use serde::Serialize;
use serde_json::Value;

use super::docs::FunctionsDocumentationGenerator;
use super::{ChatWrapper, ChatWrapperSettings};
use crate::history::{
    ChatHistoryItem, ChatModelFunctionCall, ChatModelFunctions, ChatModelSegment, ModelResponseItem, SegmentType,
};
use crate::text::{Fragment, LlamaText};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful, respectful and honest assistant. Always answer as helpfully as possible.\n\
If a question does not make any sense, or is not factually coherent, explain why instead of answering something not correct. \
If you don't know the answer to a question, please don't share false information.";

// =============================================================================
// JSON
// =============================================================================

/// Writes `", "` between items and `": "` after keys.
struct SpacedFormatter;

impl serde_json::ser::Formatter for SpacedFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }
}

/// Single-line JSON with a space after every separator:
/// `{"a": 1, "b": [1, 2]}`.
pub fn json_dumps(value: &Value) -> String {
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, SpacedFormatter);
    if value.serialize(&mut serializer).is_err() {
        return value.to_string();
    }
    String::from_utf8(out).unwrap_or_else(|_| value.to_string())
}

// =============================================================================
// Function calls
// =============================================================================

pub fn function_call(settings: &ChatWrapperSettings, name: &str, params: Option<&Value>) -> LlamaText {
    let call = &settings.functions.call;
    let params_text = match params {
        Some(params) => json_dumps(params),
        None => match &call.empty_call_params_placeholder {
            None => String::new(),
            Some(Value::String(s)) if s.is_empty() => String::new(),
            Some(placeholder) => json_dumps(placeholder),
        },
    };

    LlamaText::from_parts([
        call.prefix.clone(),
        LlamaText::from(name),
        call.params_prefix.clone(),
        LlamaText::from(params_text),
        call.suffix.clone(),
    ])
}

/// Substitute `{{functionName}}` and `{{functionParams}}` in the plain-text
/// fragments of `text`.
fn resolve_result_placeholders(text: &LlamaText, name: &str, params: Option<&Value>) -> LlamaText {
    let params = params.map(json_dumps).unwrap_or_default();
    text.map_values(|value| match value {
        Fragment::Text(s) => Fragment::Text(
            s.replace("{{functionName}}", name)
                .replace("{{functionParams}}", &params),
        ),
        other => other.clone(),
    })
}

pub fn function_call_result(
    settings: &ChatWrapperSettings,
    name: &str,
    params: Option<&Value>,
    result: Option<&Value>,
) -> LlamaText {
    let result_text = match result {
        Some(result) => json_dumps(result),
        None => "void".to_string(),
    };
    function_call_result_raw(settings, name, params, result_text)
}

/// Like [`function_call_result`] with an already serialized result.
pub fn function_call_result_raw(
    settings: &ChatWrapperSettings,
    name: &str,
    params: Option<&Value>,
    result_text: impl Into<LlamaText>,
) -> LlamaText {
    let result = &settings.functions.result;
    LlamaText::from_parts([
        resolve_result_placeholders(&result.prefix, name, params),
        result_text.into(),
        resolve_result_placeholders(&result.suffix, name, params),
    ])
}

/// Render calls followed by their results. Without parallelism settings the
/// output alternates call, result; otherwise all calls form one section and
/// all results another.
pub fn function_calls_and_results<W>(wrapper: &W, calls: &[ChatModelFunctionCall], use_raw_values: bool) -> LlamaText
where
    W: ChatWrapper + ?Sized,
{
    if calls.is_empty() {
        return LlamaText::new();
    }

    let mut call_texts = Vec::with_capacity(calls.len());
    let mut result_texts = Vec::with_capacity(calls.len());
    for call in calls {
        call_texts.push(match (&call.raw, use_raw_values) {
            (Some(raw), true) => raw.clone(),
            _ => wrapper.generate_function_call(&call.name, call.params.as_ref()),
        });
        result_texts.push(wrapper.generate_function_call_result(&call.name, call.params.as_ref(), call.result.as_ref()));
    }

    let Some(parallelism) = &wrapper.settings().functions.parallelism else {
        return LlamaText::from_parts(call_texts.into_iter().zip(result_texts).flat_map(|(c, r)| [c, r]));
    };

    LlamaText::from_parts([
        parallelism.call.section_prefix.clone(),
        LlamaText::join(&parallelism.call.between_calls, call_texts),
        parallelism.call.section_suffix.clone(),
        parallelism.result.section_prefix.clone(),
        LlamaText::join(&parallelism.result.between_results, result_texts),
        parallelism.result.section_suffix.clone(),
    ])
}

// =============================================================================
// Model responses
// =============================================================================

struct ResponseRenderer<'w, W: ChatWrapper + ?Sized> {
    wrapper: &'w W,
    use_raw_values: bool,
    res: Vec<LlamaText>,
    pending_calls: Vec<ChatModelFunctionCall>,
    segment_stack: Vec<SegmentType>,
    last_segment_ended_without_suffix: bool,
    needs_segment_reminder: bool,
}

impl<'w, W: ChatWrapper + ?Sized> ResponseRenderer<'w, W> {
    fn flush_calls(&mut self) {
        if self.pending_calls.is_empty() {
            return;
        }
        let text = self
            .wrapper
            .generate_function_calls_and_results(&self.pending_calls, self.use_raw_values);
        self.res.push(text);
        self.pending_calls.clear();
        self.needs_segment_reminder = true;
    }

    fn add_segment_reminder(&mut self) {
        let wrapper = self.wrapper;
        let Some(segments) = &wrapper.settings().segments else {
            return;
        };

        if self.last_segment_ended_without_suffix && self.segment_stack.is_empty() {
            if let Some(close_all) = &segments.close_all_segments {
                self.last_segment_ended_without_suffix = false;
                self.res.push(close_all.clone());
                return;
            }
        }

        if self.needs_segment_reminder && !self.segment_stack.is_empty() && segments.reiterate_stack_after_function_calls {
            self.needs_segment_reminder = false;
            for segment_type in &self.segment_stack {
                if let Some(definition) = segments.definition(*segment_type) {
                    self.res.push(definition.prefix.clone());
                }
            }
        }
    }

    fn add_segment(&mut self, segment: &ChatModelSegment) {
        self.flush_calls();

        let wrapper = self.wrapper;
        let segments = wrapper.settings().segments.as_ref();
        let definition = segments.and_then(|s| s.definition(segment.segment_type));
        let top = self.segment_stack.last().copied();

        match (&segment.raw, self.use_raw_values) {
            (Some(raw), true) => self.res.push(raw.clone()),
            _ => {
                let prefix = match (top == Some(segment.segment_type), definition) {
                    (false, Some(definition)) => definition.prefix.clone(),
                    _ => LlamaText::new(),
                };
                let suffix = match (segment.ended, definition.and_then(|d| d.suffix.as_ref())) {
                    (true, Some(suffix)) => suffix.clone(),
                    _ => LlamaText::new(),
                };
                self.res
                    .push(LlamaText::from_parts([prefix, LlamaText::from(&segment.text), suffix]));
            }
        }

        let has_suffix = definition.is_some_and(|d| d.suffix.is_some());
        self.last_segment_ended_without_suffix = segment.ended && !has_suffix;

        if !segment.ended && top != Some(segment.segment_type) {
            self.segment_stack.push(segment.segment_type);
        } else if segment.ended && top == Some(segment.segment_type) {
            self.segment_stack.pop();

            if self.segment_stack.is_empty() && !has_suffix {
                if let Some(close_all) = segments.and_then(|s| s.close_all_segments.as_ref()) {
                    self.res.push(close_all.clone());
                    self.last_segment_ended_without_suffix = false;
                }
            }
        }
    }
}

/// Render one model turn: text, segments and function calls in order.
///
/// Calls are buffered so consecutive calls render as one section; a call
/// with `starts_new_chunk` closes the previous section first. With
/// `use_raw_values` the recorded raw text of calls and segments is replayed
/// verbatim.
pub fn model_response_text<W>(wrapper: &W, response: &[ModelResponseItem], use_raw_values: bool) -> LlamaText
where
    W: ChatWrapper + ?Sized,
{
    let mut renderer = ResponseRenderer {
        wrapper,
        use_raw_values,
        res: Vec::new(),
        pending_calls: Vec::new(),
        segment_stack: Vec::new(),
        last_segment_ended_without_suffix: false,
        needs_segment_reminder: false,
    };

    for item in response {
        match item {
            ModelResponseItem::Text(text) => {
                renderer.flush_calls();
                renderer.add_segment_reminder();
                renderer.res.push(LlamaText::from(text));
            }
            ModelResponseItem::Segment(segment) => renderer.add_segment(segment),
            ModelResponseItem::FunctionCall(call) => {
                if call.starts_new_chunk {
                    renderer.flush_calls();
                }
                renderer.pending_calls.push(call.clone());
            }
        }
    }

    renderer.flush_calls();
    renderer.add_segment_reminder();

    LlamaText::from_parts(renderer.res)
}

/// Segment types still open at the end of `response`, outermost first.
pub fn open_segment_stack(response: &[ModelResponseItem]) -> Vec<SegmentType> {
    let mut stack: Vec<SegmentType> = Vec::new();
    for item in response {
        let ModelResponseItem::Segment(segment) = item else {
            continue;
        };
        if segment.ended && stack.last() == Some(&segment.segment_type) {
            stack.pop();
        } else if !segment.ended && !stack.contains(&segment.segment_type) {
            stack.push(segment.segment_type);
        }
    }
    stack
}

/// Open a new thought segment at the end of the last model turn when the
/// wrapper wants thoughts reopened after function calls.
///
/// Applies only when the turn ends with a function call, no thought is open,
/// and the conversation contained a thought before. Returns whether a
/// segment was appended.
pub fn reopen_thought_after_function_calls(settings: &ChatWrapperSettings, history: &mut [ChatHistoryItem]) -> bool {
    let reopen = settings
        .segments
        .as_ref()
        .and_then(|s| s.thought.as_ref())
        .is_some_and(|t| t.reopen_after_function_calls);
    if !reopen {
        return false;
    }

    let had_thoughts = history.iter().any(|item| match item {
        ChatHistoryItem::Model { response } => response
            .iter()
            .any(|r| matches!(r, ModelResponseItem::Segment(s) if s.segment_type == SegmentType::Thought)),
        _ => false,
    });

    let Some(ChatHistoryItem::Model { response }) = history.last_mut() else {
        return false;
    };
    if !matches!(response.last(), Some(ModelResponseItem::FunctionCall(_))) {
        return false;
    }
    if open_segment_stack(response).contains(&SegmentType::Thought) || !had_thoughts {
        return false;
    }

    response.push(ModelResponseItem::Segment(ChatModelSegment::thought("", false)));
    true
}

// =============================================================================
// Functions documentation
// =============================================================================

/// The lines shared by the default and Llama 3 function instructions.
/// `period` terminates the two sentences that differ between them.
pub(crate) fn functions_instructions_text<W>(
    wrapper: &W,
    functions: &ChatModelFunctions,
    document_params: bool,
    period: &str,
) -> LlamaText
where
    W: ChatWrapper + ?Sized,
{
    let docs = FunctionsDocumentationGenerator::new(functions);
    if !docs.has_any_functions() {
        return LlamaText::new();
    }

    let example_params = serde_json::json!({"someKey": "someValue"});
    LlamaText::join(
        "\n",
        [
            LlamaText::from("The assistant calls the provided functions as needed to retrieve information instead of relying on existing knowledge."),
            LlamaText::from("To fulfill a request, the assistant calls relevant functions in advance when needed before responding to the request, and does not tell the user prior to calling a function."),
            LlamaText::from("Provided functions:"),
            LlamaText::from("```typescript"),
            LlamaText::from(docs.typescript_function_signatures(document_params)),
            LlamaText::from("```"),
            LlamaText::new(),
            LlamaText::from("Calling any of the provided functions can be done like this:"),
            wrapper.generate_function_call("getSomeInfo", Some(&example_params)),
            LlamaText::new(),
            LlamaText::from(format!("Note that the || prefix is mandatory{period}")),
            LlamaText::from("The assistant does not inform the user about using functions and does not explain anything before calling a function."),
            LlamaText::from(format!("After calling a function, the raw result appears afterwards and is not part of the conversation{period}")),
            LlamaText::from("To make information be part of the conversation, the assistant paraphrases and repeats the information without the function syntax."),
        ],
    )
}

pub fn default_functions_system_text<W>(wrapper: &W, functions: &ChatModelFunctions, document_params: bool) -> LlamaText
where
    W: ChatWrapper + ?Sized,
{
    functions_instructions_text(wrapper, functions, document_params, ".")
}

/// Insert a system item holding `text` before the first non-system item.
pub fn insert_functions_system_message(history: &[ChatHistoryItem], text: LlamaText) -> Cow<'_, [ChatHistoryItem]> {
    let index = history.iter().position(|item| !item.is_system()).unwrap_or(0);
    insert_system_message_at(history, index, text)
}

pub(crate) fn insert_system_message_at(history: &[ChatHistoryItem], index: usize, text: LlamaText) -> Cow<'_, [ChatHistoryItem]> {
    let mut res = history.to_vec();
    res.insert(index.min(res.len()), ChatHistoryItem::System { text });
    Cow::Owned(res)
}

pub fn initial_chat_history(system_prompt: Option<&str>) -> Vec<ChatHistoryItem> {
    vec![ChatHistoryItem::system(system_prompt.unwrap_or(DEFAULT_SYSTEM_PROMPT))]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ChatModelFunction;
    use crate::llama_text;
    use crate::text::special;
    use crate::wrapper::{
        CallParallelism, ContextState, ContextStateOptions, ParallelismSettings, ResultParallelism, SegmentSettings,
        SegmentsSettings,
    };
    use anyhow::Result;
    use serde_json::json;

    struct TestWrapper {
        settings: ChatWrapperSettings,
    }

    impl ChatWrapper for TestWrapper {
        fn wrapper_name(&self) -> &str {
            "Test"
        }

        fn settings(&self) -> &ChatWrapperSettings {
            &self.settings
        }

        fn generate_context_state(&self, _options: &ContextStateOptions<'_>) -> Result<ContextState> {
            Ok(ContextState::default())
        }
    }

    fn make_wrapper() -> TestWrapper {
        TestWrapper { settings: ChatWrapperSettings::default() }
    }

    fn thought_wrapper(reiterate: bool) -> TestWrapper {
        let mut settings = ChatWrapperSettings::default();
        settings.segments = Some(SegmentsSettings {
            reiterate_stack_after_function_calls: reiterate,
            thought: Some(SegmentSettings::new(special("<think>"), special("</think>"))),
            ..Default::default()
        });
        TestWrapper { settings }
    }

    #[test]
    fn json_dumps_spaces_separators() {
        assert_eq!(json_dumps(&json!({"a": 1, "b": [1, 2], "c": {}})), r#"{"a": 1, "b": [1, 2], "c": {}}"#);
        assert_eq!(json_dumps(&json!("x, y: z")), r#""x, y: z""#);
    }

    #[test]
    fn default_function_call_syntax() {
        let wrapper = make_wrapper();
        let text = wrapper.generate_function_call("getTime", Some(&json!({"tz": "UTC"})));
        assert_eq!(text, llama_text!["||call: getTime", special("("), r#"{"tz": "UTC"}"#, special(")")]);

        let no_params = wrapper.generate_function_call("ping", None);
        assert_eq!(no_params.to_string(), "||call: ping()");
    }

    #[test]
    fn result_placeholders_only_in_plain_text() {
        let mut settings = ChatWrapperSettings::default();
        settings.functions.result.prefix = llama_text![special("{{functionName}}"), "[{{functionName}} {{functionParams}}] "];
        let text = function_call_result(&settings, "f", Some(&json!({"a": 1})), None);
        assert_eq!(
            text,
            llama_text![special("{{functionName}}"), r#"[f {"a": 1}] void"#, special("\n")]
        );
    }

    #[test]
    fn sequential_calls_alternate_with_results() {
        let wrapper = make_wrapper();
        let calls = vec![
            ChatModelFunctionCall::new("a", None, Some(json!(1))),
            ChatModelFunctionCall::new("b", None, Some(json!(2))),
        ];
        let text = wrapper.generate_function_calls_and_results(&calls, true).to_string();
        assert_eq!(text, "||call: a()\n||result: 1\n||call: b()\n||result: 2\n");
    }

    #[test]
    fn parallel_calls_form_sections() {
        let mut wrapper = make_wrapper();
        wrapper.settings.functions.parallelism = Some(ParallelismSettings {
            call: CallParallelism {
                section_prefix: LlamaText::from("<calls>"),
                between_calls: LlamaText::from(","),
                section_suffix: LlamaText::from("</calls>"),
            },
            result: ResultParallelism {
                section_prefix: LlamaText::from("<results>"),
                between_results: LlamaText::from(","),
                section_suffix: LlamaText::from("</results>"),
            },
        });
        let calls = vec![
            ChatModelFunctionCall::new("a", None, Some(json!(1))).with_raw("RAW"),
            ChatModelFunctionCall::new("b", None, Some(json!(2))),
        ];
        let text = wrapper.generate_function_calls_and_results(&calls, true).to_string();
        assert_eq!(
            text,
            "<calls>RAW,||call: b()</calls><results>\n||result: 1\n,\n||result: 2\n</results>"
        );
        let cooked = wrapper.generate_function_calls_and_results(&calls, false).to_string();
        assert!(cooked.starts_with("<calls>||call: a()"));
    }

    #[test]
    fn starts_new_chunk_splits_call_sections() {
        let wrapper = make_wrapper();
        let response = vec![
            ModelResponseItem::from("Let me check."),
            ChatModelFunctionCall::new("a", None, Some(json!(1))).into(),
            ChatModelFunctionCall::new("b", None, Some(json!(2))).starting_new_chunk().into(),
            ModelResponseItem::from("Done"),
        ];
        let text = wrapper.generate_model_response_text(&response, true).to_string();
        assert_eq!(text, "Let me check.||call: a()\n||result: 1\n||call: b()\n||result: 2\nDone");
    }

    #[test]
    fn segments_render_prefix_and_suffix() {
        let wrapper = thought_wrapper(false);
        let response = vec![
            ChatModelSegment::thought("hmm", true).into(),
            ModelResponseItem::from("Answer"),
        ];
        let text = wrapper.generate_model_response_text(&response, true);
        assert_eq!(text, llama_text![special("<think>"), "hmm", special("</think>"), "Answer"]);
    }

    #[test]
    fn continued_segment_omits_repeated_prefix() {
        let wrapper = thought_wrapper(false);
        let response = vec![
            ChatModelSegment::thought("a", false).into(),
            ChatModelSegment::thought("b", true).into(),
        ];
        let text = wrapper.generate_model_response_text(&response, true);
        assert_eq!(text, llama_text![special("<think>"), "ab", special("</think>")]);
    }

    #[test]
    fn open_segments_are_reiterated_after_calls() {
        let wrapper = thought_wrapper(true);
        let response = vec![
            ChatModelSegment::thought("thinking", false).into(),
            ChatModelFunctionCall::new("f", None, Some(json!(true))).into(),
            ModelResponseItem::from("more"),
        ];
        let text = wrapper.generate_model_response_text(&response, true).to_string();
        assert_eq!(text, "<think>thinking||call: f()\n||result: true\n<think>more");

        let plain = thought_wrapper(false).generate_model_response_text(&response, true).to_string();
        assert_eq!(plain, "<think>thinking||call: f()\n||result: true\nmore");
    }

    #[test]
    fn close_all_segments_after_suffixless_segment() {
        let mut wrapper = thought_wrapper(false);
        if let Some(segments) = wrapper.settings.segments.as_mut() {
            segments.close_all_segments = Some(LlamaText::from(special("<close>")));
            segments.thought = Some(SegmentSettings::new(special("<t>"), LlamaText::new()));
        }
        let response = vec![
            ChatModelSegment::thought("a", false).into(),
            ChatModelSegment::thought("b", true).into(),
            ModelResponseItem::from("c"),
        ];
        let text = wrapper.generate_model_response_text(&response, true).to_string();
        assert_eq!(text, "<t>ab<close>c");
    }

    #[test]
    fn raw_segment_is_replayed() {
        let wrapper = thought_wrapper(false);
        let mut segment = ChatModelSegment::thought("x", true);
        segment.raw = Some(LlamaText::from("RAW THOUGHT"));
        let text = wrapper.generate_model_response_text(&[segment.into()], true);
        assert_eq!(text.to_string(), "RAW THOUGHT");
    }

    #[test]
    fn functions_message_goes_after_leading_system_items() {
        let wrapper = make_wrapper();
        let functions = ChatModelFunctions::new().with("f", ChatModelFunction::new(Some("Does f"), None));
        let history = vec![ChatHistoryItem::system("S"), ChatHistoryItem::user("U")];
        let res = wrapper.add_available_functions_system_message_to_history(&history, Some(&functions), true);
        assert_eq!(res.len(), 3);
        assert!(res[1].is_system());
        let ChatHistoryItem::System { text } = &res[1] else {
            panic!("expected system item");
        };
        let text = text.to_string();
        assert!(text.contains("function f();"));
        assert!(text.contains("// Does f"));
        assert!(text.contains("||call: getSomeInfo("));
        assert!(text.contains("Note that the || prefix is mandatory."));

        let only_system = vec![ChatHistoryItem::system("S")];
        let res = wrapper.add_available_functions_system_message_to_history(&only_system, Some(&functions), true);
        assert_eq!(res.len(), 2);

        let untouched = wrapper.add_available_functions_system_message_to_history(&history, None, true);
        assert!(matches!(untouched, Cow::Borrowed(_)));
    }

    #[test]
    fn thought_is_reopened_after_trailing_call() {
        let mut settings = ChatWrapperSettings::default();
        let mut thought = SegmentSettings::new(special("<t>"), special("</t>"));
        thought.reopen_after_function_calls = true;
        settings.segments = Some(SegmentsSettings { thought: Some(thought), ..Default::default() });

        let mut history = vec![
            ChatHistoryItem::user("Q"),
            ChatHistoryItem::model([
                ModelResponseItem::from(ChatModelSegment::thought("plan", true)),
                ChatModelFunctionCall::new("f", None, Some(json!(1))).into(),
            ]),
        ];
        assert!(reopen_thought_after_function_calls(&settings, &mut history));
        let ChatHistoryItem::Model { response } = &history[1] else {
            panic!("expected model item");
        };
        assert_eq!(open_segment_stack(response), vec![SegmentType::Thought]);
        assert!(!reopen_thought_after_function_calls(&settings, &mut history));
    }

    #[test]
    fn initial_history_uses_default_prompt() {
        let history = initial_chat_history(None);
        assert_eq!(history, vec![ChatHistoryItem::system(DEFAULT_SYSTEM_PROMPT)]);
    }
}
