//! Qwen 2.5 / Qwen 3 format: ChatML turns, `<tool_call>` JSON calls whose
//! results come back in a `user` turn of `<tool_response>` blocks, and
//! `<think>` thought segments.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use super::aggregate::{chunk_chat_items, ChunkPolicy};
use super::docs::FunctionsDocumentationGenerator;
use super::{
    CallParallelism, ChatWrapper, ChatWrapperSettings, ContextState, ContextStateOptions, FunctionCallSettings,
    FunctionResultSettings, FunctionsSettings, ModelCompatibility, ParallelismSettings, Probe, ResultParallelism,
    SegmentSettings, SegmentsSettings,
};
use crate::history::{ChatHistoryItem, ChatModelFunctions, ChatModelSegment, ModelResponseItem, SegmentType};
use crate::llama_text;
use crate::text::{special, BuiltinToken, LlamaText};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QwenThoughts {
    #[default]
    Auto,
    /// Prefill an empty thought in the last model turn.
    Discourage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QwenChatWrapperOptions {
    /// Drop thought segments from every model turn but the last item.
    pub keep_only_last_thought: bool,
    pub thoughts: QwenThoughts,
    /// Put a line break before each `<tool_call>` instead of between calls.
    pub line_break_before_function_call_prefix: bool,
}

impl Default for QwenChatWrapperOptions {
    fn default() -> Self {
        Self {
            keep_only_last_thought: true,
            thoughts: QwenThoughts::Auto,
            line_break_before_function_call_prefix: false,
        }
    }
}

const QWEN_ARCHITECTURES: &[&str] = &["qwen2", "qwen2moe", "qwen2vl", "qwen3", "qwen3moe", "qwen3vl", "qwen3vlmoe"];

/// An ended empty thought, inserted after the last function call of
/// `response` or at its start when there is none.
fn discourage_thoughts(response: &[ModelResponseItem]) -> Vec<ModelResponseItem> {
    let mut empty_thought = ChatModelSegment::thought("\n\n", true);
    empty_thought.raw = Some(LlamaText::from(special("<think>\n\n</think>\n\n")));

    let mut res = response.to_vec();
    let index = response
        .iter()
        .rposition(|item| matches!(item, ModelResponseItem::FunctionCall(_)))
        .map_or(0, |i| i + 1);
    res.insert(index, empty_thought.into());
    res
}

fn is_thought(item: &ModelResponseItem) -> bool {
    matches!(item, ModelResponseItem::Segment(s) if s.segment_type == SegmentType::Thought)
}

pub struct QwenChatWrapper {
    settings: ChatWrapperSettings,
    options: QwenChatWrapperOptions,
}

impl QwenChatWrapper {
    pub fn new(options: QwenChatWrapperOptions) -> Self {
        let line_break = options.line_break_before_function_call_prefix;
        let settings = ChatWrapperSettings {
            supports_system_messages: true,
            functions: FunctionsSettings {
                call: FunctionCallSettings {
                    optional_prefix_space: true,
                    prefix: llama_text![
                        if line_break { "\n" } else { "" },
                        special("<tool_call>"),
                        "\n{\"name\": \""
                    ],
                    params_prefix: LlamaText::from("\", \"arguments\": "),
                    suffix: llama_text!["}\n", special("</tool_call>")],
                    empty_call_params_placeholder: Some(serde_json::json!({})),
                },
                result: FunctionResultSettings {
                    prefix: LlamaText::from(special("\n<tool_response>\n")),
                    suffix: LlamaText::from(special("\n</tool_response>")),
                },
                parallelism: Some(ParallelismSettings {
                    call: CallParallelism {
                        section_prefix: LlamaText::new(),
                        between_calls: LlamaText::from(if line_break { "" } else { "\n" }),
                        section_suffix: LlamaText::from(special("<|im_end|>\n")),
                    },
                    result: ResultParallelism {
                        section_prefix: LlamaText::from(special("<|im_start|>user")),
                        between_results: LlamaText::new(),
                        section_suffix: LlamaText::from(special("<|im_end|>\n<|im_start|>assistant\n")),
                    },
                }),
            },
            segments: Some(SegmentsSettings {
                reiterate_stack_after_function_calls: true,
                thought: Some(SegmentSettings::new(special("<think>\n"), special("\n</think>"))),
                ..Default::default()
            }),
        };
        Self { settings, options }
    }

    pub fn options(&self) -> &QwenChatWrapperOptions {
        &self.options
    }

    /// Any Qwen 2/3 architecture, or no architecture information at all.
    pub fn check_model_compatibility(compat: &ModelCompatibility<'_>) -> bool {
        match compat.file_info.and_then(|info| info.architecture.as_deref()) {
            None => true,
            Some(architecture) => QWEN_ARCHITECTURES.contains(&architecture),
        }
    }

    /// Plain Qwen turns are ChatML turns; only templates that render
    /// `tools` tell them apart.
    pub fn probes() -> Vec<Probe<QwenChatWrapperOptions>> {
        vec![
            Probe::pair(super::keep, super::keep).requiring_tool_rendering(),
            Probe::pair(|o: &mut QwenChatWrapperOptions| o.line_break_before_function_call_prefix = true, super::keep).requiring_tool_rendering(),
            Probe::pair(|o: &mut QwenChatWrapperOptions| o.thoughts = QwenThoughts::Discourage, super::keep).requiring_tool_rendering(),
            Probe::pair(
                |o: &mut QwenChatWrapperOptions| {
                    o.thoughts = QwenThoughts::Discourage;
                    o.line_break_before_function_call_prefix = true;
                },
                super::keep,
            )
            .requiring_tool_rendering(),
        ]
    }

    fn model_turn<'r>(&self, response: &'r [ModelResponseItem], is_last_item: bool) -> Cow<'r, [ModelResponseItem]> {
        let mut response = Cow::Borrowed(response);
        if self.options.thoughts == QwenThoughts::Discourage && is_last_item {
            response = Cow::Owned(discourage_thoughts(&response));
        }
        if self.options.keep_only_last_thought && !is_last_item {
            response = Cow::Owned(response.iter().filter(|item| !is_thought(item)).cloned().collect());
        }
        response
    }
}

impl Default for QwenChatWrapper {
    fn default() -> Self {
        Self::new(QwenChatWrapperOptions::default())
    }
}

impl ChatWrapper for QwenChatWrapper {
    fn wrapper_name(&self) -> &str {
        "Qwen"
    }

    fn settings(&self) -> &ChatWrapperSettings {
        &self.settings
    }

    fn generate_context_state(&self, options: &ContextStateOptions<'_>) -> Result<ContextState> {
        let history = self.add_available_functions_system_message_to_history(
            options.chat_history,
            options.functions(),
            options.document_function_params,
        );

        // The chunker renders model items in order; pair each with whether
        // it is the last history item.
        let last_model_index = match history.last() {
            Some(ChatHistoryItem::Model { .. }) => Some(history.iter().filter(|i| matches!(i, ChatHistoryItem::Model { .. })).count() - 1),
            _ => None,
        };
        let mut model_index = 0;
        let chunks = chunk_chat_items(&history, ChunkPolicy::JoinSystem, |response| {
            let is_last_item = last_model_index == Some(model_index);
            model_index += 1;
            let response = self.model_turn(response, is_last_item);
            self.generate_model_response_text(&response, true)
        });

        let last = chunks.len().saturating_sub(1);
        let mut parts = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if !chunk.system.is_empty() {
                parts.push(llama_text![special("<|im_start|>system\n"), &chunk.system, special("<|im_end|>\n")]);
            }
            if !chunk.user.is_empty() {
                parts.push(llama_text![special("<|im_start|>user\n"), &chunk.user, special("<|im_end|>\n")]);
            }
            if !chunk.model.is_empty() || i == last {
                parts.push(LlamaText::from(special("<|im_start|>assistant\n")));
                parts.push(chunk.model.clone());
                if i != last {
                    parts.push(LlamaText::from(special("<|im_end|>\n")));
                }
            }
        }

        Ok(ContextState::new(
            LlamaText::from_parts(parts),
            vec![
                LlamaText::from(BuiltinToken::Eos),
                LlamaText::from(special("<|im_end|>")),
                LlamaText::from("<|im_end|>"),
            ],
        ))
    }

    fn generate_available_functions_system_text(&self, functions: &ChatModelFunctions, document_params: bool) -> LlamaText {
        let docs = FunctionsDocumentationGenerator::new(functions);
        if !docs.has_any_functions() {
            return LlamaText::new();
        }

        LlamaText::join(
            "\n",
            [
                LlamaText::from("# Tools"),
                LlamaText::new(),
                LlamaText::from("You may call one or more functions to assist with the user query."),
                LlamaText::new(),
                llama_text![
                    "You are provided with function signatures within ",
                    special("<tools></tools>"),
                    " XML tags:"
                ],
                LlamaText::from(special("<tools>")),
                LlamaText::from(docs.qwen_function_signatures(document_params)),
                LlamaText::from(special("</tools>")),
                LlamaText::new(),
                llama_text![
                    "For each function call, return a json object with function name and arguments within ",
                    special("<tool_call></tool_call>"),
                    " XML tags:"
                ],
                LlamaText::from(special("<tool_call>")),
                LlamaText::from("{\"name\": <function-name>, \"arguments\": <args-json-object>}"),
                LlamaText::from(special("</tool_call>")),
            ],
        )
    }
}
