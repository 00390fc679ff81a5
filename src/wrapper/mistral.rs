//! Mistral v3 tokenizer format.
//!
//! The leading system messages are not rendered where they appear; they are
//! moved into the last `[INST]` block, after the `[AVAILABLE_TOOLS]` block.
//! Function calls are JSON objects inside `[TOOL_CALLS]` sections.

use std::borrow::Cow;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::aggregate::{chunk_chat_items, ChatChunk, ChunkPolicy};
use super::docs::FunctionsDocumentationGenerator;
use super::render::json_dumps;
use super::{
    CallParallelism, ChatWrapper, ChatWrapperSettings, ContextState, ContextStateOptions, FunctionCallSettings,
    FunctionResultSettings, FunctionsSettings, ParallelismSettings, Probe, ResultParallelism,
};
use crate::history::{ChatHistoryItem, ChatModelFunctions, ModelResponseItem};
use crate::llama_text;
use crate::text::{special, BuiltinToken, LlamaText};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MistralChatWrapperOptions {
    pub add_space_before_eos: bool,
}

pub struct MistralChatWrapper {
    settings: ChatWrapperSettings,
    options: MistralChatWrapperOptions,
}

/// Leading system texts, joined, and the rest of the history.
fn split_system_message(history: &[ChatHistoryItem]) -> (LlamaText, &[ChatHistoryItem]) {
    let count = history.iter().take_while(|item| item.is_system()).count();
    let texts = history[..count].iter().filter_map(|item| match item {
        ChatHistoryItem::System { text } => Some(text.clone()),
        _ => None,
    });
    (LlamaText::join("\n\n", texts), &history[count..])
}

/// Split before the last user message. Without a user message everything
/// is the last interaction.
fn split_last_interaction(history: &[ChatHistoryItem]) -> (&[ChatHistoryItem], &[ChatHistoryItem]) {
    let index = history
        .iter()
        .rposition(|item| matches!(item, ChatHistoryItem::User { .. }))
        .unwrap_or(0);
    history.split_at(index)
}

fn instruction(chunk: &ChatChunk) -> LlamaText {
    LlamaText::join(
        "\n\n",
        [&chunk.system, &chunk.user].into_iter().filter(|text| !text.is_empty()),
    )
}

impl MistralChatWrapper {
    pub fn new(options: MistralChatWrapperOptions) -> Self {
        let settings = ChatWrapperSettings {
            supports_system_messages: true,
            functions: FunctionsSettings {
                call: FunctionCallSettings {
                    optional_prefix_space: true,
                    prefix: LlamaText::from("{\"name\": \""),
                    params_prefix: LlamaText::from("\", \"arguments\": "),
                    suffix: LlamaText::from("}"),
                    empty_call_params_placeholder: None,
                },
                result: FunctionResultSettings {
                    prefix: LlamaText::from("{\"name\": \"{{functionName}}\", \"content\": "),
                    suffix: LlamaText::from("}"),
                },
                parallelism: Some(ParallelismSettings {
                    call: CallParallelism {
                        section_prefix: llama_text![special("[TOOL_CALLS]"), "["],
                        between_calls: LlamaText::from(", "),
                        section_suffix: llama_text!["]", BuiltinToken::Eos],
                    },
                    result: ResultParallelism {
                        section_prefix: llama_text![special("[TOOL_RESULTS]"), "["],
                        between_results: LlamaText::from(", "),
                        section_suffix: llama_text!["]", special("[/TOOL_RESULTS]")],
                    },
                }),
            },
            segments: None,
        };
        Self { settings, options }
    }

    pub fn options(&self) -> &MistralChatWrapperOptions {
        &self.options
    }

    pub fn probes() -> Vec<Probe<MistralChatWrapperOptions>> {
        vec![
            Probe::same(|o| o.add_space_before_eos = false),
            Probe::same(|o| o.add_space_before_eos = true),
        ]
    }

    fn tools_text(&self, functions: Option<&ChatModelFunctions>, document_params: bool) -> Option<String> {
        let functions = functions?;
        let tools = FunctionsDocumentationGenerator::new(functions).tool_definitions(document_params);
        Some(json_dumps(&Value::Array(tools)))
    }

    fn space_before_eos(&self) -> LlamaText {
        if self.options.add_space_before_eos {
            LlamaText::from(" ")
        } else {
            LlamaText::new()
        }
    }
}

impl Default for MistralChatWrapper {
    fn default() -> Self {
        Self::new(MistralChatWrapperOptions::default())
    }
}

impl ChatWrapper for MistralChatWrapper {
    fn wrapper_name(&self) -> &str {
        "Mistral"
    }

    fn settings(&self) -> &ChatWrapperSettings {
        &self.settings
    }

    fn generate_context_state(&self, options: &ContextStateOptions<'_>) -> Result<ContextState> {
        let tools_text = self.tools_text(options.functions(), options.document_function_params);
        let (system_message, rest) = split_system_message(options.chat_history);
        let (earlier, last_interaction) = split_last_interaction(rest);

        let render_model = |response: &[ModelResponseItem]| self.generate_model_response_text(response, true);
        let earlier_chunks = chunk_chat_items(earlier, ChunkPolicy::JoinSystemAndUser, render_model);
        let last_chunks = chunk_chat_items(last_interaction, ChunkPolicy::JoinSystemAndUser, render_model);

        let mut parts = vec![LlamaText::from(BuiltinToken::Bos)];
        for chunk in &earlier_chunks {
            parts.push(LlamaText::from(special("[INST]")));
            parts.push(instruction(chunk));
            parts.push(LlamaText::from(special("[/INST]")));
            parts.push(chunk.model.clone());
            parts.push(self.space_before_eos());
            parts.push(LlamaText::from(BuiltinToken::Eos));
        }

        if let Some(tools_text) = tools_text {
            parts.push(llama_text![
                special("[AVAILABLE_TOOLS]"),
                tools_text,
                special("[/AVAILABLE_TOOLS]")
            ]);
        }

        let last = last_chunks.len().saturating_sub(1);
        for (i, chunk) in last_chunks.iter().enumerate() {
            parts.push(LlamaText::from(special("[INST]")));
            if i == last && !system_message.is_empty() {
                parts.push(system_message.clone());
                parts.push(LlamaText::from("\n\n"));
            }
            parts.push(instruction(chunk));
            parts.push(LlamaText::from(special("[/INST]")));
            parts.push(chunk.model.clone());
            parts.push(self.space_before_eos());
            if i != last {
                parts.push(LlamaText::from(BuiltinToken::Eos));
            }
        }

        Ok(ContextState::new(
            LlamaText::from_parts(parts),
            vec![LlamaText::from(BuiltinToken::Eos), LlamaText::from("</s>")],
        ))
    }

    /// Tools are rendered in their own block instead.
    fn add_available_functions_system_message_to_history<'h>(
        &self,
        history: &'h [ChatHistoryItem],
        _functions: Option<&ChatModelFunctions>,
        _document_params: bool,
    ) -> Cow<'h, [ChatHistoryItem]> {
        Cow::Borrowed(history)
    }

    fn generate_initial_chat_history(&self, system_prompt: Option<&str>) -> Vec<ChatHistoryItem> {
        match system_prompt {
            Some(prompt) if !prompt.trim().is_empty() => vec![ChatHistoryItem::system(prompt)],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{ChatModelFunction, ChatModelFunctionCall};
    use serde_json::json;

    #[test]
    fn system_message_moves_into_last_instruction() {
        let history = vec![
            ChatHistoryItem::system("Sys"),
            ChatHistoryItem::user("Hi"),
            ChatHistoryItem::model(["Hello"]),
            ChatHistoryItem::user("Bye"),
            ChatHistoryItem::model(["See you"]),
        ];
        let state = MistralChatWrapper::default()
            .generate_context_state(&ContextStateOptions::new(&history))
            .unwrap();
        assert_eq!(
            state.context_text,
            llama_text![
                BuiltinToken::Bos,
                special("[INST]"),
                "Hi",
                special("[/INST]"),
                "Hello",
                BuiltinToken::Eos,
                special("[INST]"),
                "Sys\n\nBye",
                special("[/INST]"),
                "See you",
            ]
        );
    }

    #[test]
    fn tools_block_precedes_last_instruction() {
        let functions = ChatModelFunctions::new().with(
            "getTime",
            ChatModelFunction::new(Some("Current time"), None),
        );
        let history = vec![ChatHistoryItem::user("Time?")];
        let state = MistralChatWrapper::default()
            .generate_context_state(&ContextStateOptions::new(&history).with_functions(&functions))
            .unwrap();
        assert_eq!(
            state.context_text,
            llama_text![
                BuiltinToken::Bos,
                special("[AVAILABLE_TOOLS]"),
                "[{\"type\": \"function\", \"function\": {\"name\": \"getTime\", \"description\": \"Current time\"}}]",
                special("[/AVAILABLE_TOOLS][INST]"),
                "Time?",
                special("[/INST]"),
            ]
        );
    }

    #[test]
    fn tool_calls_section() {
        let response = vec![
            ModelResponseItem::from(ChatModelFunctionCall::new("a", Some(json!({"x": 1})), Some(json!(2)))),
            ModelResponseItem::from(ChatModelFunctionCall::new("b", Some(json!({})), None)),
        ];
        let text = MistralChatWrapper::default().generate_model_response_text(&response, true);
        assert_eq!(
            text,
            llama_text![
                special("[TOOL_CALLS]"),
                "[{\"name\": \"a\", \"arguments\": {\"x\": 1}}, {\"name\": \"b\", \"arguments\": {}}]",
                BuiltinToken::Eos,
                special("[TOOL_RESULTS]"),
                "[{\"name\": \"a\", \"content\": 2}, {\"name\": \"b\", \"content\": void}]",
                special("[/TOOL_RESULTS]"),
            ]
        );
    }

    #[test]
    fn blank_system_prompt_gives_empty_history() {
        let wrapper = MistralChatWrapper::default();
        assert!(wrapper.generate_initial_chat_history(Some("  ")).is_empty());
        assert_eq!(wrapper.generate_initial_chat_history(Some("Hi")).len(), 1);
    }
}
