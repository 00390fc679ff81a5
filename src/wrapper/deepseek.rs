//! DeepSeek R1 format. All system text is rendered first; turns follow as
//! `<｜User｜>` / `<｜Assistant｜>` with `<think>` thought segments.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::docs::FunctionsDocumentationGenerator;
use super::{
    CallParallelism, ChatWrapper, ChatWrapperSettings, ContextState, ContextStateOptions, FunctionCallSettings,
    FunctionResultSettings, FunctionsSettings, ParallelismSettings, Probe, ResultParallelism, SegmentSettings,
    SegmentsSettings,
};
use crate::history::{ChatHistoryItem, ChatModelFunctions, ModelResponseItem, SegmentType};
use crate::llama_text;
use crate::text::{special, BuiltinToken, LlamaText};

const END_OF_SENTENCE: &str = "<｜end▁of▁sentence｜>";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeepSeekChatWrapperOptions {
    /// Drop thought segments from every model turn but the last item.
    pub keep_only_last_thought: bool,
}

impl Default for DeepSeekChatWrapperOptions {
    fn default() -> Self {
        Self { keep_only_last_thought: true }
    }
}

pub struct DeepSeekChatWrapper {
    settings: ChatWrapperSettings,
    options: DeepSeekChatWrapperOptions,
}

impl DeepSeekChatWrapper {
    pub fn new(options: DeepSeekChatWrapperOptions) -> Self {
        let mut thought = SegmentSettings::new(special("<think>"), special("</think>"));
        thought.reopen_after_function_calls = true;

        let settings = ChatWrapperSettings {
            supports_system_messages: true,
            functions: FunctionsSettings {
                call: FunctionCallSettings {
                    optional_prefix_space: true,
                    prefix: LlamaText::from(special("<｜tool▁call▁begin｜>function<｜tool▁sep｜>")),
                    params_prefix: LlamaText::from("\n```json\n"),
                    suffix: llama_text!["\n```", special("<｜tool▁call▁end｜>")],
                    empty_call_params_placeholder: None,
                },
                result: FunctionResultSettings {
                    prefix: LlamaText::from(special("<｜tool▁output▁begin｜>")),
                    suffix: llama_text![BuiltinToken::Eot, special("<｜tool▁output▁end｜>")],
                },
                parallelism: Some(ParallelismSettings {
                    call: CallParallelism {
                        section_prefix: LlamaText::from(special("<｜tool▁calls▁begin｜>")),
                        between_calls: LlamaText::from("\n"),
                        section_suffix: LlamaText::from(special(format!("<｜tool▁calls▁end｜>{END_OF_SENTENCE}"))),
                    },
                    result: ResultParallelism {
                        section_prefix: LlamaText::from(special("<｜tool▁outputs▁begin｜>")),
                        between_results: LlamaText::from("\n"),
                        section_suffix: LlamaText::from(special("<｜tool▁outputs▁end｜>")),
                    },
                }),
            },
            segments: Some(SegmentsSettings {
                thought: Some(thought),
                ..Default::default()
            }),
        };
        Self { settings, options }
    }

    pub fn options(&self) -> &DeepSeekChatWrapperOptions {
        &self.options
    }

    pub fn probes() -> Vec<Probe<DeepSeekChatWrapperOptions>> {
        vec![
            Probe::same(super::keep),
            Probe::same(|o| o.keep_only_last_thought = false),
        ]
    }

    /// `<calls begin><call begin>function<sep>{name}\n```json\n{params}\n```<call end>...<calls end>`
    fn call_example(&self, calls: &[(&str, &str)]) -> LlamaText {
        let functions = &self.settings.functions;
        let Some(parallelism) = &functions.parallelism else {
            return LlamaText::new();
        };
        let calls = calls.iter().map(|(name, params)| {
            llama_text![
                &functions.call.prefix,
                *name,
                &functions.call.params_prefix,
                *params,
                &functions.call.suffix
            ]
        });
        llama_text![
            &parallelism.call.section_prefix,
            LlamaText::join(&parallelism.call.between_calls, calls),
            &parallelism.call.section_suffix
        ]
    }
}

impl Default for DeepSeekChatWrapper {
    fn default() -> Self {
        Self::new(DeepSeekChatWrapperOptions::default())
    }
}

impl ChatWrapper for DeepSeekChatWrapper {
    fn wrapper_name(&self) -> &str {
        "DeepSeek"
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

        let system_texts = history.iter().filter_map(|item| match item {
            ChatHistoryItem::System { text } => Some(text.clone()),
            _ => None,
        });
        let mut parts = vec![LlamaText::from(BuiltinToken::Bos), LlamaText::join("\n\n", system_texts)];

        let last = history.len().saturating_sub(1);
        for (i, item) in history.iter().enumerate() {
            match item {
                ChatHistoryItem::System { .. } => {}
                ChatHistoryItem::User { text } => {
                    parts.push(llama_text![special("<｜User｜>"), text]);
                }
                ChatHistoryItem::Model { response } => {
                    let rendered = if self.options.keep_only_last_thought && i != last {
                        let filtered: Vec<ModelResponseItem> = response
                            .iter()
                            .filter(|item| !matches!(item, ModelResponseItem::Segment(s) if s.segment_type == SegmentType::Thought))
                            .cloned()
                            .collect();
                        self.generate_model_response_text(&filtered, true)
                    } else {
                        self.generate_model_response_text(response, true)
                    };
                    parts.push(LlamaText::from(special("<｜Assistant｜>")));
                    parts.push(rendered);
                    if i != last {
                        parts.push(LlamaText::from(special(END_OF_SENTENCE)));
                    }
                }
            }
        }

        Ok(ContextState::new(
            LlamaText::from_parts(parts),
            vec![
                LlamaText::from(BuiltinToken::Eos),
                LlamaText::from(BuiltinToken::Eot),
                LlamaText::from(special(END_OF_SENTENCE)),
                LlamaText::from(special("<｜User｜>")),
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
                LlamaText::from("You have access to the following functions:"),
                LlamaText::new(),
                LlamaText::from(docs.llama3_2_lightweight_function_signatures(document_params)),
                LlamaText::new(),
                LlamaText::new(),
                LlamaText::from("If you choose to call a function ONLY reply in the following format:"),
                self.call_example(&[("functionName", "parameters")]),
                LlamaText::from("where"),
                LlamaText::new(),
                LlamaText::from("functionName => the function name to call"),
                LlamaText::from("parameters => a JSON dict with the function arguments"),
                LlamaText::new(),
                LlamaText::new(),
                LlamaText::from("You can call multiple functions in parallel using the following format:"),
                self.call_example(&[("functionName1", "parameters1"), ("functionName2", "parameters2")]),
                LlamaText::new(),
                LlamaText::from("Reminder:"),
                LlamaText::from("- Function calls MUST follow the specified format"),
                LlamaText::from("- You can call multiple functions at a time, their responses will appear in the order they were called"),
            ],
        )
    }
}
