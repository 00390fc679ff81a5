//! Seed-OSS format: `<seed:bos>role\n ... \n<seed:eos>` turns, an optional
//! thinking-budget instruction and `<seed:think>` thought segments.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::docs::FunctionsDocumentationGenerator;
use super::{
    ChatWrapper, ChatWrapperSettings, ContextState, ContextStateOptions, FunctionCallSettings, FunctionResultSettings,
    FunctionsSettings, Probe, SegmentSettings, SegmentsSettings,
};
use crate::history::{ChatHistoryItem, ChatModelFunctions, ModelResponseItem, SegmentType};
use crate::llama_text;
use crate::text::{special, BuiltinToken, LlamaText};

const DEFAULT_FUNCTIONS_SYSTEM_PROMPT: &str =
    "You are Doubao, a helpful AI assistant. You may call one or more functions to assist with the user query.";

/// Budget upper bounds and the reflection interval used up to each.
const REFLECTION_INTERVALS: &[(u32, u32)] = &[(512, 128), (1024, 256), (2048, 512), (4096, 512), (8192, 1024), (16384, 1024)];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SeedChatWrapperOptions {
    /// Thinking budget requested from the model, in tokens. `Some(0)` asks
    /// it to skip reasoning; `None` leaves reasoning unlimited.
    pub thinking_budget: Option<u32>,
}

pub struct SeedChatWrapper {
    settings: ChatWrapperSettings,
    options: SeedChatWrapperOptions,
}

fn turn(role: &str, text: impl Into<LlamaText>, close: bool) -> LlamaText {
    llama_text![
        special(format!("<seed:bos>{role}\n")),
        text.into(),
        if close { LlamaText::from(special("\n<seed:eos>")) } else { LlamaText::new() }
    ]
}

impl SeedChatWrapper {
    pub fn new(options: SeedChatWrapperOptions) -> Self {
        let mut thought = SegmentSettings::new(special("<seed:think>"), special("</seed:think>"));
        thought.reopen_after_function_calls = true;

        let settings = ChatWrapperSettings {
            supports_system_messages: true,
            functions: FunctionsSettings {
                call: FunctionCallSettings {
                    optional_prefix_space: true,
                    prefix: llama_text![special("<seed:tool_call>\n"), "<function="],
                    params_prefix: LlamaText::from(special(">")),
                    suffix: LlamaText::from(special("\n</function>\n</seed:tool_call>\n")),
                    empty_call_params_placeholder: Some(serde_json::json!({})),
                },
                result: FunctionResultSettings {
                    prefix: LlamaText::from(special("<seed:bos>tool\n")),
                    suffix: LlamaText::from(special("<seed:eos>")),
                },
                parallelism: None,
            },
            segments: Some(SegmentsSettings {
                thought: Some(thought),
                ..Default::default()
            }),
        };
        Self { settings, options }
    }

    pub fn options(&self) -> &SeedChatWrapperOptions {
        &self.options
    }

    pub fn probes() -> Vec<Probe<SeedChatWrapperOptions>> {
        vec![Probe::same(super::keep)]
    }

    fn first_system_message(
        &self,
        system_prompt: &LlamaText,
        functions: Option<&ChatModelFunctions>,
        document_params: bool,
    ) -> LlamaText {
        let functions_text = functions
            .map(|functions| self.generate_available_functions_system_text(functions, document_params))
            .unwrap_or_default();

        let prompt = if system_prompt.is_empty() && !functions_text.is_empty() {
            LlamaText::from(DEFAULT_FUNCTIONS_SYSTEM_PROMPT)
        } else {
            system_prompt.clone()
        };
        llama_text![prompt, functions_text]
    }

    fn thinking_budget_message(&self) -> Option<String> {
        let budget = self.options.thinking_budget?;
        if budget == 0 {
            return Some(
                "You are an intelligent assistant that can answer questions in one step without the need for reasoning and thinking, \
                 that is, your thinking budget is 0. \
                 Next, please skip the thinking process and directly start answering the user's questions."
                    .to_string(),
            );
        }

        let interval = REFLECTION_INTERVALS
            .iter()
            .find(|(max_budget, _)| budget <= *max_budget)
            .map_or(1024, |(_, interval)| *interval);
        Some(format!(
            "You are an intelligent assistant with reflective ability. In the process of thinking and reasoning, \
             you need to strictly follow the thinking budget, which is {budget}. \
             That is, you need to complete your thinking within {budget} tokens and start answering the user's questions. \
             You will reflect on your thinking process every {interval} tokens, \
             stating how many tokens have been used and how many are left."
        ))
    }

    fn no_thinking_thought() -> LlamaText {
        llama_text![
            special("<seed:think>\n<seed:cot_budget_reflect>"),
            "The current thinking budget is 0, so I will directly start answering the question.",
            special("</seed:cot_budget_reflect>\n</seed:think>")
        ]
    }
}

impl Default for SeedChatWrapper {
    fn default() -> Self {
        Self::new(SeedChatWrapperOptions::default())
    }
}

impl ChatWrapper for SeedChatWrapper {
    fn wrapper_name(&self) -> &str {
        "Seed"
    }

    fn settings(&self) -> &ChatWrapperSettings {
        &self.settings
    }

    fn generate_context_state(&self, options: &ContextStateOptions<'_>) -> Result<ContextState> {
        let (system_prompt, history) = match options.chat_history {
            [ChatHistoryItem::System { text }, rest @ ..] => (text.clone(), rest),
            history => (LlamaText::new(), history),
        };

        let mut parts = Vec::new();
        let functions = options.functions();
        if !system_prompt.is_empty() || functions.is_some() {
            let first = self.first_system_message(&system_prompt, functions, options.document_function_params);
            parts.push(turn("system", first, true));
        }
        if let Some(budget_message) = self.thinking_budget_message() {
            parts.push(turn("system", budget_message, true));
        }

        let last = history.len().saturating_sub(1);
        for (i, item) in history.iter().enumerate() {
            let is_last = i == last;
            match item {
                ChatHistoryItem::System { text } => parts.push(turn("system", text, !is_last)),
                ChatHistoryItem::User { text } => parts.push(turn("user", text, !is_last)),
                ChatHistoryItem::Model { response } => {
                    let has_thought = response
                        .iter()
                        .any(|item| matches!(item, ModelResponseItem::Segment(s) if s.segment_type == SegmentType::Thought));
                    let inject_no_thinking = self.options.thinking_budget == Some(0) && (is_last || !has_thought);

                    let body = llama_text![
                        if inject_no_thinking { Self::no_thinking_thought() } else { LlamaText::new() },
                        self.generate_model_response_text(response, true)
                    ];
                    parts.push(turn("assistant", body, !is_last));
                }
            }
        }

        Ok(ContextState::new(
            LlamaText::from_parts(parts),
            vec![
                LlamaText::from(BuiltinToken::Eos),
                LlamaText::from(special("<seed:eos>")),
                LlamaText::from("<seed:eos>"),
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
                LlamaText::new(),
                LlamaText::from("Tool List:"),
                LlamaText::from(
                    "You are authorized to use the following tools (described in JSON Schema format). \
                     Before performing any task, you must decide how to call them based on the descriptions and parameters of these tools.",
                ),
                LlamaText::from(docs.seed_function_signatures(document_params)),
                LlamaText::from("When invoking tools, strictly adhere to the following format:"),
                LlamaText::from(special(
                    "<seed:tool_call>\n<function=example_function_name>\n\
                     {\"example_parameter_1\": \"value_1\", \"example_parameter_2\": \"This is the value for the second parameter\"}\
                     </function>\n</seed:tool_call>",
                )),
            ],
        )
    }
}
