//! Llama 3 instruct: header-delimited turns closed by EOT, with function
//! results rendered as their own `function_call_result` turn.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::aggregate::{role_runs, Role};
use super::render::functions_instructions_text;
use super::{
    CallParallelism, ChatWrapper, ChatWrapperSettings, ContextState, ContextStateOptions, FunctionCallSettings,
    FunctionResultSettings, FunctionsSettings, ParallelismSettings, Probe, ResultParallelism,
};
use crate::history::ChatModelFunctions;
use crate::llama_text;
use crate::text::{special, BuiltinToken, LlamaText};

pub(crate) fn header(role: &str) -> LlamaText {
    LlamaText::from(special(format!("<|start_header_id|>{role}<|end_header_id|>\n\n")))
}

/// Stop triggers shared by the Llama 3 family.
pub(crate) fn llama3_stop_triggers() -> Vec<LlamaText> {
    vec![
        LlamaText::from(BuiltinToken::Eos),
        LlamaText::from(BuiltinToken::Eot),
        LlamaText::from(special("<|eot_id|>")),
        LlamaText::from(special("<|end_of_text|>")),
        LlamaText::from("<|eot_id|>"),
        LlamaText::from("<|end_of_text|>"),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Llama3ChatWrapperOptions {
    pub parallel_function_calling: bool,
}

impl Default for Llama3ChatWrapperOptions {
    fn default() -> Self {
        Self { parallel_function_calling: true }
    }
}

pub struct Llama3ChatWrapper {
    settings: ChatWrapperSettings,
    options: Llama3ChatWrapperOptions,
}

impl Llama3ChatWrapper {
    pub fn new(options: Llama3ChatWrapperOptions) -> Self {
        let call = FunctionCallSettings {
            optional_prefix_space: true,
            prefix: LlamaText::from("||call: "),
            params_prefix: LlamaText::from(special("(")),
            suffix: LlamaText::from(special(")")),
            empty_call_params_placeholder: None,
        };

        let functions = if options.parallel_function_calling {
            FunctionsSettings {
                call,
                result: FunctionResultSettings {
                    prefix: header("function_call_result"),
                    suffix: LlamaText::from(BuiltinToken::Eot),
                },
                parallelism: Some(ParallelismSettings {
                    call: CallParallelism {
                        section_prefix: LlamaText::new(),
                        between_calls: LlamaText::from("\n"),
                        section_suffix: LlamaText::from(BuiltinToken::Eot),
                    },
                    result: ResultParallelism {
                        section_prefix: LlamaText::new(),
                        between_results: LlamaText::new(),
                        section_suffix: header("assistant"),
                    },
                }),
            }
        } else {
            FunctionsSettings {
                call,
                result: FunctionResultSettings {
                    prefix: llama_text![BuiltinToken::Eot, header("function_call_result")],
                    suffix: llama_text![BuiltinToken::Eot, header("assistant")],
                },
                parallelism: None,
            }
        };

        Self {
            settings: ChatWrapperSettings {
                supports_system_messages: true,
                functions,
                segments: None,
            },
            options,
        }
    }

    pub fn options(&self) -> &Llama3ChatWrapperOptions {
        &self.options
    }

    pub fn probes() -> Vec<Probe<Llama3ChatWrapperOptions>> {
        vec![Probe::same(super::keep)]
    }
}

impl Default for Llama3ChatWrapper {
    fn default() -> Self {
        Self::new(Llama3ChatWrapperOptions::default())
    }
}

impl ChatWrapper for Llama3ChatWrapper {
    fn wrapper_name(&self) -> &str {
        "Llama3Chat"
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
        let runs = role_runs(&history, true, |response| self.generate_model_response_text(response, true));

        let last = runs.len().saturating_sub(1);
        let mut parts = vec![LlamaText::from(BuiltinToken::Bos)];
        for (i, run) in runs.iter().enumerate() {
            let role = match run.role {
                Role::System => "system",
                Role::User => "user",
                Role::Model => "assistant",
            };
            parts.push(header(role));
            parts.push(run.text());
            if run.role != Role::Model || i != last {
                parts.push(LlamaText::from(BuiltinToken::Eot));
            }
        }

        Ok(ContextState::new(LlamaText::from_parts(parts), llama3_stop_triggers()))
    }

    fn generate_available_functions_system_text(&self, functions: &ChatModelFunctions, document_params: bool) -> LlamaText {
        functions_instructions_text(self, functions, document_params, "")
    }
}
