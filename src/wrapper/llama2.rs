//! Llama 2 chat: `<s>[INST] <<SYS>>\n...\n<</SYS>>\n\nuser [/INST] model</s>`.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::aggregate::{chunk_chat_items, ChunkPolicy};
use super::{ChatWrapper, ChatWrapperSettings, ContextState, ContextStateOptions, Probe};
use crate::text::{special, BuiltinToken, LlamaText};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Llama2ChatWrapperOptions {
    /// Put a space between each model response and the EOS after it.
    pub add_space_before_eos: bool,
}

pub struct Llama2ChatWrapper {
    settings: ChatWrapperSettings,
    options: Llama2ChatWrapperOptions,
}

impl Llama2ChatWrapper {
    pub fn new(options: Llama2ChatWrapperOptions) -> Self {
        Self {
            settings: ChatWrapperSettings::default(),
            options,
        }
    }

    pub fn options(&self) -> &Llama2ChatWrapperOptions {
        &self.options
    }

    pub fn probes() -> Vec<Probe<Llama2ChatWrapperOptions>> {
        vec![
            Probe::same(|o| o.add_space_before_eos = false),
            Probe::same(|o| o.add_space_before_eos = true),
        ]
    }
}

impl Default for Llama2ChatWrapper {
    fn default() -> Self {
        Self::new(Llama2ChatWrapperOptions::default())
    }
}

impl ChatWrapper for Llama2ChatWrapper {
    fn wrapper_name(&self) -> &str {
        "Llama2Chat"
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
        let chunks = chunk_chat_items(&history, ChunkPolicy::JoinSystemAndUser, |response| {
            self.generate_model_response_text(response, true)
        });

        let last = chunks.len().saturating_sub(1);
        let mut parts = Vec::with_capacity(chunks.len() * 8);
        for (i, chunk) in chunks.iter().enumerate() {
            parts.push(LlamaText::from(BuiltinToken::Bos));
            if !chunk.system.is_empty() || !chunk.user.is_empty() {
                parts.push(LlamaText::from(special("[INST] ")));
                if !chunk.system.is_empty() {
                    parts.push(LlamaText::from(special("<<SYS>>\n")));
                    parts.push(chunk.system.clone());
                    parts.push(LlamaText::from(special("\n<</SYS>>\n\n")));
                }
                parts.push(chunk.user.clone());
                parts.push(LlamaText::from(special(" [/INST] ")));
            }
            parts.push(chunk.model.clone());
            if self.options.add_space_before_eos {
                parts.push(LlamaText::from(" "));
            }
            if i != last {
                parts.push(LlamaText::from(BuiltinToken::Eos));
            }
        }

        Ok(ContextState::new(
            LlamaText::from_parts(parts),
            vec![LlamaText::from(BuiltinToken::Eos), LlamaText::from("</s>")],
        ))
    }
}
