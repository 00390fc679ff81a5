//! ChatML: `<|im_start|>role\n ... <|im_end|>\n` blocks.

use anyhow::Result;

use super::aggregate::{chunk_chat_items, ChunkPolicy};
use super::{ChatWrapper, ChatWrapperSettings, ContextState, ContextStateOptions, Probe};
use crate::llama_text;
use crate::text::{special, BuiltinToken, LlamaText};

const IM_END: &str = "<|im_end|>";

fn block(role: &str, text: &LlamaText, close: bool) -> LlamaText {
    llama_text![
        special(format!("<|im_start|>{role}\n")),
        text,
        if close { LlamaText::from(special(format!("{IM_END}\n"))) } else { LlamaText::new() }
    ]
}

pub struct ChatMlChatWrapper {
    settings: ChatWrapperSettings,
}

impl ChatMlChatWrapper {
    pub fn new() -> Self {
        Self { settings: ChatWrapperSettings::default() }
    }

    pub fn probes() -> Vec<Probe<()>> {
        vec![Probe::same(super::keep)]
    }
}

impl Default for ChatMlChatWrapper {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatWrapper for ChatMlChatWrapper {
    fn wrapper_name(&self) -> &str {
        "ChatML"
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
        let chunks = chunk_chat_items(&history, ChunkPolicy::JoinSystem, |response| {
            self.generate_model_response_text(response, true)
        });

        let last = chunks.len().saturating_sub(1);
        let mut parts = vec![LlamaText::from(BuiltinToken::Bos)];
        for (i, chunk) in chunks.iter().enumerate() {
            if !chunk.system.is_empty() {
                parts.push(block("system", &chunk.system, true));
            }
            if !chunk.user.is_empty() {
                parts.push(block("user", &chunk.user, true));
            }
            if !chunk.model.is_empty() || i == last {
                parts.push(block("assistant", &chunk.model, i != last));
            }
        }

        Ok(ContextState::new(
            LlamaText::from_parts(parts),
            vec![
                LlamaText::from(BuiltinToken::Eos),
                LlamaText::from(special(IM_END)),
                LlamaText::from(IM_END),
            ],
        ))
    }
}
