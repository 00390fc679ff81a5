//! Gemma turns. The format has no system role: system text is folded into
//! the next user turn, separated by a `---` rule.

use anyhow::Result;

use super::aggregate::{chunk_chat_items, ChunkPolicy};
use super::{ChatWrapper, ChatWrapperSettings, ContextState, ContextStateOptions, Probe};
use crate::llama_text;
use crate::text::{special, BuiltinToken, LlamaText};

pub struct GemmaChatWrapper {
    settings: ChatWrapperSettings,
}

impl GemmaChatWrapper {
    pub fn new() -> Self {
        Self {
            settings: ChatWrapperSettings {
                supports_system_messages: false,
                ..ChatWrapperSettings::default()
            },
        }
    }

    pub fn probes() -> Vec<Probe<()>> {
        vec![Probe::same(super::keep)]
    }
}

impl Default for GemmaChatWrapper {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatWrapper for GemmaChatWrapper {
    fn wrapper_name(&self) -> &str {
        "Gemma"
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
        let mut parts = vec![LlamaText::from(BuiltinToken::Bos)];
        for (i, chunk) in chunks.iter().enumerate() {
            let user = match (chunk.system.is_empty(), chunk.user.is_empty()) {
                (true, _) => chunk.user.clone(),
                (false, true) => chunk.system.clone(),
                (false, false) => llama_text![&chunk.system, "\n\n---\n\n", &chunk.user],
            };

            if !user.is_empty() {
                parts.push(llama_text![
                    special("<start_of_turn>user\n"),
                    user,
                    special("<end_of_turn>\n")
                ]);
            }
            if !chunk.model.is_empty() || i == last {
                parts.push(LlamaText::from(special("<start_of_turn>model\n")));
                parts.push(chunk.model.clone());
                if i != last {
                    parts.push(LlamaText::from(special("<end_of_turn>\n")));
                }
            }
        }

        Ok(ContextState::new(
            LlamaText::from_parts(parts),
            vec![
                LlamaText::from(BuiltinToken::Eos),
                LlamaText::from(special("<end_of_turn>\n")),
                LlamaText::from("<end_of_turn>"),
            ],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ChatHistoryItem;

    #[test]
    fn system_text_is_folded_into_user_turn() {
        let history = vec![
            ChatHistoryItem::system("Sys"),
            ChatHistoryItem::user("Hi"),
            ChatHistoryItem::model(["Hello"]),
        ];
        let state = GemmaChatWrapper::new()
            .generate_context_state(&ContextStateOptions::new(&history))
            .unwrap();
        assert_eq!(
            state.context_text,
            llama_text![
                BuiltinToken::Bos,
                special("<start_of_turn>user\n"),
                "Sys\n\n---\n\nHi",
                special("<end_of_turn>\n<start_of_turn>model\n"),
                "Hello",
            ]
        );
        assert!(!GemmaChatWrapper::new().settings().supports_system_messages);
    }

    #[test]
    fn lone_system_text_becomes_user_turn() {
        let history = vec![ChatHistoryItem::system("Sys")];
        let text = GemmaChatWrapper::new()
            .generate_context_state(&ContextStateOptions::new(&history))
            .unwrap()
            .context_text
            .to_string();
        assert_eq!(text, "BOS<start_of_turn>user\nSys<end_of_turn>\n<start_of_turn>model\n");
    }
}
