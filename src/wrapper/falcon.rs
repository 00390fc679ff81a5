//! Falcon format: `User: ...` / `Assistant: ...` blocks.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::aggregate::{chunk_chat_items, ChunkPolicy};
use super::general::{maybe_special, TitledBlocks};
use super::{ChatWrapper, ChatWrapperSettings, ContextState, ContextStateOptions, Probe};
use crate::text::{special, BuiltinToken, LlamaText};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FalconChatWrapperOptions {
    pub user_message_title: String,
    pub model_response_title: String,
    pub middle_system_message_title: String,
    pub allow_special_tokens_in_titles: bool,
}

impl Default for FalconChatWrapperOptions {
    fn default() -> Self {
        Self {
            user_message_title: "User".to_string(),
            model_response_title: "Assistant".to_string(),
            middle_system_message_title: "System".to_string(),
            allow_special_tokens_in_titles: false,
        }
    }
}

pub struct FalconChatWrapper {
    settings: ChatWrapperSettings,
    options: FalconChatWrapperOptions,
    blocks: TitledBlocks,
    stop_triggers: Vec<LlamaText>,
}

impl FalconChatWrapper {
    pub fn new(options: FalconChatWrapperOptions) -> Self {
        let allow = options.allow_special_tokens_in_titles;
        let header = |title: &str| maybe_special(allow, format!("{title}: "));

        let blocks = TitledBlocks {
            system_header: header(&options.middle_system_message_title),
            user_header: header(&options.user_message_title),
            model_header: header(&options.model_response_title),
            block_end: maybe_special(allow, "\n\n".to_string()),
        };

        let titles = [
            &options.user_message_title,
            &options.model_response_title,
            &options.middle_system_message_title,
        ];
        let mut stop_triggers = vec![LlamaText::from(BuiltinToken::Eos)];
        stop_triggers.extend(titles.iter().map(|title| LlamaText::from(format!("\n{title}:"))));
        if allow {
            stop_triggers.extend(titles.iter().map(|title| LlamaText::from(special(format!("\n{title}:")))));
        }

        Self {
            settings: ChatWrapperSettings::default(),
            options,
            blocks,
            stop_triggers,
        }
    }

    pub fn options(&self) -> &FalconChatWrapperOptions {
        &self.options
    }

    pub fn probes() -> Vec<Probe<FalconChatWrapperOptions>> {
        vec![
            Probe::same(super::keep),
            Probe::same(|o| o.allow_special_tokens_in_titles = true),
        ]
    }
}

impl Default for FalconChatWrapper {
    fn default() -> Self {
        Self::new(FalconChatWrapperOptions::default())
    }
}

impl ChatWrapper for FalconChatWrapper {
    fn wrapper_name(&self) -> &str {
        "Falcon"
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

        Ok(ContextState::new(self.blocks.render(&chunks), self.stop_triggers.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ChatHistoryItem;
    use crate::llama_text;

    fn history() -> Vec<ChatHistoryItem> {
        vec![
            ChatHistoryItem::system("Be kind."),
            ChatHistoryItem::user("Hi"),
            ChatHistoryItem::model(["Hello"]),
        ]
    }

    #[test]
    fn plain_titles() {
        let state = FalconChatWrapper::default()
            .generate_context_state(&ContextStateOptions::new(&history()))
            .unwrap();
        assert_eq!(
            state.context_text,
            llama_text![BuiltinToken::Bos, "Be kind.\n\nUser: Hi\n\nAssistant: Hello"]
        );
        assert_eq!(
            state.stop_generation_triggers,
            vec![
                LlamaText::from(BuiltinToken::Eos),
                LlamaText::from("\nUser:"),
                LlamaText::from("\nAssistant:"),
                LlamaText::from("\nSystem:"),
            ]
        );
    }

    #[test]
    fn special_titles() {
        let wrapper = FalconChatWrapper::new(FalconChatWrapperOptions {
            allow_special_tokens_in_titles: true,
            ..Default::default()
        });
        let state = wrapper.generate_context_state(&ContextStateOptions::new(&history())).unwrap();
        assert_eq!(
            state.context_text,
            llama_text![
                BuiltinToken::Bos,
                "Be kind.",
                special("\n\nUser: "),
                "Hi",
                special("\n\nAssistant: "),
                "Hello"
            ]
        );
        assert_eq!(state.stop_generation_triggers.len(), 7);
    }
}
