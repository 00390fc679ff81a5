//! Markdown-titled fallback format.
//!
//! ```text
//! <bos>system text
//!
//! ### Human
//! Hi
//!
//! ### Assistant
//! Hello
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::aggregate::{chunk_chat_items, ChatChunk, ChunkPolicy};
use super::{ChatWrapper, ChatWrapperSettings, ContextState, ContextStateOptions, Probe};
use crate::llama_text;
use crate::text::{special, BuiltinToken, LlamaText};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GeneralChatWrapperOptions {
    pub user_message_title: String,
    pub model_response_title: String,
    pub middle_system_message_title: String,
    /// Emit the title delimiters as special-token text.
    pub allow_special_tokens_in_titles: bool,
}

impl Default for GeneralChatWrapperOptions {
    fn default() -> Self {
        Self {
            user_message_title: "Human".to_string(),
            model_response_title: "Assistant".to_string(),
            middle_system_message_title: "System".to_string(),
            allow_special_tokens_in_titles: false,
        }
    }
}

/// Headers and separator of a titled-block format. Shared with Falcon,
/// whose blocks differ only in how a title is written.
#[derive(Debug, Clone)]
pub(crate) struct TitledBlocks {
    pub system_header: LlamaText,
    pub user_header: LlamaText,
    pub model_header: LlamaText,
    pub block_end: LlamaText,
}

impl TitledBlocks {
    /// Render chunks after a BOS. The first system block has no header and
    /// the last model block is left open.
    pub fn render(&self, chunks: &[ChatChunk]) -> LlamaText {
        let last = chunks.len().saturating_sub(1);
        let mut parts = vec![LlamaText::from(BuiltinToken::Bos)];

        for (i, chunk) in chunks.iter().enumerate() {
            let is_last = i == last;

            if !chunk.system.is_empty() {
                if i > 0 {
                    parts.push(self.system_header.clone());
                }
                parts.push(chunk.system.clone());
                parts.push(self.block_end.clone());
            }
            if !chunk.user.is_empty() {
                parts.push(self.user_header.clone());
                parts.push(chunk.user.clone());
                parts.push(self.block_end.clone());
            }
            if !chunk.model.is_empty() || is_last {
                parts.push(self.model_header.clone());
                parts.push(chunk.model.clone());
                if !is_last {
                    parts.push(self.block_end.clone());
                }
            }
        }

        LlamaText::from_parts(parts)
    }
}

/// Wrap `text` as special-token text when `allow` is set.
pub(crate) fn maybe_special(allow: bool, text: String) -> LlamaText {
    if allow {
        LlamaText::from(special(text))
    } else {
        LlamaText::from(text)
    }
}

pub struct GeneralChatWrapper {
    name: &'static str,
    settings: ChatWrapperSettings,
    options: GeneralChatWrapperOptions,
    blocks: TitledBlocks,
    stop_triggers: Vec<LlamaText>,
}

impl GeneralChatWrapper {
    pub fn new(options: GeneralChatWrapperOptions) -> Self {
        Self::named("General", options)
    }

    pub(crate) fn named(name: &'static str, options: GeneralChatWrapperOptions) -> Self {
        let allow = options.allow_special_tokens_in_titles;
        let header = |title: &str| maybe_special(allow, format!("### {title}\n"));

        let blocks = TitledBlocks {
            system_header: header(&options.middle_system_message_title),
            user_header: header(&options.user_message_title),
            model_header: header(&options.model_response_title),
            block_end: LlamaText::from("\n\n"),
        };

        let mut stop_triggers = vec![
            LlamaText::from(BuiltinToken::Eos),
            LlamaText::from(special("<end>")),
            LlamaText::from("<end>"),
        ];
        for title in [
            &options.user_message_title,
            &options.model_response_title,
            &options.middle_system_message_title,
        ] {
            for lead in ["", "\n", "\n\n"] {
                stop_triggers.push(LlamaText::from(format!("{lead}### {title}")));
                if allow {
                    stop_triggers.push(llama_text![lead, special(format!("### {title}"))]);
                }
            }
        }

        Self {
            name,
            settings: ChatWrapperSettings::default(),
            options,
            blocks,
            stop_triggers,
        }
    }

    pub fn options(&self) -> &GeneralChatWrapperOptions {
        &self.options
    }

    pub fn probes() -> Vec<Probe<GeneralChatWrapperOptions>> {
        vec![
            Probe::same(super::keep),
            Probe::same(|o| o.allow_special_tokens_in_titles = true),
        ]
    }
}

impl Default for GeneralChatWrapper {
    fn default() -> Self {
        Self::new(GeneralChatWrapperOptions::default())
    }
}

impl ChatWrapper for GeneralChatWrapper {
    fn wrapper_name(&self) -> &str {
        self.name
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

    fn render(wrapper: &GeneralChatWrapper, history: &[ChatHistoryItem]) -> ContextState {
        wrapper.generate_context_state(&ContextStateOptions::new(history)).unwrap()
    }

    #[test]
    fn renders_titled_blocks() {
        let history = vec![
            ChatHistoryItem::system("Be brief."),
            ChatHistoryItem::user("Hi"),
            ChatHistoryItem::model(["Hello"]),
            ChatHistoryItem::user("Bye"),
        ];
        let state = render(&GeneralChatWrapper::default(), &history);
        assert_eq!(
            state.context_text,
            llama_text![
                BuiltinToken::Bos,
                "Be brief.\n\n### Human\nHi\n\n### Assistant\nHello\n\n### Human\nBye\n\n### Assistant\n"
            ]
        );
    }

    #[test]
    fn middle_system_message_gets_a_title() {
        let history = vec![
            ChatHistoryItem::user("Hi"),
            ChatHistoryItem::system("Note"),
            ChatHistoryItem::user("Go"),
        ];
        let text = render(&GeneralChatWrapper::default(), &history).context_text.to_string();
        assert!(text.contains("### System\nNote\n\n"), "got {text:?}");
    }

    #[test]
    fn special_titles_add_special_triggers() {
        let wrapper = GeneralChatWrapper::new(GeneralChatWrapperOptions {
            allow_special_tokens_in_titles: true,
            ..Default::default()
        });
        let state = render(&wrapper, &[ChatHistoryItem::user("Hi")]);
        assert_eq!(
            state.context_text,
            llama_text![
                BuiltinToken::Bos,
                special("### Human\n"),
                "Hi\n\n",
                special("### Assistant\n")
            ]
        );
        assert_eq!(state.stop_generation_triggers.len(), 3 + 18);
        assert!(state
            .stop_generation_triggers
            .contains(&llama_text!["\n", special("### Human")]));
    }

    #[test]
    fn plain_triggers_cover_every_title() {
        let state = render(&GeneralChatWrapper::default(), &[]);
        assert_eq!(state.context_text, LlamaText::from(BuiltinToken::Bos));
        assert_eq!(state.stop_generation_triggers.len(), 3 + 9);
        assert!(state.stop_generation_triggers.contains(&LlamaText::from("\n\n### Assistant")));
    }
}
