//! Alpaca instruction format, the titled-block layout with `### Instruction:`
//! and `### Response:` headers.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::general::{GeneralChatWrapper, GeneralChatWrapperOptions};
use super::{ChatWrapper, ChatWrapperSettings, ContextState, ContextStateOptions, Probe};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlpacaChatWrapperOptions {
    pub user_message_title: String,
    pub model_response_title: String,
    pub middle_system_message_title: String,
    pub allow_special_tokens_in_titles: bool,
}

impl Default for AlpacaChatWrapperOptions {
    fn default() -> Self {
        Self {
            user_message_title: "Instruction".to_string(),
            model_response_title: "Response".to_string(),
            middle_system_message_title: "System".to_string(),
            allow_special_tokens_in_titles: false,
        }
    }
}

pub struct AlpacaChatWrapper {
    options: AlpacaChatWrapperOptions,
    inner: GeneralChatWrapper,
}

impl AlpacaChatWrapper {
    pub fn new(options: AlpacaChatWrapperOptions) -> Self {
        let inner = GeneralChatWrapper::named(
            "AlpacaChat",
            GeneralChatWrapperOptions {
                user_message_title: format!("{}:", options.user_message_title),
                model_response_title: format!("{}:", options.model_response_title),
                middle_system_message_title: format!("{}:", options.middle_system_message_title),
                allow_special_tokens_in_titles: options.allow_special_tokens_in_titles,
            },
        );
        Self { options, inner }
    }

    /// Titles as given, without the trailing colon.
    pub fn options(&self) -> &AlpacaChatWrapperOptions {
        &self.options
    }

    pub fn probes() -> Vec<Probe<AlpacaChatWrapperOptions>> {
        vec![
            Probe::same(super::keep),
            Probe::same(|o| o.allow_special_tokens_in_titles = true),
        ]
    }
}

impl Default for AlpacaChatWrapper {
    fn default() -> Self {
        Self::new(AlpacaChatWrapperOptions::default())
    }
}

impl ChatWrapper for AlpacaChatWrapper {
    fn wrapper_name(&self) -> &str {
        self.inner.wrapper_name()
    }

    fn settings(&self) -> &ChatWrapperSettings {
        self.inner.settings()
    }

    fn generate_context_state(&self, options: &ContextStateOptions<'_>) -> Result<ContextState> {
        self.inner.generate_context_state(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ChatHistoryItem;
    use crate::llama_text;
    use crate::text::{BuiltinToken, LlamaText};

    #[test]
    fn titles_end_with_colon() {
        let wrapper = AlpacaChatWrapper::default();
        let history = vec![ChatHistoryItem::user("Sort these"), ChatHistoryItem::model(["Done"])];
        let state = wrapper.generate_context_state(&ContextStateOptions::new(&history)).unwrap();

        assert_eq!(
            state.context_text,
            llama_text![BuiltinToken::Bos, "### Instruction:\nSort these\n\n### Response:\nDone"]
        );
        assert!(state.stop_generation_triggers.contains(&LlamaText::from("\n### Instruction:")));
        assert_eq!(wrapper.wrapper_name(), "AlpacaChat");
        assert_eq!(wrapper.options().user_message_title, "Instruction");
    }
}
