//! User-defined placeholder templates.
//!
//! ```text
//! template:          "{{systemPrompt}}\n{{history}}model: {{completion}}\nuser: "
//! history_template:  system: "system: {{message}}\n"
//!                    user:   "user: {{message}}\n"
//!                    model:  "model: {{message}}\n"
//! ```
//!
//! Template literal text is emitted as special-token text; message content
//! stays plain.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use super::aggregate::{chunk_chat_items, ChunkPolicy};
use super::{ChatWrapper, ChatWrapperSettings, ContextState, ContextStateOptions, FunctionCallSettings, FunctionResultSettings};
use crate::llama_text;
use crate::template::{parse_text_template, TemplatePart};
use crate::text::{special, BuiltinToken, LlamaText};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryTemplate {
    pub system: String,
    pub user: String,
    pub model: String,
}

/// `call` holds `{{functionName}}` then `{{functionParams}}`; `result`
/// holds `{{functionCallResult}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallMessageTemplate {
    pub call: String,
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateChatWrapperOptions {
    pub template: String,
    pub history_template: HistoryTemplate,
    #[serde(default)]
    pub function_call_message_template: Option<FunctionCallMessageTemplate>,
    #[serde(default = "default_join")]
    pub join_adjacent_messages_of_the_same_type: bool,
}

fn default_join() -> bool {
    true
}

impl TemplateChatWrapperOptions {
    pub fn new(template: &str, history_template: HistoryTemplate) -> Self {
        Self {
            template: template.to_string(),
            history_template,
            function_call_message_template: None,
            join_adjacent_messages_of_the_same_type: true,
        }
    }
}

#[derive(Debug, Clone)]
struct Affixes {
    prefix: String,
    suffix: String,
}

impl Affixes {
    fn wrap(&self, text: &LlamaText) -> LlamaText {
        llama_text![special(self.prefix.as_str()), text, special(self.suffix.as_str())]
    }
}

#[derive(Debug, Clone)]
struct ParsedChatTemplate {
    system_prompt_prefix: Option<String>,
    history_prefix: String,
    completion_prefix: String,
    completion_suffix: String,
}

pub struct TemplateChatWrapper {
    settings: ChatWrapperSettings,
    options: TemplateChatWrapperOptions,
    chat: ParsedChatTemplate,
    system: Affixes,
    user: Affixes,
    model: Affixes,
}

impl TemplateChatWrapper {
    pub fn new(options: TemplateChatWrapperOptions) -> Result<Self> {
        let chat = parse_chat_template(&options.template)?;
        let history = &options.history_template;

        let mut settings = ChatWrapperSettings::default();
        if let Some(template) = &options.function_call_message_template {
            let (call, result) = parse_function_call_message_template(template)?;
            settings.functions.call = call;
            settings.functions.result = result;
        }

        Ok(Self {
            settings,
            chat,
            system: parse_message_template(&history.system)?,
            user: parse_message_template(&history.user)?,
            model: parse_message_template(&history.model)?,
            options,
        })
    }

    pub fn options(&self) -> &TemplateChatWrapperOptions {
        &self.options
    }
}

fn parse_chat_template(template: &str) -> Result<ParsedChatTemplate> {
    let parsed = parse_text_template(
        template,
        &[
            TemplatePart::optional("systemPrompt", "{{systemPrompt}}"),
            TemplatePart::required("history", "{{history}}"),
            TemplatePart::required("completion", "{{completion}}"),
        ],
    )?;

    let completion = parsed.required("completion")?;
    ensure!(
        !completion.suffix.is_empty(),
        "Chat template must have text after \"{{{{completion}}}}\""
    );

    Ok(ParsedChatTemplate {
        system_prompt_prefix: parsed.get("systemPrompt").map(|p| p.prefix.clone()),
        history_prefix: parsed.required("history")?.prefix.clone(),
        completion_prefix: completion.prefix.clone(),
        completion_suffix: completion.suffix.clone(),
    })
}

fn parse_message_template(template: &str) -> Result<Affixes> {
    let parsed = parse_text_template(template, &[TemplatePart::required("message", "{{message}}")])?;
    let message = parsed.required("message")?;
    Ok(Affixes {
        prefix: message.prefix.clone(),
        suffix: message.suffix.clone(),
    })
}

pub(crate) fn parse_function_call_message_template(
    template: &FunctionCallMessageTemplate,
) -> Result<(FunctionCallSettings, FunctionResultSettings)> {
    let call = parse_text_template(
        &template.call,
        &[
            TemplatePart::required("functionName", "{{functionName}}"),
            TemplatePart::required("functionParams", "{{functionParams}}"),
        ],
    )?;
    let result = parse_text_template(
        &template.result,
        &[TemplatePart::required("functionCallResult", "{{functionCallResult}}")],
    )?;

    let call_prefix = &call.required("functionName")?.prefix;
    let params = call.required("functionParams")?;
    let result_part = result.required("functionCallResult")?;

    ensure!(
        !call_prefix.is_empty(),
        "Function call template must have text before \"{{{{functionName}}}}\""
    );
    ensure!(
        !params.suffix.is_empty(),
        "Function call template must have text after \"{{{{functionParams}}}}\""
    );
    ensure!(
        !result_part.prefix.is_empty(),
        "Function call result template must have text before \"{{{{functionCallResult}}}}\""
    );
    ensure!(
        !result_part.suffix.is_empty(),
        "Function call result template must have text after \"{{{{functionCallResult}}}}\""
    );

    Ok((
        FunctionCallSettings {
            optional_prefix_space: true,
            prefix: LlamaText::from(call_prefix),
            params_prefix: LlamaText::from(&params.prefix),
            suffix: LlamaText::from(&params.suffix),
            empty_call_params_placeholder: None,
        },
        FunctionResultSettings {
            prefix: LlamaText::from(&result_part.prefix),
            suffix: LlamaText::from(&result_part.suffix),
        },
    ))
}

impl ChatWrapper for TemplateChatWrapper {
    fn wrapper_name(&self) -> &str {
        "Template"
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
        let policy = ChunkPolicy::joined_if(self.options.join_adjacent_messages_of_the_same_type);
        let chunks = chunk_chat_items(&history, policy, |response| {
            self.generate_model_response_text(response, true)
        });

        let chat = &self.chat;
        let last = chunks.len().saturating_sub(1);
        let mut parts = Vec::new();

        for (i, chunk) in chunks.iter().enumerate() {
            let is_last = i == last;

            if i == 0 {
                let system_prompt_prefix = chat.system_prompt_prefix.as_deref().unwrap_or_default();
                if chunk.system.is_empty() {
                    parts.push(LlamaText::from(special(format!("{system_prompt_prefix}{}", chat.history_prefix))));
                } else if chat.system_prompt_prefix.is_some() {
                    parts.push(llama_text![
                        special(system_prompt_prefix),
                        &chunk.system,
                        special(chat.history_prefix.as_str())
                    ]);
                } else {
                    parts.push(llama_text![
                        special(format!("{}{}", chat.history_prefix, self.system.prefix)),
                        &chunk.system,
                        special(self.system.suffix.as_str())
                    ]);
                }
            } else if !chunk.system.is_empty() {
                parts.push(self.system.wrap(&chunk.system));
            }

            if !chunk.user.is_empty() {
                parts.push(self.user.wrap(&chunk.user));
            }

            if is_last {
                parts.push(llama_text![special(chat.completion_prefix.as_str()), &chunk.model]);
            } else if !chunk.model.is_empty() {
                parts.push(self.model.wrap(&chunk.model));
            }
        }

        Ok(ContextState::new(
            LlamaText::from_parts(parts),
            vec![
                LlamaText::from(BuiltinToken::Eos),
                LlamaText::from(chat.completion_suffix.as_str()),
                LlamaText::from(special(chat.completion_suffix.as_str())),
            ],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{ChatHistoryItem, ChatModelFunctionCall};
    use serde_json::json;

    fn history_template() -> HistoryTemplate {
        HistoryTemplate {
            system: "system: {{message}}\n".to_string(),
            user: "user: {{message}}\n".to_string(),
            model: "model: {{message}}\n".to_string(),
        }
    }

    fn wrapper(template: &str) -> TemplateChatWrapper {
        TemplateChatWrapper::new(TemplateChatWrapperOptions::new(template, history_template())).unwrap()
    }

    fn history() -> Vec<ChatHistoryItem> {
        vec![
            ChatHistoryItem::system("Be brief."),
            ChatHistoryItem::user("Hi"),
            ChatHistoryItem::model(["Hello"]),
            ChatHistoryItem::user("Bye"),
        ]
    }

    #[test]
    fn system_prompt_fills_its_slot() {
        let wrapper = wrapper("SYS: {{systemPrompt}}\n{{history}}model: {{completion}}\nuser: ");
        let state = wrapper.generate_context_state(&ContextStateOptions::new(&history())).unwrap();
        assert_eq!(
            state.context_text,
            llama_text![
                special("SYS: "),
                "Be brief.",
                special("\nuser: "),
                "Hi",
                special("\nmodel: "),
                "Hello",
                special("\nuser: "),
                "Bye",
                special("\nmodel: ")
            ]
        );
        assert_eq!(
            state.stop_generation_triggers,
            vec![
                LlamaText::from(BuiltinToken::Eos),
                LlamaText::from("\nuser: "),
                LlamaText::from(special("\nuser: ")),
            ]
        );
    }

    #[test]
    fn adjacent_messages_join_only_when_enabled() {
        let history = vec![
            ChatHistoryItem::system("A"),
            ChatHistoryItem::system("B"),
            ChatHistoryItem::user("Hi"),
        ];
        let render = |join: bool| {
            let mut options = TemplateChatWrapperOptions::new("{{history}}model:{{completion}}\nuser:", history_template());
            options.join_adjacent_messages_of_the_same_type = join;
            TemplateChatWrapper::new(options)
                .unwrap()
                .generate_context_state(&ContextStateOptions::new(&history))
                .unwrap()
                .context_text
                .to_string()
        };

        assert_eq!(render(true), "system: A\n\nB\nuser: Hi\nmodel:");
        assert_eq!(render(false), "system: A\nsystem: B\nuser: Hi\nmodel:");
    }

    #[test]
    fn system_without_slot_uses_history_template() {
        let wrapper = wrapper("{{history}}model: {{completion}}\nuser: ");
        let text = wrapper
            .generate_context_state(&ContextStateOptions::new(&history()))
            .unwrap()
            .context_text
            .to_string();
        assert!(text.starts_with("system: Be brief.\nuser: Hi\n"), "got {text:?}");
    }

    #[test]
    fn last_chunk_opens_completion_even_when_empty() {
        let wrapper = wrapper("{{systemPrompt}}{{history}}model: {{completion}}\nuser: ");
        let history = vec![ChatHistoryItem::user("Hi")];
        let state = wrapper.generate_context_state(&ContextStateOptions::new(&history)).unwrap();
        assert_eq!(state.context_text, llama_text![special("user: "), "Hi", special("\nmodel: ")]);
    }

    #[test]
    fn completion_needs_trailing_text() {
        let err = TemplateChatWrapper::new(TemplateChatWrapperOptions::new(
            "{{history}}model: {{completion}}",
            history_template(),
        ))
        .err()
        .unwrap();
        assert_eq!(err.to_string(), "Chat template must have text after \"{{completion}}\"");
    }

    #[test]
    fn function_templates_are_validated() {
        let mut options = TemplateChatWrapperOptions::new("{{history}}model: {{completion}}\n", history_template());
        options.function_call_message_template = Some(FunctionCallMessageTemplate {
            call: "{{functionName}}({{functionParams}})".to_string(),
            result: "\n[result] {{functionCallResult}}\n".to_string(),
        });
        let err = TemplateChatWrapper::new(options.clone()).err().unwrap();
        assert_eq!(
            err.to_string(),
            "Function call template must have text before \"{{functionName}}\""
        );

        options.function_call_message_template = Some(FunctionCallMessageTemplate {
            call: "[[call: {{functionName}}({{functionParams}})]]".to_string(),
            result: "{{functionCallResult}}\n".to_string(),
        });
        let err = TemplateChatWrapper::new(options).err().unwrap();
        assert_eq!(
            err.to_string(),
            "Function call result template must have text before \"{{functionCallResult}}\""
        );
    }

    #[test]
    fn function_call_template_drives_call_rendering() {
        let mut options = TemplateChatWrapperOptions::new("{{history}}model: {{completion}}\n", history_template());
        options.function_call_message_template = Some(FunctionCallMessageTemplate {
            call: "[[call: {{functionName}}({{functionParams}})]]".to_string(),
            result: " [[result: {{functionCallResult}}]]".to_string(),
        });
        let wrapper = TemplateChatWrapper::new(options).unwrap();
        let call = ChatModelFunctionCall::new("getTime", Some(json!({"tz": "UTC"})), Some(json!("12:00")));
        let text = wrapper.generate_function_calls_and_results(&[call], false).to_string();
        assert_eq!(text, "[[call: getTime({\"tz\": \"UTC\"})]] [[result: \"12:00\"]]");
    }
}
