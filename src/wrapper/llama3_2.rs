//! Llama 3.2 lightweight (1B/3B) format.
//!
//! Same turn layout as Llama 3, plus a date preamble system message and
//! JSON-style function calls answered by an `ipython` turn:
//!
//! ```text
//! <|start_header_id|>system<|end_header_id|>
//!
//! Cutting Knowledge Date: December 2023
//! Today Date: 26 Jul 2024<|eot_id|>
//! ```
//!
//! Both dates are resolved once, when the wrapper is built, so rendering the
//! same history twice always yields the same text.

use std::borrow::Cow;

use anyhow::Result;
use chrono::{Datelike, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::aggregate::{role_runs, Role};
use super::docs::FunctionsDocumentationGenerator;
use super::llama3::{header, llama3_stop_triggers};
use super::render::insert_system_message_at;
use super::{
    ChatWrapper, ChatWrapperSettings, ContextState, ContextStateOptions, FunctionCallSettings, FunctionResultSettings,
    FunctionsSettings, ModelCompatibility, Probe,
};
use crate::history::{ChatHistoryItem, ChatModelFunctions};
use crate::llama_text;
use crate::text::{special, BuiltinToken, LlamaText};

/// A date line of the preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PreambleDate {
    /// Omit the line.
    Disabled,
    /// The local date at construction time.
    Today,
    Fixed(NaiveDate),
}

fn default_knowledge_cutoff() -> PreambleDate {
    NaiveDate::from_ymd_opt(2023, 12, 1).map_or(PreambleDate::Disabled, PreambleDate::Fixed)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Llama3_2LightweightChatWrapperOptions {
    pub cutting_knowledge_date: PreambleDate,
    pub today_date: PreambleDate,
    /// Emit the preamble and its separator as special-token text, the way
    /// some embedded templates do.
    pub special_tokens_text_for_preamble: bool,
}

impl Default for Llama3_2LightweightChatWrapperOptions {
    fn default() -> Self {
        Self {
            cutting_knowledge_date: default_knowledge_cutoff(),
            today_date: PreambleDate::Today,
            special_tokens_text_for_preamble: false,
        }
    }
}

/// `26 Jul 2024`
pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format("%-d %b %Y").to_string()
}

pub struct Llama3_2LightweightChatWrapper {
    settings: ChatWrapperSettings,
    options: Llama3_2LightweightChatWrapperOptions,
    preamble: Option<LlamaText>,
}

impl Llama3_2LightweightChatWrapper {
    pub fn new(options: Llama3_2LightweightChatWrapperOptions) -> Self {
        let now = Local::now().date_naive();
        let resolve = |date: PreambleDate| match date {
            PreambleDate::Disabled => None,
            PreambleDate::Today => Some(now),
            PreambleDate::Fixed(date) => Some(date),
        };
        let today = resolve(options.today_date);
        let cutoff = resolve(options.cutting_knowledge_date);

        let mut lines = Vec::new();
        if let Some(cutoff) = cutoff {
            let reference = today.unwrap_or(now);
            let formatted = if reference.year() == cutoff.year() && reference.month() == cutoff.month() {
                format_date(cutoff)
            } else {
                cutoff.format("%B %Y").to_string()
            };
            lines.push(format!("Cutting Knowledge Date: {formatted}"));
        }
        if let Some(today) = today {
            lines.push(format!("Today Date: {}", format_date(today)));
        }

        let preamble = (!lines.is_empty()).then(|| {
            if options.special_tokens_text_for_preamble {
                LlamaText::from(special(lines.join("\n")))
            } else {
                LlamaText::join("\n", lines)
            }
        });

        let settings = ChatWrapperSettings {
            supports_system_messages: true,
            functions: FunctionsSettings {
                call: FunctionCallSettings {
                    optional_prefix_space: true,
                    prefix: LlamaText::from("{\"name\": \""),
                    params_prefix: LlamaText::from("\", \"parameters\": "),
                    suffix: llama_text!["}", BuiltinToken::Eot],
                    empty_call_params_placeholder: None,
                },
                result: FunctionResultSettings {
                    prefix: llama_text![BuiltinToken::Eot, header("ipython")],
                    suffix: llama_text![BuiltinToken::Eot, header("assistant")],
                },
                parallelism: None,
            },
            segments: None,
        };

        Self { settings, options, preamble }
    }

    pub fn options(&self) -> &Llama3_2LightweightChatWrapperOptions {
        &self.options
    }

    /// The history with the date preamble as its first system message.
    pub fn prepend_preamble_to_chat_history<'h>(&self, history: &'h [ChatHistoryItem]) -> Cow<'h, [ChatHistoryItem]> {
        match &self.preamble {
            Some(preamble) => insert_system_message_at(history, 0, preamble.clone()),
            None => Cow::Borrowed(history),
        }
    }

    /// The model must name itself Llama 3.2 with a 1B or 3B size label and,
    /// when a tokenizer is given, know `<|eom_id|>` as one special token.
    pub fn check_model_compatibility(compat: &ModelCompatibility<'_>) -> bool {
        if let Some(tokenizer) = compat.tokenizer {
            let tokens = tokenizer.tokenize("<|eom_id|>", crate::tokenizer::TokenizeMode::Special, true);
            if tokens.len() != 1 || !tokenizer.is_special_token(tokens[0]) {
                return false;
            }
        }
        compat.file_info.is_some_and(|info| {
            info.lineage_includes(&["llama 3.2", "llama-3.2", "llama3.2"])
                && matches!(info.size_label.as_deref(), Some("1B") | Some("3B"))
        })
    }

    pub fn probes() -> Vec<Probe<Llama3_2LightweightChatWrapperOptions>> {
        use Llama3_2LightweightChatWrapperOptions as O;

        fn fixed_today(o: &mut O) {
            if let Some(date) = NaiveDate::from_ymd_opt(2024, 7, 26) {
                o.today_date = PreambleDate::Fixed(date);
            }
        }
        fn default_cutoff(o: &mut O) {
            o.cutting_knowledge_date = default_knowledge_cutoff();
        }
        let date_string = NaiveDate::from_ymd_opt(2024, 7, 26)
            .map(format_date)
            .unwrap_or_default();

        vec![
            Probe::same(super::keep),
            Probe::pair(|o: &mut O| o.today_date = PreambleDate::Disabled, super::keep),
            Probe::pair(|o: &mut O| o.cutting_knowledge_date = PreambleDate::Disabled, super::keep),
            Probe::pair(
                |o: &mut O| {
                    o.today_date = PreambleDate::Disabled;
                    o.cutting_knowledge_date = PreambleDate::Disabled;
                },
                super::keep,
            ),
            Probe::pair(
                |o: &mut O| {
                    fixed_today(o);
                    o.cutting_knowledge_date = PreambleDate::Disabled;
                },
                super::keep,
            ),
            Probe::pair(
                |o: &mut O| {
                    fixed_today(o);
                    default_cutoff(o);
                },
                default_cutoff,
            )
            .with_jinja_parameter("date_string", Value::String(date_string.clone())),
            Probe::pair(
                |o: &mut O| {
                    fixed_today(o);
                    default_cutoff(o);
                    o.special_tokens_text_for_preamble = true;
                },
                default_cutoff,
            )
            .with_jinja_parameter("date_string", Value::String(date_string)),
        ]
    }
}

impl Default for Llama3_2LightweightChatWrapper {
    fn default() -> Self {
        Self::new(Llama3_2LightweightChatWrapperOptions::default())
    }
}

impl ChatWrapper for Llama3_2LightweightChatWrapper {
    fn wrapper_name(&self) -> &str {
        "Llama 3.2 lightweight"
    }

    fn settings(&self) -> &ChatWrapperSettings {
        &self.settings
    }

    fn generate_context_state(&self, options: &ContextStateOptions<'_>) -> Result<ContextState> {
        let with_preamble = self.prepend_preamble_to_chat_history(options.chat_history);
        let history = self.add_available_functions_system_message_to_history(
            &with_preamble,
            options.functions(),
            options.document_function_params,
        );
        let runs = role_runs(&history, true, |response| self.generate_model_response_text(response, true));

        let last = runs.len().saturating_sub(1);
        let mut parts = vec![LlamaText::from(BuiltinToken::Bos)];
        for (i, run) in runs.iter().enumerate() {
            let (role, text) = match run.role {
                Role::System if i == 0 && self.options.special_tokens_text_for_preamble => {
                    ("system", run.join(special("\n\n")))
                }
                Role::System => ("system", run.text()),
                Role::User => ("user", run.text()),
                Role::Model => ("assistant", run.text()),
            };
            parts.push(header(role));
            parts.push(text);
            if run.role != Role::Model || i != last {
                parts.push(LlamaText::from(BuiltinToken::Eot));
            }
        }

        Ok(ContextState::new(LlamaText::from_parts(parts), llama3_stop_triggers()))
    }

    fn generate_available_functions_system_text(&self, functions: &ChatModelFunctions, document_params: bool) -> LlamaText {
        let docs = FunctionsDocumentationGenerator::new(functions);
        if !docs.has_any_functions() {
            return LlamaText::new();
        }

        LlamaText::join(
            "\n",
            [
                "You have access to the following functions. To call a function, please respond with JSON for a function call.".to_string(),
                "Respond in the format {\"name\": function name, \"parameters\": function call parameters}.".to_string(),
                "Do not use variables.".to_string(),
                String::new(),
                docs.llama3_2_lightweight_function_signatures(document_params),
                String::new(),
                "After calling a function, the result will appear afterwards and is only visible to you.".to_string(),
                "To make information visible to the user, you must include it in your response.".to_string(),
                "Do not tell the user about the functions your are using.".to_string(),
                "Only call functions when needed.".to_string(),
            ],
        )
    }

    /// The functions message goes right after the preamble when the history
    /// opens with two system messages, otherwise first.
    fn add_available_functions_system_message_to_history<'h>(
        &self,
        history: &'h [ChatHistoryItem],
        functions: Option<&ChatModelFunctions>,
        document_params: bool,
    ) -> Cow<'h, [ChatHistoryItem]> {
        let Some(functions) = functions.filter(|f| !f.is_empty()) else {
            return Cow::Borrowed(history);
        };
        let text = self.generate_available_functions_system_text(functions, document_params);
        let index = match history {
            [first, second, ..] if first.is_system() && second.is_system() => 1,
            _ => 0,
        };
        insert_system_message_at(history, index, text)
    }
}
