//! Jinja chat templates rendered as-is.
//!
//! The history is rendered through the model's own template with every
//! message replaced by a unique placeholder id. The output is then split on
//! those ids: template literal text becomes special-token text and each id
//! is swapped back for its message content. `bos_token`, `eos_token` and
//! `eot_token` are ids as well and map to the builtin tokens.
//!
//! Templates that reject system messages get them rewritten into user
//! messages, either always or only when rendering fails.

use std::hash::{Hash, Hasher};

use aho_corasick::{AhoCorasick, MatchKind};
use anyhow::{anyhow, bail, ensure, Context, Result};
use minijinja::{Environment, Error as JinjaError, ErrorKind};
use rustc_hash::{FxHashSet, FxHasher};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::aggregate::{role_runs, Role};
use super::template::{parse_function_call_message_template, FunctionCallMessageTemplate};
use super::{ChatWrapper, ChatWrapperSettings, ContextState, ContextStateOptions};
use crate::history::ChatHistoryItem;
use crate::text::{special, BuiltinToken, LlamaText};

const TEMPLATE_NAME: &str = "chat";
const TOOL_DETECTION_NAME: &str = "toolRenderingCheck";
pub const DEFAULT_SYSTEM_MESSAGE_CONVERSION_FORMAT: &str = "### System message\n\n{{message}}\n\n----";

/// When system messages are rewritten into user messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "use", content = "format", rename_all = "camelCase")]
pub enum SystemMessageConversion {
    Never,
    /// Only after rendering with system messages fails.
    IfNeeded(String),
    Always(String),
}

impl Default for SystemMessageConversion {
    fn default() -> Self {
        SystemMessageConversion::IfNeeded(DEFAULT_SYSTEM_MESSAGE_CONVERSION_FORMAT.to_string())
    }
}

impl SystemMessageConversion {
    fn format(&self) -> Option<&str> {
        match self {
            SystemMessageConversion::Never => None,
            SystemMessageConversion::IfNeeded(format) | SystemMessageConversion::Always(format) => Some(format),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JinjaTemplateChatWrapperOptions {
    pub template: String,
    pub model_role_name: String,
    pub user_role_name: String,
    pub system_role_name: String,
    pub convert_unsupported_system_messages_to_user_messages: SystemMessageConversion,
    pub function_call_message_template: Option<FunctionCallMessageTemplate>,
    /// Some templates fail when two messages of the same role follow each
    /// other.
    pub join_adjacent_messages_of_the_same_type: bool,
    pub trim_leading_whitespace_in_responses: bool,
    /// Extra variables passed to every render.
    pub additional_render_parameters: Map<String, Value>,
}

impl Default for JinjaTemplateChatWrapperOptions {
    fn default() -> Self {
        Self {
            template: String::new(),
            model_role_name: "assistant".to_string(),
            user_role_name: "user".to_string(),
            system_role_name: "system".to_string(),
            convert_unsupported_system_messages_to_user_messages: SystemMessageConversion::default(),
            function_call_message_template: None,
            join_adjacent_messages_of_the_same_type: true,
            trim_leading_whitespace_in_responses: true,
            additional_render_parameters: Map::new(),
        }
    }
}

impl JinjaTemplateChatWrapperOptions {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            ..Default::default()
        }
    }
}

/// What a placeholder id stands for.
enum Slot {
    Message { text: LlamaText, is_model: bool },
    Token(BuiltinToken),
}

struct Rendered {
    state: ContextState,
    converted_system_messages: bool,
}

pub struct JinjaTemplateChatWrapper {
    settings: ChatWrapperSettings,
    options: JinjaTemplateChatWrapperOptions,
    env: Environment<'static>,
    renders_tools: bool,
}

impl JinjaTemplateChatWrapper {
    pub fn new(options: JinjaTemplateChatWrapperOptions) -> Result<Self> {
        ensure!(!options.template.is_empty(), "template cannot be empty");
        if let Some(format) = options.convert_unsupported_system_messages_to_user_messages.format() {
            ensure!(
                format.contains("{{message}}"),
                "convertUnsupportedSystemMessagesToUserMessages format must include \"{{{{message}}}}\""
            );
        }

        let mut settings = ChatWrapperSettings::default();
        if let Some(template) = &options.function_call_message_template {
            let (call, result) = parse_function_call_message_template(template)?;
            settings.functions.call = call;
            settings.functions.result = result;
        }

        let env = build_environment(&options.template).context("Failed to compile the Jinja template")?;
        let mut wrapper = Self {
            settings,
            options,
            env,
            renders_tools: false,
        };

        let supports_system_messages = wrapper
            .run_sanity_test()
            .map_err(|err| anyhow!("The provided Jinja template failed that sanity test: {err:#}"))?;
        wrapper.settings.supports_system_messages = supports_system_messages;
        wrapper.renders_tools = wrapper.detect_tool_rendering();

        Ok(wrapper)
    }

    pub fn options(&self) -> &JinjaTemplateChatWrapperOptions {
        &self.options
    }

    pub fn template(&self) -> &str {
        &self.options.template
    }

    /// Whether the template writes out a `tools` list passed to it.
    pub fn renders_tools(&self) -> bool {
        self.renders_tools
    }

    fn detect_tool_rendering(&self) -> bool {
        let mut context = self.options.additional_render_parameters.clone();
        context.insert("messages".to_string(), json!([{ "role": self.options.user_role_name, "content": "Hi" }]));
        context.insert("add_generation_prompt".to_string(), Value::Bool(true));
        context.insert(
            "tools".to_string(),
            json!([{
                "type": "function",
                "function": {
                    "name": TOOL_DETECTION_NAME,
                    "description": "",
                    "parameters": {"type": "object", "properties": {}}
                }
            }]),
        );

        match self.render_template(&context) {
            Ok(output) => output.contains(TOOL_DETECTION_NAME),
            Err(err) => {
                debug!(error = %err, "jinja template failed to render with tools");
                false
            }
        }
    }

    /// Render fixed histories and report whether system messages survive
    /// without conversion.
    fn run_sanity_test(&self) -> Result<bool> {
        let mut supports_system_messages = true;
        for history in sanity_test_histories() {
            let rendered = self.render(&ContextStateOptions::new(&history))?;
            if rendered.converted_system_messages {
                supports_system_messages = false;
            }
        }
        debug!(supports_system_messages, "jinja template passed sanity test");
        Ok(supports_system_messages)
    }

    fn render(&self, options: &ContextStateOptions<'_>) -> Result<Rendered> {
        let history = self.add_available_functions_system_message_to_history(
            options.chat_history,
            options.functions(),
            options.document_function_params,
        );

        match &self.options.convert_unsupported_system_messages_to_user_messages {
            SystemMessageConversion::Never => self.render_history(&history, None),
            SystemMessageConversion::Always(format) => self.render_history(&history, Some(format)),
            SystemMessageConversion::IfNeeded(format) => match self.render_history(&history, None) {
                Ok(rendered) => Ok(rendered),
                Err(err) => {
                    debug!(error = %err, "retrying jinja render with system messages as user messages");
                    self.render_history(&history, Some(format))
                }
            },
        }
    }

    fn render_history(&self, history: &[ChatHistoryItem], system_format: Option<&str>) -> Result<Rendered> {
        let mut converted_system_messages = false;
        let converted: Vec<ChatHistoryItem>;
        let history = match system_format {
            None => history,
            Some(format) => {
                converted = history
                    .iter()
                    .map(|item| match item {
                        ChatHistoryItem::System { text } => {
                            converted_system_messages = true;
                            ChatHistoryItem::user(format.replace("{{message}}", &text.to_string()))
                        }
                        other => other.clone(),
                    })
                    .collect();
                &converted
            }
        };

        let runs = role_runs(history, self.options.join_adjacent_messages_of_the_same_type, |response| {
            self.generate_model_response_text(response, true)
        });
        let last_is_model = runs.last().is_some_and(|run| run.role == Role::Model);

        let mut anti_text = format!(
            "{}{}{}{}{}",
            self.options.template,
            self.options.model_role_name,
            self.options.user_role_name,
            self.options.system_role_name,
            system_format.unwrap_or_default()
        );
        let contents: Vec<LlamaText> = runs.iter().map(|run| run.text()).collect();
        anti_text.push_str(&LlamaText::join("\n\n", contents.iter()).to_string());
        let mut ids = IdGenerator::new(anti_text);

        let mut slots = Vec::with_capacity(runs.len() + 3);
        let mut messages = Vec::with_capacity(runs.len());
        for (run, text) in runs.iter().zip(contents) {
            let id = ids.next_id();
            let role = match run.role {
                Role::System => &self.options.system_role_name,
                Role::User => &self.options.user_role_name,
                Role::Model => &self.options.model_role_name,
            };
            messages.push(json!({ "role": role, "content": id }));
            slots.push((id, Slot::Message { text, is_model: run.role == Role::Model }));
        }
        let message_count = slots.len();
        let bos = ids.next_id();
        let eos = ids.next_id();
        let eot = ids.next_id();

        let mut context = self.options.additional_render_parameters.clone();
        context.insert("messages".to_string(), Value::Array(messages));
        context.insert("bos_token".to_string(), Value::String(bos.clone()));
        context.insert("eos_token".to_string(), Value::String(eos.clone()));
        context.insert("eot_token".to_string(), Value::String(eot.clone()));
        slots.push((bos, Slot::Token(BuiltinToken::Bos)));
        slots.push((eos, Slot::Token(BuiltinToken::Eos)));
        slots.push((eot, Slot::Token(BuiltinToken::Eot)));

        let output = match self.render_template(&context) {
            Ok(output) => output,
            Err(_) => {
                context.insert("add_generation_prompt".to_string(), Value::Bool(true));
                self.render_template(&context)?
            }
        };

        let pieces = split_on_ids(&output, slots.iter().map(|(id, _)| id.as_str()))?;

        let mut seen = vec![false; message_count];
        for piece in &pieces {
            if let Piece::Slot(index) = piece {
                if let Some(flag) = seen.get_mut(*index) {
                    *flag = true;
                }
            }
        }
        let all_messages_present = seen.iter().all(|s| *s);

        let split_at = if last_is_model {
            let last_message = pieces.iter().rposition(|piece| match piece {
                Piece::Slot(index) => *index < message_count,
                Piece::Literal(_) => false,
            });
            match last_message.map(|i| (i, &pieces[i])) {
                Some((i, Piece::Slot(index))) if matches!(slots[*index].1, Slot::Message { is_model: true, .. }) => i + 1,
                Some(_) => {
                    ensure!(all_messages_present, "Some input messages are not present in the generated Jinja template output");
                    bail!("Last message was expected to be a model message, but it was not");
                }
                None => {
                    ensure!(all_messages_present, "Some input messages are not present in the generated Jinja template output");
                    bail!("A model message was expected to be the last message, but it was not found");
                }
            }
        } else {
            pieces.len()
        };

        let (context_pieces, stop_pieces) = pieces.split_at(split_at);
        let in_context = (0..message_count).all(|index| {
            context_pieces
                .iter()
                .any(|piece| matches!(piece, Piece::Slot(i) if *i == index))
        });
        ensure!(in_context, "Some input messages are not present in the generated Jinja template output");

        let to_text = |pieces: &[Piece<'_>]| {
            LlamaText::from_parts(pieces.iter().map(|piece| match piece {
                Piece::Literal(text) => LlamaText::from(special(*text)),
                Piece::Slot(index) => match &slots[*index].1 {
                    Slot::Message { text, .. } => text.clone(),
                    Slot::Token(token) => LlamaText::from(*token),
                },
            }))
        };

        let mut stop_generation_triggers = vec![LlamaText::from(BuiltinToken::Eos)];
        if !stop_pieces.is_empty() {
            stop_generation_triggers.push(to_text(stop_pieces));
        }

        let mut state = ContextState::new(to_text(context_pieces), stop_generation_triggers);
        if self.options.trim_leading_whitespace_in_responses {
            state.ignore_start_text = [" ", "  ", "   ", "    ", "\t", "\t\t", "\t ", " \t"]
                .into_iter()
                .map(LlamaText::from)
                .collect();
        }

        Ok(Rendered {
            state,
            converted_system_messages,
        })
    }

    fn render_template(&self, context: &Map<String, Value>) -> Result<String> {
        let template = self.env.get_template(TEMPLATE_NAME)?;
        Ok(template.render(context)?)
    }
}

impl ChatWrapper for JinjaTemplateChatWrapper {
    fn wrapper_name(&self) -> &str {
        "JinjaTemplate"
    }

    fn settings(&self) -> &ChatWrapperSettings {
        &self.settings
    }

    fn generate_context_state(&self, options: &ContextStateOptions<'_>) -> Result<ContextState> {
        Ok(self.render(options)?.state)
    }
}

// =============================================================================
// Environment
// =============================================================================

fn raise_exception(message: String) -> Result<String, JinjaError> {
    Err(JinjaError::new(ErrorKind::InvalidOperation, message))
}

fn strftime_now(format: String) -> String {
    chrono::Local::now().format(&format).to_string()
}

fn build_environment(template: &str) -> Result<Environment<'static>> {
    let mut env = Environment::new();
    minijinja_contrib::add_to_environment(&mut env);
    env.set_unknown_method_callback(minijinja_contrib::pycompat::unknown_method_callback);
    env.add_filter("tojson", minijinja::filters::tojson);
    env.add_function("raise_exception", raise_exception);
    env.add_function("strftime_now", strftime_now);
    env.add_template_owned(TEMPLATE_NAME, template.to_string())?;
    Ok(env)
}

// =============================================================================
// Placeholder ids
// =============================================================================

/// Ids that occur neither in `anti_text` nor among earlier ids.
struct IdGenerator {
    anti_text: String,
    seed: u64,
    counter: u64,
    issued: FxHashSet<String>,
}

impl IdGenerator {
    fn new(anti_text: String) -> Self {
        let mut hasher = FxHasher::default();
        anti_text.hash(&mut hasher);
        Self {
            anti_text,
            seed: hasher.finish(),
            counter: 0,
            issued: FxHashSet::default(),
        }
    }

    fn next_id(&mut self) -> String {
        loop {
            self.counter += 1;
            let id = format!("W{:x}{:x}W", self.seed, self.counter);
            if !self.anti_text.contains(&id) && self.issued.insert(id.clone()) {
                return id;
            }
        }
    }
}

enum Piece<'a> {
    Literal(&'a str),
    Slot(usize),
}

fn split_on_ids<'a, 'i>(text: &'a str, ids: impl IntoIterator<Item = &'i str>) -> Result<Vec<Piece<'a>>> {
    let matcher = AhoCorasick::builder()
        .match_kind(MatchKind::LeftmostLongest)
        .build(ids)
        .context("Failed to build the placeholder matcher")?;

    let mut pieces = Vec::new();
    let mut last = 0;
    for found in matcher.find_iter(text) {
        if found.start() > last {
            pieces.push(Piece::Literal(&text[last..found.start()]));
        }
        pieces.push(Piece::Slot(found.pattern().as_usize()));
        last = found.end();
    }
    if last < text.len() {
        pieces.push(Piece::Literal(&text[last..]));
    }
    Ok(pieces)
}

const SANITY_USER_TEXT: &str = "Message 1234567890!@#$%^&*()_+-=[]{}|\\:;\"',./<>?`~";
const SANITY_MODEL_TEXT: &str = "Result 1234567890!@#$%^&*()_+-=[]{}|\\:;\"',./<>?`~";

fn sanity_test_histories() -> Vec<Vec<ChatHistoryItem>> {
    let opening = || {
        vec![
            ChatHistoryItem::system("System message ~!@#$%^&*()\n*"),
            ChatHistoryItem::user(SANITY_USER_TEXT),
        ]
    };
    let second_user = "Message2 1234567890!@#$%^&*()_+-=[]{}|\\:;\"',./<>?`~";
    let second_model = "Result2 1234567890!@#$%^&*()_+-=[]{}|\\:;\"',./<>?`~";

    let mut histories = Vec::new();

    let mut history = opening();
    history.push(ChatHistoryItem::model([""]));
    histories.push(history);

    let mut history = opening();
    history.push(ChatHistoryItem::model([SANITY_MODEL_TEXT]));
    histories.push(history.clone());

    history.push(ChatHistoryItem::user(second_user));
    let mut open = history.clone();
    open.push(ChatHistoryItem::model([""]));
    histories.push(open);

    history.push(ChatHistoryItem::model([second_model]));
    histories.push(history);

    histories
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ChatModelFunctions;
    use crate::llama_text;

    const CHATML: &str = "{% for message in messages %}{{ '<|im_start|>' + message['role'] + '\\n' + message['content'] + '<|im_end|>' + '\\n' }}{% endfor %}{% if add_generation_prompt %}{{ '<|im_start|>assistant\\n' }}{% endif %}";

    const NO_SYSTEM: &str = "{{ bos_token }}{% for message in messages %}{% if message['role'] == 'system' %}{{ raise_exception('System role not supported') }}{% endif %}{{ '<start_of_turn>' + message['role'] + '\\n' + message['content'] + '<end_of_turn>\\n' }}{% endfor %}";

    fn history() -> Vec<ChatHistoryItem> {
        vec![
            ChatHistoryItem::system("Be brief."),
            ChatHistoryItem::user("Hi"),
            ChatHistoryItem::model(["Hello"]),
        ]
    }

    #[test]
    fn detects_templates_that_render_tools() {
        let plain = JinjaTemplateChatWrapper::new(JinjaTemplateChatWrapperOptions::new(CHATML)).unwrap();
        assert!(!plain.renders_tools());

        let with_tools = format!(
            "{{% if tools %}}{{{{ '<|im_start|>system\\n<tools>' }}}}{{% for tool in tools %}}{{{{ tool | tojson }}}}{{% endfor %}}{{{{ '</tools><|im_end|>\\n' }}}}{{% endif %}}{CHATML}"
        );
        let tools = JinjaTemplateChatWrapper::new(JinjaTemplateChatWrapperOptions::new(with_tools)).unwrap();
        assert!(tools.renders_tools());
    }

    #[test]
    fn renders_chatml_and_derives_stop_trigger() {
        let wrapper = JinjaTemplateChatWrapper::new(JinjaTemplateChatWrapperOptions::new(CHATML)).unwrap();
        assert!(wrapper.settings().supports_system_messages);

        let state = wrapper.generate_context_state(&ContextStateOptions::new(&history())).unwrap();
        assert_eq!(
            state.context_text,
            llama_text![
                special("<|im_start|>system\n"),
                "Be brief.",
                special("<|im_end|>\n<|im_start|>user\n"),
                "Hi",
                special("<|im_end|>\n<|im_start|>assistant\n"),
                "Hello"
            ]
        );
        assert_eq!(
            state.stop_generation_triggers,
            vec![LlamaText::from(BuiltinToken::Eos), LlamaText::from(special("<|im_end|>\n"))]
        );
        assert_eq!(state.ignore_start_text.len(), 8);
    }

    #[test]
    fn rejected_system_messages_become_user_messages() {
        let wrapper = JinjaTemplateChatWrapper::new(JinjaTemplateChatWrapperOptions::new(NO_SYSTEM)).unwrap();
        assert!(!wrapper.settings().supports_system_messages);

        let state = wrapper.generate_context_state(&ContextStateOptions::new(&history())).unwrap();
        let text = state.context_text.to_string();
        assert!(state.context_text.starts_with_builtin(BuiltinToken::Bos));
        assert!(
            text.contains("<start_of_turn>user\n### System message\n\nBe brief.\n\n----\n\nHi<end_of_turn>"),
            "got {text:?}"
        );
    }

    #[test]
    fn never_converting_fails_sanity_test() {
        let mut options = JinjaTemplateChatWrapperOptions::new(NO_SYSTEM);
        options.convert_unsupported_system_messages_to_user_messages = SystemMessageConversion::Never;
        let err = JinjaTemplateChatWrapper::new(options).err().unwrap();
        assert!(err.to_string().starts_with("The provided Jinja template failed that sanity test"));
    }

    #[test]
    fn conversion_format_must_hold_message() {
        let mut options = JinjaTemplateChatWrapperOptions::new(CHATML);
        options.convert_unsupported_system_messages_to_user_messages = SystemMessageConversion::Always("System:".to_string());
        assert!(JinjaTemplateChatWrapper::new(options).is_err());
    }

    #[test]
    fn template_that_drops_messages_is_rejected() {
        let template = "{% for message in messages %}{% if message['role'] == 'user' %}{{ message['content'] }}{% endif %}{% endfor %}";
        let mut options = JinjaTemplateChatWrapperOptions::new(template);
        options.convert_unsupported_system_messages_to_user_messages = SystemMessageConversion::Never;
        assert!(JinjaTemplateChatWrapper::new(options).is_err());
    }

    #[test]
    fn functions_are_documented_in_system_message() {
        let wrapper = JinjaTemplateChatWrapper::new(JinjaTemplateChatWrapperOptions::new(CHATML)).unwrap();
        let functions = ChatModelFunctions::new().with("getTime", Default::default());
        let items = vec![ChatHistoryItem::user("Hi")];
        let state = wrapper
            .generate_context_state(&ContextStateOptions::new(&items).with_functions(&functions))
            .unwrap();
        let text = state.context_text.to_string();
        assert!(text.starts_with("<|im_start|>system\n"), "got {text:?}");
        assert!(text.contains("getTime"));
        assert_eq!(state.stop_generation_triggers.len(), 1);
    }

    #[test]
    fn additional_parameters_reach_template() {
        let template = "{{ date_string }}|{% for message in messages %}{{ message['content'] }}{% endfor %}";
        let mut options = JinjaTemplateChatWrapperOptions::new(template);
        options
            .additional_render_parameters
            .insert("date_string".to_string(), json!("26 Jul 2024"));
        let wrapper = JinjaTemplateChatWrapper::new(options).unwrap();
        let items = vec![ChatHistoryItem::user("Hi")];
        let state = wrapper.generate_context_state(&ContextStateOptions::new(&items)).unwrap();
        assert_eq!(state.context_text, llama_text![special("26 Jul 2024|"), "Hi"]);
    }

    #[test]
    fn ids_are_unique_and_absent_from_text() {
        let mut ids = IdGenerator::new("some message text".to_string());
        let first = ids.next_id();
        let second = ids.next_id();
        assert_ne!(first, second);
        assert!(first.starts_with('W') && first.ends_with('W'));
        assert!(!"some message text".contains(&first));
    }
}
