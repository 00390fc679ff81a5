//! Deciding whether a specialized wrapper can stand in for a Jinja template.
//!
//! Two wrappers are equivalent when, for every sample history:
//! - their context texts match after trimming trailing whitespace and
//!   dropping a leading BOS (structurally, or token for token when a
//!   tokenizer is given), and
//! - every Jinja stop trigger, possibly trimmed, contains one of the
//!   specialized wrapper's triggers.
//!
//! Templates that reject system messages get a second pass in which system
//! messages are folded into user messages as `System: {{message}}`.
//!
//! Without a tokenizer the comparison is structural, so fragment kinds must
//! agree. Jinja output marks all template text as special-token text and
//! writes `<|eot_id|>` literally. Alpaca, General and Llama 3 templates
//! therefore only match their wrappers when a tokenizer is given; otherwise
//! they resolve to the Jinja wrapper.

use tracing::debug;

use crate::history::ChatHistoryItem;
use crate::text::{BuiltinToken, Fragment, LlamaText};
use crate::tokenizer::Tokenizer;
use crate::wrapper::jinja::SystemMessageConversion;
use crate::wrapper::{ChatWrapper, ContextStateOptions, JinjaTemplateChatWrapper, JinjaTemplateChatWrapperOptions};

const SYSTEM_AS_USER_FORMAT: &str = "System: {{message}}";

const SYSTEM_TEXT: &str = "System message ~!@#$%^&*()\n*";
const USER_TEXT: &str = "Message 1234567890!@#$%^&*()_+-=[]{}|\\:;\"',./<>?`~";
const MODEL_TEXT: &str = "Result 1234567890!@#$%^&*()_+-=[]{}|\\:;\"',./<>?`~";
const USER_TEXT_2: &str = "Message2 1234567890!@#$%^&*()_+-=[]{}|\\:;\"',./<>?`~";
const MODEL_TEXT_2: &str = "Result2 1234567890!@#$%^&*()_+-=[]{}|\\:;\"',./<>?`~";

/// The histories both wrappers are rendered with.
pub fn sample_histories() -> Vec<Vec<ChatHistoryItem>> {
    let head = || vec![ChatHistoryItem::system(SYSTEM_TEXT), ChatHistoryItem::user(USER_TEXT)];
    let with = |tail: Vec<ChatHistoryItem>| head().into_iter().chain(tail).collect::<Vec<_>>();

    vec![
        with(vec![ChatHistoryItem::model([""])]),
        with(vec![ChatHistoryItem::model([MODEL_TEXT])]),
        with(vec![
            ChatHistoryItem::model([MODEL_TEXT]),
            ChatHistoryItem::user(USER_TEXT_2),
            ChatHistoryItem::model([""]),
        ]),
        with(vec![
            ChatHistoryItem::model([MODEL_TEXT]),
            ChatHistoryItem::user(USER_TEXT_2),
            ChatHistoryItem::model([MODEL_TEXT_2]),
        ]),
    ]
}

pub fn is_jinja_template_equivalent(
    jinja_options: &JinjaTemplateChatWrapperOptions,
    specialized: &dyn ChatWrapper,
    tokenizer: Option<&dyn Tokenizer>,
) -> bool {
    let can_convert_system_messages = matches!(
        jinja_options.convert_unsupported_system_messages_to_user_messages,
        SystemMessageConversion::IfNeeded(_)
    );

    let mut options = jinja_options.clone();
    if can_convert_system_messages {
        options.convert_unsupported_system_messages_to_user_messages = SystemMessageConversion::Never;
    }
    match JinjaTemplateChatWrapper::new(options) {
        Ok(jinja) => {
            if check_equivalence(&jinja, specialized, &sample_histories(), tokenizer) {
                return true;
            }
        }
        Err(err) => debug!("Jinja template without system message conversion failed: {err:#}"),
    }

    if !can_convert_system_messages {
        return false;
    }

    let mut options = jinja_options.clone();
    options.convert_unsupported_system_messages_to_user_messages =
        SystemMessageConversion::Always(SYSTEM_AS_USER_FORMAT.to_string());
    match JinjaTemplateChatWrapper::new(options) {
        Ok(jinja) => {
            let histories: Vec<_> = sample_histories().iter().map(|h| fold_system_messages(h)).collect();
            check_equivalence(&jinja, specialized, &histories, tokenizer)
        }
        Err(err) => {
            debug!("Jinja template with system message conversion failed: {err:#}");
            false
        }
    }
}

/// Rewrites system messages as user messages, merging a leading system
/// message into the user message right after it.
fn fold_system_messages(history: &[ChatHistoryItem]) -> Vec<ChatHistoryItem> {
    let as_user = |text: &LlamaText| SYSTEM_AS_USER_FORMAT.replace("{{message}}", &text.to_string());

    let mut folded = Vec::with_capacity(history.len());
    let mut items = history.iter().enumerate().peekable();
    while let Some((index, item)) = items.next() {
        match item {
            ChatHistoryItem::System { text } => {
                if let (0, Some((_, ChatHistoryItem::User { text: user }))) = (index, items.peek()) {
                    folded.push(ChatHistoryItem::user(format!("{}\n\n{user}", as_user(text))));
                    items.next();
                } else {
                    folded.push(ChatHistoryItem::user(as_user(text)));
                }
            }
            other => folded.push(other.clone()),
        }
    }
    folded
}

fn check_equivalence(
    jinja: &JinjaTemplateChatWrapper,
    specialized: &dyn ChatWrapper,
    histories: &[Vec<ChatHistoryItem>],
    tokenizer: Option<&dyn Tokenizer>,
) -> bool {
    for history in histories {
        let options = ContextStateOptions::new(history);
        let (Ok(jinja_state), Ok(specialized_state)) =
            (jinja.generate_context_state(&options), specialized.generate_context_state(&options))
        else {
            return false;
        };

        if !compare_context_texts(&jinja_state.context_text, &specialized_state.context_text, tokenizer) {
            return false;
        }

        let triggers_covered = jinja_state.stop_generation_triggers.iter().all(|trigger| {
            let variants = [
                trigger.clone(),
                trigger.trim_end(),
                trigger.trim_start(),
                trigger.trim_start().trim_end(),
            ];
            variants
                .iter()
                .any(|variant| trigger_covered(variant, &specialized_state.stop_generation_triggers, tokenizer))
        });
        if !triggers_covered {
            return false;
        }
    }
    true
}

fn trigger_covered(jinja_trigger: &LlamaText, specialized: &[LlamaText], tokenizer: Option<&dyn Tokenizer>) -> bool {
    if jinja_trigger.is_empty() || specialized.iter().any(|trigger| jinja_trigger.includes(trigger)) {
        return true;
    }

    let Some(tokenizer) = tokenizer else {
        return false;
    };
    let Ok(jinja_tokens) = jinja_trigger.tokenize(tokenizer, false) else {
        return false;
    };
    specialized.iter().any(|trigger| {
        trigger
            .tokenize(tokenizer, false)
            .is_ok_and(|tokens| jinja_tokens.starts_with(&tokens))
    })
}

fn compare_context_texts(a: &LlamaText, b: &LlamaText, tokenizer: Option<&dyn Tokenizer>) -> bool {
    let variants = |text: &LlamaText| {
        let trimmed = text.trim_end();
        let normalized = remove_leading_bos(&trimmed);
        if tokenizer.is_some() && normalized.len() != trimmed.len() {
            vec![trimmed, normalized]
        } else {
            vec![normalized]
        }
    };

    let (a_variants, b_variants) = (variants(a), variants(b));
    a_variants
        .iter()
        .any(|a| b_variants.iter().any(|b| texts_equal(a, b, tokenizer)))
}

fn texts_equal(a: &LlamaText, b: &LlamaText, tokenizer: Option<&dyn Tokenizer>) -> bool {
    if LlamaText::compare(a, b) {
        return true;
    }
    let Some(tokenizer) = tokenizer else {
        return false;
    };
    match (a.tokenize(tokenizer, false), b.tokenize(tokenizer, false)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn remove_leading_bos(text: &LlamaText) -> LlamaText {
    match text.values() {
        [Fragment::SpecialToken(BuiltinToken::Bos), rest @ ..] => LlamaText::from_parts(rest.iter().map(LlamaText::from)),
        _ => text.clone(),
    }
}
