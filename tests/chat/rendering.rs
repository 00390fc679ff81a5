//! Rendering properties shared by every wrapper.

use llama_chat::history::ChatHistoryItem;
use llama_chat::resolve::{resolve_chat_wrapper, ResolveOptions, WrapperType};
use llama_chat::text::BuiltinToken;
use llama_chat::tokenizer::{Tokenizer, VocabTokenizer};
use llama_chat::wrapper::{
    ChatMlChatWrapper, ChatWrapper, ContextStateOptions, TemplateChatWrapper, TemplateChatWrapperOptions,
};

fn history() -> Vec<ChatHistoryItem> {
    vec![
        ChatHistoryItem::system("You are terse."),
        ChatHistoryItem::user("Hi"),
        ChatHistoryItem::model(["Hello."]),
        ChatHistoryItem::user("Bye"),
        ChatHistoryItem::model([""]),
    ]
}

#[test]
fn rendering_is_deterministic_and_ends_open() {
    let history = history();
    for wrapper_type in WrapperType::SPECIALIZED {
        let options = ResolveOptions { wrapper_type, ..Default::default() };
        let wrapper = resolve_chat_wrapper(&options).unwrap().unwrap();

        let first = wrapper.generate_context_state(&ContextStateOptions::new(&history)).unwrap();
        let second = wrapper.generate_context_state(&ContextStateOptions::new(&history)).unwrap();
        assert_eq!(first, second, "{wrapper_type}");

        let text = first.context_text.to_string();
        assert!(text.contains("Bye"), "{wrapper_type}: {text:?}");
        assert!(!text.trim_end().ends_with("Bye"), "{wrapper_type} must open a model turn: {text:?}");
        assert!(!first.stop_generation_triggers.is_empty(), "{wrapper_type}");
    }
}

#[test]
fn chatml_special_tokens_tokenize_atomically() {
    let tokenizer = VocabTokenizer::from_vocab(&[
        "<s>", "</s>", "<|im_start|>", "<|im_end|>", "system", "user", "assistant", "\n", "H", "i", "B", "y", "e",
        "Y", "o", "u", " ", "a", "r", "t", "s", ".", "l",
    ])
    .with_builtin(BuiltinToken::Bos, "<s>")
    .with_builtin(BuiltinToken::Eos, "</s>");

    let history = vec![ChatHistoryItem::user("Hi"), ChatHistoryItem::model([""])];
    let state = ChatMlChatWrapper::new()
        .generate_context_state(&ContextStateOptions::new(&history))
        .unwrap();
    let tokens = state.context_text.tokenize(&tokenizer, false).unwrap();

    let im_start = tokenizer.added_token_id("<|im_start|>").unwrap();
    let im_end = tokenizer.added_token_id("<|im_end|>").unwrap();
    assert_eq!(tokens[0], tokenizer.builtin_token(BuiltinToken::Bos).unwrap());
    assert_eq!(tokens.iter().filter(|t| **t == im_start).count(), 2);
    assert_eq!(tokens.iter().filter(|t| **t == im_end).count(), 1);
    assert!(tokens.iter().all(|t| *t != tokenizer.builtin_token(BuiltinToken::Eos).unwrap()));
}

#[test]
fn text_template_wrapper_renders_from_config() {
    let options: TemplateChatWrapperOptions = serde_json::from_value(serde_json::json!({
        "template": "{{systemPrompt}}\n{{history}}model: {{completion}}\nuser: ",
        "historyTemplate": {
            "system": "system: {{message}}\n",
            "user": "user: {{message}}\n",
            "model": "model: {{message}}\n"
        }
    }))
    .unwrap();
    let wrapper = TemplateChatWrapper::new(options).unwrap();

    let history = vec![ChatHistoryItem::user("Hi"), ChatHistoryItem::model(["Hello"])];
    let state = wrapper.generate_context_state(&ContextStateOptions::new(&history)).unwrap();
    let text = state.context_text.to_string();
    assert!(!text.starts_with("BOS"), "{text:?}");
    assert!(text.ends_with("user: Hi\nmodel: Hello"), "{text:?}");
}

#[test]
fn text_template_wrapper_renders_compact_template() {
    let options: TemplateChatWrapperOptions = serde_json::from_value(serde_json::json!({
        "template": "{{systemPrompt}}\n{{history}}model:{{completion}}\nuser:",
        "historyTemplate": {
            "system": "system: {{message}}\n",
            "user": "user: {{message}}\n",
            "model": "model: {{message}}\n"
        }
    }))
    .unwrap();
    let wrapper = TemplateChatWrapper::new(options).unwrap();

    let history = vec![
        ChatHistoryItem::system("S"),
        ChatHistoryItem::user("Hi"),
        ChatHistoryItem::model(["Hello"]),
    ];
    let state = wrapper.generate_context_state(&ContextStateOptions::new(&history)).unwrap();
    assert_eq!(state.context_text.to_string(), "S\nuser: Hi\nmodel:Hello");
    assert!(state
        .stop_generation_triggers
        .iter()
        .any(|trigger| trigger.to_string() == "\nuser:"));
}
