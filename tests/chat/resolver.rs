//! Resolution from model metadata and resolver config files.

use std::io::Write;

use llama_chat::config::ResolverConfig;
use llama_chat::resolve::{resolve_chat_wrapper, ModelFileInfo, ResolveOptions};
use llama_chat::text::BuiltinToken;
use llama_chat::tokenizer::VocabTokenizer;
use llama_chat::wrapper::{BuiltinChatWrapper, JinjaTemplateChatWrapperOptions};
use serde_json::json;

const CHATML: &str = "{% for message in messages %}{{ '<|im_start|>' + message['role'] + '\n' + message['content'] + '<|im_end|>' + '\n' }}{% endfor %}{% if add_generation_prompt %}{{ '<|im_start|>assistant\n' }}{% endif %}";

const QWQ: &str = r##"{%- if tools %}
    {{- '<|im_start|>system\n' }}
    {%- if messages[0]['role'] == 'system' %}
        {{- messages[0]['content'] }}
    {%- else %}
        {{- '' }}
    {%- endif %}
    {{- "\n\n# Tools\n\nYou may call one or more functions to assist with the user query.\n\nYou are provided with function signatures within <tools></tools> XML tags:\n<tools>" }}
    {%- for tool in tools %}
        {{- "\n" }}
        {{- tool | tojson }}
    {%- endfor %}
    {{- "\n</tools>\n\nFor each function call, return a json object with function name and arguments within <tool_call></tool_call> XML tags:\n<tool_call>\n{\"name\": <function-name>, \"arguments\": <args-json-object>}\n</tool_call><|im_end|>\n" }}
{%- else %}
    {%- if messages[0]['role'] == 'system' %}
        {{- '<|im_start|>system\n' + messages[0]['content'] + '<|im_end|>\n' }}
  {%- endif %}
{%- endif %}
{%- for message in messages %}
    {%- if (message.role == "user") or (message.role == "system" and not loop.first) %}
        {{- '<|im_start|>' + message.role + '\n' + message.content + '<|im_end|>' + '\n' }}
    {%- elif message.role == "assistant" and not message.tool_calls %}
        {%- set content = message.content.split('</think>')[-1].lstrip('\n') %}
        {{- '<|im_start|>' + message.role + '\n' + content + '<|im_end|>' + '\n' }}
    {%- elif message.role == "assistant" %}
        {%- set content = message.content.split('</think>')[-1].lstrip('\n') %}
        {{- '<|im_start|>' + message.role }}
        {%- if message.content %}
            {{- '\n' + content }}
        {%- endif %}
        {%- for tool_call in message.tool_calls %}
            {%- if tool_call.function is defined %}
                {%- set tool_call = tool_call.function %}
            {%- endif %}
            {{- '\n<tool_call>\n{"name": "' }}
            {{- tool_call.name }}
            {{- '", "arguments": ' }}
            {{- tool_call.arguments | tojson }}
            {{- '}\n</tool_call>' }}
        {%- endfor %}
        {{- '<|im_end|>\n' }}
    {%- elif message.role == "tool" %}
        {%- if (loop.index0 == 0) or (messages[loop.index0 - 1].role != "tool") %}
            {{- '<|im_start|>user' }}
        {%- endif %}
        {{- '\n<tool_response>\n' }}
        {{- message.content }}
        {{- '\n</tool_response>' }}
        {%- if loop.last or (messages[loop.index0 + 1].role != "tool") %}
            {{- '<|im_end|>\n' }}
        {%- endif %}
    {%- endif %}
{%- endfor %}
{%- if add_generation_prompt %}
    {{- '<|im_start|>assistant\n' }}
{%- endif %}"##;

const ALPACA: &str = r##"{%- for message in messages %}
    {%- if message['role'] == 'system' -%}
        {{- message['content'] + '\n\n' -}}
    {%- elif message['role'] == 'user' -%}
        {{- '### Instruction:\n' + message['content'] + '\n\n'-}}
    {%- else -%}
        {{- '### Response:\n' + message['content'] + '\n\n' -}}
    {%- endif -%}
{%- endfor -%}
{%- if add_generation_prompt -%}
    {{- '### Response:\n'-}}
{%- endif -%}"##;

const GENERAL: &str = r##"{%- for message in messages %}
    {%- if message['role'] == 'system' -%}
        {{- message['content'] + '\n\n' -}}
    {%- elif message['role'] == 'user' -%}
        {{- '### Human\n' + message['content'] + '\n\n'-}}
    {%- else -%}
        {{- '### Assistant\n' + message['content'] + '\n\n' -}}
    {%- endif -%}
{%- endfor -%}
{%- if add_generation_prompt -%}
    {{- '### Assistant\n'-}}
{%- endif -%}"##;

const LLAMA3: &str = r##"{%- set loop_messages = messages -%}
{%- for message in loop_messages -%}
    {%- set content = '<|start_header_id|>' + message['role'] + '<|end_header_id|>

'+ message['content'] | trim + '<|eot_id|>' -%}
    {%- if loop.index0 == 0 -%}
        {%- set content = bos_token + content -%}
    {%- endif -%}
    {{- content -}}
{%- endfor -%}
{{- '<|start_header_id|>assistant<|end_header_id|>

' -}}"##;

fn type_name(options: &ResolveOptions<'_>) -> Option<&'static str> {
    resolve_chat_wrapper(options).unwrap().map(|wrapper| wrapper.type_name())
}

/// Every printable ASCII char as its own piece, so token comparison is as
/// strict as text comparison while ignoring fragment boundaries.
fn char_tokenizer(special_tokens: &[&str]) -> VocabTokenizer {
    let chars: Vec<String> = (' '..='~').chain(['\n']).map(String::from).collect();
    let vocab: Vec<&str> = special_tokens.iter().copied().chain(chars.iter().map(String::as_str)).collect();
    VocabTokenizer::from_vocab(&vocab)
}

fn resolve_template(template: &str, tokenizer: &VocabTokenizer) -> Option<&'static str> {
    let mut options = ResolveOptions {
        fallback_to_other_wrappers_on_jinja_error: false,
        ..Default::default()
    }
    .with_tokenizer(tokenizer);
    options.custom_wrapper_settings.jinja_template = Some(JinjaTemplateChatWrapperOptions::new(template));
    type_name(&options)
}

#[test]
fn llama2_chat_file_name_without_template() {
    let options = ResolveOptions::default().with_filename("llama-2-7b-chat.Q4_K_M.gguf");
    assert_eq!(type_name(&options), Some("llama2Chat"));
}

#[test]
fn gguf_metadata_template_with_tokenizer() {
    let info = ModelFileInfo::from_gguf_metadata(&json!({
        "general": {"architecture": "qwen2", "name": "Some Chat Model"},
        "tokenizer": {"chat_template": CHATML}
    }));
    let tokenizer = VocabTokenizer::from_vocab(&["<s>", "</s>", "<|im_start|>", "<|im_end|>", "a", "b"])
        .with_builtin(BuiltinToken::Bos, "<s>")
        .with_builtin(BuiltinToken::Eos, "</s>");

    let options = ResolveOptions::default().with_file_info(&info).with_tokenizer(&tokenizer);
    assert_eq!(type_name(&options), Some("chatML"));
}

#[test]
fn config_file_forces_jinja_wrapper() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
type = "jinjaTemplate"

[custom_wrapper_settings.jinjaTemplate]
template = """{}"""
modelRoleName = "bot"
"#,
        CHATML.replace('\n', "\\n")
    )
    .unwrap();
    let config = ResolverConfig::from_file(file.path()).unwrap();

    match resolve_chat_wrapper(&config.resolve_options()).unwrap() {
        Some(BuiltinChatWrapper::JinjaTemplate(wrapper)) => {
            assert_eq!(wrapper.options().model_role_name, "bot");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn qwen_template_with_tools_prefers_qwen_over_chatml() {
    let tokenizer = char_tokenizer(&["<|im_start|>", "<|im_end|>", "<|endoftext|>", "<think>", "</think>"])
        .with_builtin(BuiltinToken::Eos, "<|endoftext|>");
    assert_eq!(resolve_template(QWQ, &tokenizer), Some("qwen"));
    assert_eq!(resolve_template(CHATML, &tokenizer), Some("chatML"));
}

#[test]
fn plain_text_templates_match_by_tokens() {
    let tokenizer = char_tokenizer(&["<s>", "</s>"])
        .with_builtin(BuiltinToken::Bos, "<s>")
        .with_builtin(BuiltinToken::Eos, "</s>");
    assert_eq!(resolve_template(ALPACA, &tokenizer), Some("alpacaChat"));
    assert_eq!(resolve_template(GENERAL, &tokenizer), Some("general"));
}

#[test]
fn llama3_template_matches_with_eot_token() {
    let tokenizer = char_tokenizer(&[
        "<|begin_of_text|>",
        "<|end_of_text|>",
        "<|start_header_id|>",
        "<|end_header_id|>",
        "<|eot_id|>",
    ])
    .with_builtin(BuiltinToken::Bos, "<|begin_of_text|>")
    .with_builtin(BuiltinToken::Eos, "<|end_of_text|>")
    .with_builtin(BuiltinToken::Eot, "<|eot_id|>");
    assert_eq!(resolve_template(LLAMA3, &tokenizer), Some("llama3"));
}
