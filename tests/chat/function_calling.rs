//! Calls rendered by a wrapper must parse back through the same wrapper.

use llama_chat::history::{ChatHistoryItem, ChatModelFunction, ChatModelFunctionCall, ChatModelFunctions};
use llama_chat::resolve::{resolve_chat_wrapper, ResolveOptions, WrapperType};
use llama_chat::structured::{
    parse_function_call, parse_function_name_from_partial_call, FunctionCallGrammar, ParseNameOptions,
};
use llama_chat::wrapper::{
    BuiltinChatWrapper, ChatWrapper, ContextStateOptions, TemplateChatWrapper, TemplateChatWrapperOptions,
};
use serde_json::json;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn functions() -> ChatModelFunctions {
    ChatModelFunctions::new()
        .with(
            "getWeather",
            ChatModelFunction::new(
                Some("Current weather in a city"),
                Some(json!({
                    "type": "object",
                    "properties": {
                        "city": {"type": "string"},
                        "unit": {"enum": ["c", "f"]}
                    },
                    "required": ["city"]
                })),
            ),
        )
        .with("getTime", ChatModelFunction::new(Some("Current time"), None))
}

fn wrapper(wrapper_type: WrapperType) -> BuiltinChatWrapper {
    let options = ResolveOptions { wrapper_type, ..Default::default() };
    resolve_chat_wrapper(&options).unwrap().unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn every_specialized_wrapper_parses_its_own_calls() {
    let params = json!({"city": "Paris", "unit": "c"});
    for wrapper_type in WrapperType::SPECIALIZED {
        let wrapper = wrapper(wrapper_type);
        let text = wrapper.generate_function_call("getWeather", Some(&params)).to_string();

        let call = parse_function_call(&text, &functions(), &wrapper)
            .unwrap_or_else(|err| panic!("{wrapper_type}: {err} in {text:?}"));
        assert_eq!(call.function_name, "getWeather", "{wrapper_type}");
        assert_eq!(call.params, Some(params.clone()), "{wrapper_type}");
    }
}

#[test]
fn every_specialized_wrapper_builds_a_grammar() {
    for wrapper_type in WrapperType::SPECIALIZED {
        let wrapper = wrapper(wrapper_type);
        let grammar = FunctionCallGrammar::new(&functions(), &wrapper, false).unwrap();
        let ebnf = grammar.to_ebnf();
        assert!(ebnf.starts_with("root ::= "), "{wrapper_type}: {ebnf}");
        assert!(ebnf.contains("getWeather"), "{wrapper_type}");
        assert!(ebnf.contains("getTime"), "{wrapper_type}");
        assert!(!grammar.stop_generation_triggers().is_empty());
    }
}

#[test]
fn invalid_params_surface_as_typed_error() {
    let wrapper = wrapper(WrapperType::General);
    let err = parse_function_call("||call: getWeather({\"unit\": \"k\"})", &functions(), &wrapper).unwrap_err();
    assert_eq!(err.wrapper_name, "General");
    assert_eq!(err.function_names, vec!["getWeather".to_string(), "getTime".to_string()]);

    let err: anyhow::Error = err.into();
    assert!(err.downcast_ref::<llama_chat::FunctionCallValidationError>().is_some());
}

#[test]
fn partial_call_name_is_read_before_params_finish() {
    let wrapper = wrapper(WrapperType::General);
    let name = parse_function_name_from_partial_call(
        " ||call: getTime(",
        &functions(),
        &wrapper,
        ParseNameOptions::default(),
    )
    .unwrap();
    assert_eq!(name, "getTime");
}

#[test]
fn calls_in_history_are_rendered_with_results() {
    let history = vec![
        ChatHistoryItem::system("You are a weather bot."),
        ChatHistoryItem::user("Weather in Paris?"),
        ChatHistoryItem::model([
            ChatModelFunctionCall::new("getWeather", Some(json!({"city": "Paris"})), Some(json!({"temp": 21}))).into(),
            llama_chat::ModelResponseItem::from("It is 21 degrees."),
        ]),
    ];
    let functions = functions();

    for wrapper_type in WrapperType::SPECIALIZED {
        let wrapper = wrapper(wrapper_type);
        let state = wrapper
            .generate_context_state(&ContextStateOptions::new(&history).with_functions(&functions))
            .unwrap();
        let text = state.context_text.to_string();
        assert!(text.contains("getWeather"), "{wrapper_type}: {text:?}");
        assert!(text.contains("21"), "{wrapper_type}: {text:?}");
        assert!(text.contains("It is 21 degrees."), "{wrapper_type}: {text:?}");
    }
}

#[test]
fn custom_call_syntax_renders_and_parses_back() {
    let options: TemplateChatWrapperOptions = serde_json::from_value(json!({
        "template": "{{history}}model:{{completion}}\nuser:",
        "historyTemplate": {
            "system": "system: {{message}}\n",
            "user": "user: {{message}}\n",
            "model": "model: {{message}}\n"
        },
        "functionCallMessageTemplate": {
            "call": "<call>{{functionName}}|{{functionParams}}</call>",
            "result": "<result>{{functionCallResult}}</result>"
        }
    }))
    .unwrap();
    let wrapper = TemplateChatWrapper::new(options).unwrap();
    let functions = ChatModelFunctions::new().with(
        "f",
        ChatModelFunction::new(
            None,
            Some(json!({"type": "object", "properties": {"a": {"type": "number"}}})),
        ),
    );

    let rendered = wrapper.generate_function_call("f", Some(&json!({"a": 1}))).to_string();
    assert!(rendered.starts_with("<call>f|"), "{rendered:?}");
    assert!(rendered.ends_with("</call>"), "{rendered:?}");

    let call = parse_function_call(&rendered, &functions, &wrapper).unwrap();
    assert_eq!(call.function_name, "f");
    assert_eq!(call.params, Some(json!({"a": 1})));
}
