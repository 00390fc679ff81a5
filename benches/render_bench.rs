//! Benchmarks for rendering long histories and parsing function calls.
//!
//! Usage:
//!   cargo bench --bench render_bench

use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

use llama_chat::history::{ChatHistoryItem, ChatModelFunction, ChatModelFunctionCall, ChatModelFunctions, ModelResponseItem};
use llama_chat::resolve::{resolve_chat_wrapper, ResolveOptions, WrapperType};
use llama_chat::structured::{parse_function_call, FunctionCallGrammar};
use llama_chat::wrapper::{ChatWrapper, ContextStateOptions, JinjaTemplateChatWrapper, JinjaTemplateChatWrapperOptions};

const CHATML: &str = "{% for message in messages %}{{ '<|im_start|>' + message['role'] + '\n' + message['content'] + '<|im_end|>' + '\n' }}{% endfor %}{% if add_generation_prompt %}{{ '<|im_start|>assistant\n' }}{% endif %}";

fn functions() -> ChatModelFunctions {
    ChatModelFunctions::new().with(
        "getWeather",
        ChatModelFunction::new(
            Some("Current weather in a city"),
            Some(json!({"type": "object", "properties": {"city": {"type": "string"}}})),
        ),
    )
}

/// A system prompt followed by `turns` user/model exchanges, every fourth
/// one with a function call.
fn long_history(turns: usize) -> Vec<ChatHistoryItem> {
    let mut history = vec![ChatHistoryItem::system("You are a helpful assistant.")];
    for i in 0..turns {
        history.push(ChatHistoryItem::user(format!("Question number {i}?")));
        let mut response: Vec<ModelResponseItem> = Vec::new();
        if i % 4 == 0 {
            response.push(
                ChatModelFunctionCall::new("getWeather", Some(json!({"city": "Paris"})), Some(json!({"temp": i})))
                    .into(),
            );
        }
        response.push(format!("Answer number {i}.").into());
        history.push(ChatHistoryItem::Model { response });
    }
    history.push(ChatHistoryItem::user("Last question?"));
    history
}

fn bench_render(c: &mut Criterion) {
    let functions = functions();
    let history = long_history(64);

    let mut group = c.benchmark_group("render");
    group.measurement_time(Duration::from_secs(5));

    for wrapper_type in [WrapperType::General, WrapperType::ChatMl, WrapperType::Llama3, WrapperType::Qwen] {
        let options = ResolveOptions { wrapper_type, ..Default::default() };
        let Some(wrapper) = resolve_chat_wrapper(&options).ok().flatten() else {
            continue;
        };
        group.bench_with_input(BenchmarkId::from_parameter(wrapper_type), &history, |b, history| {
            b.iter(|| {
                wrapper
                    .generate_context_state(&ContextStateOptions::new(history).with_functions(&functions))
                    .unwrap()
            });
        });
    }

    if let Ok(jinja) = JinjaTemplateChatWrapper::new(JinjaTemplateChatWrapperOptions::new(CHATML)) {
        group.bench_with_input(BenchmarkId::from_parameter("jinjaTemplate"), &history, |b, history| {
            b.iter(|| jinja.generate_context_state(&ContextStateOptions::new(history)).unwrap());
        });
    }

    group.finish();
}

fn bench_function_calls(c: &mut Criterion) {
    let functions = functions();
    let options = ResolveOptions { wrapper_type: WrapperType::General, ..Default::default() };
    let wrapper = resolve_chat_wrapper(&options).unwrap().unwrap();
    let call = "||call: getWeather({\"city\": \"Paris\"})\n\n\n\n";

    c.bench_function("function_call/grammar", |b| {
        b.iter(|| FunctionCallGrammar::new(&functions, &wrapper, false).unwrap().to_ebnf());
    });
    c.bench_function("function_call/parse", |b| {
        b.iter(|| parse_function_call(call, &functions, &wrapper).unwrap());
    });
}

criterion_group!(benches, bench_render, bench_function_calls);
criterion_main!(benches);
