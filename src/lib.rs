//! Chat prompt formatting and function calling for llama.cpp-style models.
//!
//! A chat wrapper renders a conversation into the exact text a model family
//! was trained on, including special tokens, function documentation and
//! previous function calls, and reports what ends a model turn. The
//! [`structured`] module constrains and parses the function calls the model
//! writes back, and [`resolve`] picks a wrapper from model metadata.
//!
//! ```rust
//! use llama_chat::history::ChatHistoryItem;
//! use llama_chat::resolve::{resolve_chat_wrapper, ModelFileInfo, ResolveOptions};
//! use llama_chat::wrapper::{ChatWrapper, ContextStateOptions};
//!
//! let info = ModelFileInfo { architecture: Some("gemma".into()), ..Default::default() };
//! let wrapper = resolve_chat_wrapper(&ResolveOptions::default().with_file_info(&info))
//!     .unwrap()
//!     .unwrap();
//!
//! let history = vec![ChatHistoryItem::user("Hi"), ChatHistoryItem::model([""])];
//! let state = wrapper.generate_context_state(&ContextStateOptions::new(&history)).unwrap();
//! assert!(state.context_text.to_string().ends_with("<start_of_turn>model\n"));
//! ```

pub mod config;
pub mod history;
pub mod logging;
pub mod resolve;
pub mod structured;
pub mod template;
pub mod text;
pub mod tokenizer;
pub mod wrapper;

pub use config::ResolverConfig;
pub use history::{ChatHistoryItem, ChatModelFunction, ChatModelFunctionCall, ChatModelFunctions, ModelResponseItem};
pub use resolve::{resolve_chat_wrapper, ModelFileInfo, ResolveOptions, WrapperType};
pub use structured::{parse_function_call, FunctionCall, FunctionCallGrammar, FunctionCallValidationError};
pub use text::{special, BuiltinToken, Fragment, LlamaText};
pub use tokenizer::{Detokenizer, Token, Tokenizer};
pub use wrapper::{BuiltinChatWrapper, ChatWrapper, ContextState, ContextStateOptions};
