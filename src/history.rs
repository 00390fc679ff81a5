//! Conversation history and function definitions.
//!
//! These are the persisted shapes: every type round-trips through serde JSON
//! with the same field names the session layer stores.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::text::LlamaText;

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChatHistoryItem {
    System { text: LlamaText },
    User { text: String },
    Model { response: Vec<ModelResponseItem> },
}

impl ChatHistoryItem {
    pub fn system(text: impl Into<LlamaText>) -> Self {
        ChatHistoryItem::System { text: text.into() }
    }

    pub fn user(text: impl Into<String>) -> Self {
        ChatHistoryItem::User { text: text.into() }
    }

    pub fn model<I, T>(response: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ModelResponseItem>,
    {
        ChatHistoryItem::Model {
            response: response.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, ChatHistoryItem::System { .. })
    }
}

/// An entry of a model turn, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelResponseItem {
    Text(String),
    FunctionCall(ChatModelFunctionCall),
    Segment(ChatModelSegment),
}

impl From<&str> for ModelResponseItem {
    fn from(text: &str) -> Self {
        ModelResponseItem::Text(text.to_string())
    }
}

impl From<String> for ModelResponseItem {
    fn from(text: String) -> Self {
        ModelResponseItem::Text(text)
    }
}

impl From<ChatModelFunctionCall> for ModelResponseItem {
    fn from(call: ChatModelFunctionCall) -> Self {
        ModelResponseItem::FunctionCall(call)
    }
}

impl From<ChatModelSegment> for ModelResponseItem {
    fn from(segment: ChatModelSegment) -> Self {
        ModelResponseItem::Segment(segment)
    }
}

/// A function call made by the model, with its result once available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "functionCall", rename_all = "camelCase")]
pub struct ChatModelFunctionCall {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Exact text the model generated for this call, replayed verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<LlamaText>,
    /// Starts a new parallel-call section instead of joining the previous one.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub starts_new_chunk: bool,
}

impl ChatModelFunctionCall {
    pub fn new(name: impl Into<String>, params: Option<Value>, result: Option<Value>) -> Self {
        Self {
            name: name.into(),
            description: None,
            params,
            result,
            raw: None,
            starts_new_chunk: false,
        }
    }

    pub fn with_raw(mut self, raw: impl Into<LlamaText>) -> Self {
        self.raw = Some(raw.into());
        self
    }

    pub fn starting_new_chunk(mut self) -> Self {
        self.starts_new_chunk = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SegmentType {
    Thought,
    Comment,
}

/// A tagged sub-region of a model turn, such as a thought.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "segment", rename_all = "camelCase")]
pub struct ChatModelSegment {
    pub segment_type: SegmentType,
    pub text: String,
    pub ended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<LlamaText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
}

impl ChatModelSegment {
    pub fn thought(text: impl Into<String>, ended: bool) -> Self {
        Self {
            segment_type: SegmentType::Thought,
            text: text.into(),
            ended,
            raw: None,
            start_time: None,
            end_time: None,
        }
    }
}

// =============================================================================
// Functions
// =============================================================================

/// A function the model may call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatModelFunction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON-schema-like parameter shape. `None` means the function takes no
    /// parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl ChatModelFunction {
    pub fn new(description: Option<&str>, params: Option<Value>) -> Self {
        Self {
            description: description.map(str::to_string),
            params,
        }
    }
}

/// Ordered name → function table. Documentation and grammar alternation
/// follow insertion order; the JSON form is an object in that order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatModelFunctions(Vec<(String, ChatModelFunction)>);

impl Serialize for ChatModelFunctions {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, function) in &self.0 {
            map.serialize_entry(name, function)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ChatModelFunctions {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FunctionsVisitor;

        impl<'de> serde::de::Visitor<'de> for FunctionsVisitor {
            type Value = ChatModelFunctions;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a map of function names to function definitions")
            }

            fn visit_map<A: serde::de::MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut res = ChatModelFunctions::new();
                while let Some((name, function)) = access.next_entry::<String, ChatModelFunction>()? {
                    res.insert(name, function);
                }
                Ok(res)
            }
        }

        deserializer.deserialize_map(FunctionsVisitor)
    }
}

impl ChatModelFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `name`.
    pub fn insert(&mut self, name: impl Into<String>, function: ChatModelFunction) {
        let name = name.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = function,
            None => self.0.push((name, function)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, function: ChatModelFunction) -> Self {
        self.insert(name, function);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ChatModelFunction> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ChatModelFunction)> {
        self.0.iter().map(|(n, f)| (n.as_str(), f))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Functions from `self`, then those from `other` whose names are new.
    pub fn merged(&self, other: &ChatModelFunctions) -> ChatModelFunctions {
        let mut res = self.clone();
        for (name, function) in other.iter() {
            if !res.contains(name) {
                res.insert(name, function.clone());
            }
        }
        res
    }
}

impl<S: Into<String>> FromIterator<(S, ChatModelFunction)> for ChatModelFunctions {
    fn from_iter<T: IntoIterator<Item = (S, ChatModelFunction)>>(iter: T) -> Self {
        let mut res = ChatModelFunctions::new();
        for (name, function) in iter {
            res.insert(name, function);
        }
        res
    }
}
