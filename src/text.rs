//! Text fragment model.
//!
//! A [`LlamaText`] is an immutable, ordered list of [`Fragment`]s. Each
//! fragment is either plain text, literal special-token text that must be
//! tokenized in special mode, or a named builtin token (BOS/EOS/EOT/NL) that
//! is resolved against the model vocabulary at tokenization time.
//!
//! Construction normalizes the fragment list: nested texts are flattened,
//! empty strings are dropped and adjacent fragments of the same text kind are
//! merged. Merging never changes tokenization, because plain-text runs are
//! tokenized as one piece and special-token text is tokenized atomically
//! either way.
//!
//! ```rust
//! use llama_chat::llama_text;
//! use llama_chat::text::{special, BuiltinToken, LlamaText};
//!
//! let text = llama_text![BuiltinToken::Bos, special("<|im_start|>user\n"), "Hi", special("<|im_end|>")];
//! let json = text.to_json();
//! assert_eq!(LlamaText::from_json(&json).unwrap(), text);
//! ```

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::tokenizer::{Token, TokenizeError, TokenizeMode, Tokenizer};

// =============================================================================
// Fragments
// =============================================================================

/// Builtin special tokens resolved against the active vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuiltinToken {
    #[serde(rename = "BOS")]
    Bos,
    #[serde(rename = "EOS")]
    Eos,
    #[serde(rename = "EOT")]
    Eot,
    #[serde(rename = "NL")]
    Nl,
}

impl BuiltinToken {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuiltinToken::Bos => "BOS",
            BuiltinToken::Eos => "EOS",
            BuiltinToken::Eot => "EOT",
            BuiltinToken::Nl => "NL",
        }
    }
}

impl fmt::Display for BuiltinToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One element of a [`LlamaText`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fragment {
    /// Plain text, tokenized normally.
    Text(String),
    /// Literal text that must be tokenized as special tokens.
    SpecialTokensText(String),
    /// A named builtin token.
    SpecialToken(BuiltinToken),
}

impl Fragment {
    fn is_empty(&self) -> bool {
        match self {
            Fragment::Text(s) | Fragment::SpecialTokensText(s) => s.is_empty(),
            Fragment::SpecialToken(_) => false,
        }
    }

    fn text(&self) -> Option<&str> {
        match self {
            Fragment::Text(s) | Fragment::SpecialTokensText(s) => Some(s),
            Fragment::SpecialToken(_) => None,
        }
    }

    fn same_kind(&self, other: &Fragment) -> bool {
        matches!(
            (self, other),
            (Fragment::Text(_), Fragment::Text(_))
                | (Fragment::SpecialTokensText(_), Fragment::SpecialTokensText(_))
        )
    }

    fn with_text(&self, text: String) -> Fragment {
        match self {
            Fragment::Text(_) => Fragment::Text(text),
            Fragment::SpecialTokensText(_) => Fragment::SpecialTokensText(text),
            Fragment::SpecialToken(t) => Fragment::SpecialToken(*t),
        }
    }
}

/// Shorthand for a literal special-token-text fragment.
pub fn special(text: impl Into<String>) -> Fragment {
    Fragment::SpecialTokensText(text.into())
}

// =============================================================================
// LlamaText
// =============================================================================

/// Immutable sequence of text fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "LlamaTextJson", into = "LlamaTextJson")]
pub struct LlamaText {
    values: Vec<Fragment>,
}

/// Build a [`LlamaText`] from any mix of values convertible into one.
#[macro_export]
macro_rules! llama_text {
    () => {
        $crate::text::LlamaText::default()
    };
    ($($part:expr),+ $(,)?) => {
        $crate::text::LlamaText::from_parts([$($crate::text::LlamaText::from($part)),+])
    };
}

impl LlamaText {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concatenate parts, normalizing the result.
    pub fn from_parts<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<LlamaText>,
    {
        let mut res = LlamaText::new();
        for part in parts {
            for fragment in part.into().values {
                res.push(fragment);
            }
        }
        res
    }

    /// Join `items`, inserting `separator` between each pair.
    pub fn join<I, T>(separator: impl Into<LlamaText>, items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<LlamaText>,
    {
        let separator = separator.into();
        let mut res = LlamaText::new();
        for (i, item) in items.into_iter().enumerate() {
            if i > 0 {
                res = res.concat(&separator);
            }
            res = res.concat(&item.into());
        }
        res
    }

    fn push(&mut self, fragment: Fragment) {
        if fragment.is_empty() {
            return;
        }
        if let Some(last) = self.values.last_mut() {
            if last.same_kind(&fragment) {
                if let (Fragment::Text(a), Fragment::Text(b))
                | (Fragment::SpecialTokensText(a), Fragment::SpecialTokensText(b)) = (last, &fragment)
                {
                    a.push_str(b);
                    return;
                }
            }
        }
        self.values.push(fragment);
    }

    pub fn values(&self) -> &[Fragment] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn concat(&self, other: &LlamaText) -> LlamaText {
        let mut res = self.clone();
        for fragment in &other.values {
            res.push(fragment.clone());
        }
        res
    }

    pub fn map_values(&self, mapper: impl Fn(&Fragment) -> Fragment) -> LlamaText {
        LlamaText::from_parts(self.values.iter().map(mapper))
    }

    /// Insert `separator` between every fragment of this text.
    pub fn join_values(&self, separator: impl Into<LlamaText>) -> LlamaText {
        LlamaText::join(separator, self.values.iter().cloned())
    }

    /// Structural equality, fragment by fragment.
    pub fn compare(a: &LlamaText, b: &LlamaText) -> bool {
        a == b
    }

    pub fn starts_with_builtin(&self, token: BuiltinToken) -> bool {
        matches!(self.values.first(), Some(Fragment::SpecialToken(t)) if *t == token)
    }

    /// Drop trailing whitespace from the last text fragments.
    pub fn trim_end(&self) -> LlamaText {
        let mut values = self.values.clone();
        while let Some(last) = values.last() {
            let Some(text) = last.text() else { break };
            let trimmed = text.trim_end();
            if trimmed.is_empty() {
                values.pop();
                continue;
            }
            let replacement = last.with_text(trimmed.to_string());
            if let Some(slot) = values.last_mut() {
                *slot = replacement;
            }
            break;
        }
        LlamaText { values }
    }

    /// Drop leading whitespace from the first text fragments.
    pub fn trim_start(&self) -> LlamaText {
        let mut values = self.values.clone();
        while let Some(first) = values.first() {
            let Some(text) = first.text() else { break };
            let trimmed = text.trim_start();
            if trimmed.is_empty() {
                values.remove(0);
                continue;
            }
            values[0] = first.with_text(trimmed.to_string());
            break;
        }
        LlamaText { values }
    }

    /// Whether `needle` appears in this text. A single-fragment needle may
    /// match inside a fragment of the same kind; a longer needle must start
    /// at the end of one fragment and finish at the start of another, with
    /// every fragment in between matching exactly.
    pub fn includes(&self, needle: &LlamaText) -> bool {
        let n = needle.values.len();
        if n == 0 {
            return true;
        }
        if n > self.values.len() {
            return false;
        }

        if n == 1 {
            let probe = &needle.values[0];
            return self.values.iter().any(|value| match (value, probe) {
                (Fragment::SpecialToken(a), Fragment::SpecialToken(b)) => a == b,
                (a, b) if a.same_kind(b) => a.text().unwrap_or("").contains(b.text().unwrap_or("")),
                _ => false,
            });
        }

        (0..=self.values.len() - n).any(|start| {
            needle.values.iter().enumerate().all(|(j, probe)| {
                let value = &self.values[start + j];
                if value == probe {
                    return true;
                }
                if !value.same_kind(probe) {
                    return false;
                }
                let (value, probe) = (value.text().unwrap_or(""), probe.text().unwrap_or(""));
                if j == 0 {
                    value.ends_with(probe)
                } else if j == n - 1 {
                    value.starts_with(probe)
                } else {
                    false
                }
            })
        })
    }

    /// Tokenize every fragment. Plain-text runs are tokenized together;
    /// special fragments are tokenized in isolation. `trim_leading_space`
    /// applies to the first piece only; later pieces never sit at a sequence
    /// boundary and are always trimmed.
    pub fn tokenize(&self, tokenizer: &dyn Tokenizer, trim_leading_space: bool) -> Result<Vec<Token>, TokenizeError> {
        let mut res: Vec<Token> = Vec::new();
        let mut pending = String::new();
        let mut trim = trim_leading_space;

        let flush = |pending: &mut String, res: &mut Vec<Token>, trim: &mut bool| {
            if !pending.is_empty() {
                res.extend(tokenizer.tokenize(pending, TokenizeMode::Plain, *trim));
                pending.clear();
                *trim = true;
            }
        };

        for value in &self.values {
            match value {
                Fragment::Text(text) => pending.push_str(text),
                Fragment::SpecialTokensText(text) => {
                    flush(&mut pending, &mut res, &mut trim);
                    res.extend(tokenizer.tokenize(text, TokenizeMode::Special, trim));
                    trim = true;
                }
                Fragment::SpecialToken(token) => {
                    flush(&mut pending, &mut res, &mut trim);
                    match tokenizer.builtin_token(*token) {
                        Some(id) => res.push(id),
                        None if *token == BuiltinToken::Nl => {
                            res.extend(tokenizer.tokenize("\n", TokenizeMode::Plain, true));
                        }
                        None => return Err(TokenizeError::MissingBuiltinToken(*token)),
                    }
                    trim = true;
                }
            }
        }
        flush(&mut pending, &mut res, &mut trim);

        Ok(res)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(LlamaTextJson::from(self.clone())).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_json(json: &serde_json::Value) -> Result<LlamaText> {
        Ok(serde_json::from_value(json.clone())?)
    }
}

impl fmt::Display for LlamaText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for value in &self.values {
            match value {
                Fragment::Text(s) | Fragment::SpecialTokensText(s) => f.write_str(s)?,
                Fragment::SpecialToken(t) => f.write_str(t.as_str())?,
            }
        }
        Ok(())
    }
}

// ─── Conversions ────────────────────────────────────────────────────────────

impl From<Fragment> for LlamaText {
    fn from(fragment: Fragment) -> Self {
        let mut res = LlamaText::new();
        res.push(fragment);
        res
    }
}

impl From<&Fragment> for LlamaText {
    fn from(fragment: &Fragment) -> Self {
        LlamaText::from(fragment.clone())
    }
}

impl From<BuiltinToken> for LlamaText {
    fn from(token: BuiltinToken) -> Self {
        LlamaText::from(Fragment::SpecialToken(token))
    }
}

impl From<&str> for LlamaText {
    fn from(text: &str) -> Self {
        LlamaText::from(Fragment::Text(text.to_string()))
    }
}

impl From<String> for LlamaText {
    fn from(text: String) -> Self {
        LlamaText::from(Fragment::Text(text))
    }
}

impl From<&String> for LlamaText {
    fn from(text: &String) -> Self {
        LlamaText::from(text.as_str())
    }
}

impl From<&LlamaText> for LlamaText {
    fn from(text: &LlamaText) -> Self {
        text.clone()
    }
}

impl From<Vec<LlamaText>> for LlamaText {
    fn from(texts: Vec<LlamaText>) -> Self {
        LlamaText::from_parts(texts)
    }
}

impl From<Option<LlamaText>> for LlamaText {
    fn from(text: Option<LlamaText>) -> Self {
        text.unwrap_or_default()
    }
}

// ─── JSON shape ─────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum LlamaTextJson {
    Plain(String),
    Values(Vec<FragmentJson>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum FragmentJson {
    Text(String),
    Special(SpecialJson),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum SpecialJson {
    SpecialTokensText { value: String },
    SpecialToken { value: BuiltinToken },
}

impl From<LlamaText> for LlamaTextJson {
    fn from(text: LlamaText) -> Self {
        if let [Fragment::Text(s)] = text.values.as_slice() {
            return LlamaTextJson::Plain(s.clone());
        }
        LlamaTextJson::Values(
            text.values
                .into_iter()
                .map(|value| match value {
                    Fragment::Text(s) => FragmentJson::Text(s),
                    Fragment::SpecialTokensText(s) => {
                        FragmentJson::Special(SpecialJson::SpecialTokensText { value: s })
                    }
                    Fragment::SpecialToken(t) => FragmentJson::Special(SpecialJson::SpecialToken { value: t }),
                })
                .collect(),
        )
    }
}

impl From<LlamaTextJson> for LlamaText {
    fn from(json: LlamaTextJson) -> Self {
        match json {
            LlamaTextJson::Plain(s) => LlamaText::from(s),
            LlamaTextJson::Values(values) => LlamaText::from_parts(values.into_iter().map(|value| match value {
                FragmentJson::Text(s) => Fragment::Text(s),
                FragmentJson::Special(SpecialJson::SpecialTokensText { value }) => Fragment::SpecialTokensText(value),
                FragmentJson::Special(SpecialJson::SpecialToken { value }) => Fragment::SpecialToken(value),
            })),
        }
    }
}
