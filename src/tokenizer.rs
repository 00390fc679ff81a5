//! Tokenizer capability.
//!
//! The chat layer never owns a real tokenizer. It consumes one through the
//! [`Tokenizer`] and [`Detokenizer`] traits so that rendered [`LlamaText`]
//! can be turned into tokens by whatever engine is loaded.
//!
//! [`VocabTokenizer`] is a small vocabulary-backed implementation: added and
//! special tokens are split out first with an Aho-Corasick matcher, and the
//! remaining text is greedily longest-matched against the vocabulary.
//!
//! [`LlamaText`]: crate::text::LlamaText

use aho_corasick::AhoCorasick;
use rustc_hash::FxHashMap;
use thiserror::Error;
use unicode_normalization::{is_nfc_quick, IsNormalized, UnicodeNormalization};

use crate::text::BuiltinToken;

/// A token id in the model vocabulary.
pub type Token = u32;

/// How a piece of text should be tokenized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizeMode {
    /// Special-token text is treated as ordinary characters.
    Plain,
    /// Special-token text is matched against the special vocabulary.
    Special,
}

/// Errors raised while tokenizing text fragments.
#[derive(Debug, Error)]
pub enum TokenizeError {
    #[error("Builtin token \"{0}\" is not present in the model vocabulary")]
    MissingBuiltinToken(BuiltinToken),
}

/// Text → tokens capability provided by the inference engine.
pub trait Tokenizer: Send + Sync {
    /// Tokenize `text`. When `trim_leading_space` is set the tokenizer must
    /// not add the leading space some vocabularies insert at sequence start.
    fn tokenize(&self, text: &str, mode: TokenizeMode, trim_leading_space: bool) -> Vec<Token>;

    /// Resolve a named builtin token (BOS/EOS/EOT/NL) to its id.
    fn builtin_token(&self, token: BuiltinToken) -> Option<Token>;

    fn is_special_token(&self, token: Token) -> bool;
}

/// Tokens → text capability provided by the inference engine.
pub trait Detokenizer: Send + Sync {
    fn detokenize(&self, tokens: &[Token], skip_special: bool) -> String;
}

// ---------------------------------------------------------------------------
// Added tokens
// ---------------------------------------------------------------------------

/// A token added on top of the base vocabulary.
#[derive(Debug, Clone)]
pub struct AddedToken {
    pub id: Token,
    pub content: String,
    pub special: bool,
}

/// A segment produced by splitting input text on added tokens.
enum Segment<'a> {
    Text(&'a str),
    AddedToken(Token),
}

// ---------------------------------------------------------------------------
// VocabTokenizer
// ---------------------------------------------------------------------------

/// Greedy longest-match tokenizer over a fixed vocabulary.
pub struct VocabTokenizer {
    pieces: Vec<String>,
    piece_ids: FxHashMap<String, Token>,
    max_piece_chars: usize,
    unk_token_id: Token,

    added_tokens: Vec<AddedToken>,
    added_token_matcher: Option<AhoCorasick>,
    special_token_ids: Vec<Token>,

    builtins: FxHashMap<BuiltinToken, Token>,
    prepend_space: bool,
}

impl VocabTokenizer {
    /// Build a tokenizer from plain vocabulary pieces (ids are positions)
    /// and added tokens. An `<unk>` piece is appended for unmatched chars.
    pub fn new(vocab: &[&str], added_tokens: Vec<AddedToken>) -> Self {
        let mut pieces: Vec<String> = vocab.iter().map(|s| s.to_string()).collect();
        let unk_token_id = pieces.len() as Token;
        pieces.push("<unk>".to_string());

        let mut piece_ids = FxHashMap::default();
        for (id, piece) in pieces.iter().enumerate() {
            piece_ids.entry(piece.clone()).or_insert(id as Token);
        }
        let max_piece_chars = pieces.iter().map(|p| p.chars().count()).max().unwrap_or(1);

        let mut special_token_ids: Vec<Token> = added_tokens
            .iter()
            .filter(|t| t.special)
            .map(|t| t.id)
            .collect();
        special_token_ids.sort_unstable();

        let added_token_matcher = if added_tokens.is_empty() {
            None
        } else {
            let patterns: Vec<&str> = added_tokens.iter().map(|t| t.content.as_str()).collect();
            AhoCorasick::builder()
                .match_kind(aho_corasick::MatchKind::LeftmostLongest)
                .build(&patterns)
                .ok()
        };

        Self {
            pieces,
            piece_ids,
            max_piece_chars,
            unk_token_id,
            added_tokens,
            added_token_matcher,
            special_token_ids,
            builtins: FxHashMap::default(),
            prepend_space: false,
        }
    }

    /// Convenience constructor: every entry that looks like `<...>` becomes a
    /// special added token, everything else a plain vocabulary piece.
    pub fn from_vocab(vocab: &[&str]) -> Self {
        let mut plain = Vec::new();
        let mut added = Vec::new();
        let base = 10_000;
        for piece in vocab {
            if piece.len() > 2 && piece.starts_with('<') && piece.ends_with('>') {
                added.push(AddedToken {
                    id: base + added.len() as Token,
                    content: piece.to_string(),
                    special: true,
                });
            } else {
                plain.push(*piece);
            }
        }
        Self::new(&plain, added)
    }

    /// Map a builtin token to the added token whose content is `content`.
    pub fn with_builtin(mut self, token: BuiltinToken, content: &str) -> Self {
        if let Some(id) = self.added_token_id(content) {
            self.builtins.insert(token, id);
        }
        self
    }

    /// Prepend a space to the first text run unless the caller asks to trim
    /// it (SentencePiece-style vocabularies).
    pub fn with_prepend_space(mut self, prepend_space: bool) -> Self {
        self.prepend_space = prepend_space;
        self
    }

    pub fn added_token_id(&self, content: &str) -> Option<Token> {
        self.added_tokens
            .iter()
            .find(|t| t.content == content)
            .map(|t| t.id)
    }

    pub fn vocab_size(&self) -> usize {
        self.pieces.len() + self.added_tokens.len()
    }

    fn split_added_tokens<'a>(&self, text: &'a str) -> Vec<Segment<'a>> {
        let Some(matcher) = &self.added_token_matcher else {
            return vec![Segment::Text(text)];
        };

        let mut segments = Vec::new();
        let mut last = 0;
        for m in matcher.find_iter(text) {
            if m.start() > last {
                segments.push(Segment::Text(&text[last..m.start()]));
            }
            segments.push(Segment::AddedToken(self.added_tokens[m.pattern().as_usize()].id));
            last = m.end();
        }
        if last < text.len() {
            segments.push(Segment::Text(&text[last..]));
        }
        segments
    }

    fn encode_text(&self, text: &str, is_first: bool, trim_leading_space: bool, ids: &mut Vec<Token>) {
        let mut buf = if is_nfc_quick(text.chars()) != IsNormalized::Yes {
            text.nfc().collect::<String>()
        } else {
            text.to_string()
        };
        if is_first && self.prepend_space && !trim_leading_space && !buf.starts_with(' ') {
            buf.insert(0, ' ');
        }

        let chars: Vec<(usize, char)> = buf.char_indices().collect();
        let mut i = 0;
        while i < chars.len() {
            let start = chars[i].0;
            let mut matched = None;
            let longest = self.max_piece_chars.min(chars.len() - i);
            for len in (1..=longest).rev() {
                let end = chars.get(i + len).map(|(pos, _)| *pos).unwrap_or(buf.len());
                if let Some(&id) = self.piece_ids.get(&buf[start..end]) {
                    matched = Some((id, len));
                    break;
                }
            }
            match matched {
                Some((id, len)) => {
                    ids.push(id);
                    i += len;
                }
                None => {
                    ids.push(self.unk_token_id);
                    i += 1;
                }
            }
        }
    }
}

impl Tokenizer for VocabTokenizer {
    fn tokenize(&self, text: &str, mode: TokenizeMode, trim_leading_space: bool) -> Vec<Token> {
        if text.is_empty() {
            return vec![];
        }

        let segments = match mode {
            TokenizeMode::Special => self.split_added_tokens(text),
            TokenizeMode::Plain => vec![Segment::Text(text)],
        };

        let mut ids = Vec::new();
        let mut is_first_text = true;
        for segment in segments {
            match segment {
                Segment::Text(t) => {
                    self.encode_text(t, is_first_text, trim_leading_space, &mut ids);
                    is_first_text = false;
                }
                Segment::AddedToken(id) => ids.push(id),
            }
        }
        ids
    }

    fn builtin_token(&self, token: BuiltinToken) -> Option<Token> {
        self.builtins.get(&token).copied()
    }

    fn is_special_token(&self, token: Token) -> bool {
        self.special_token_ids.binary_search(&token).is_ok()
    }
}

impl Detokenizer for VocabTokenizer {
    fn detokenize(&self, tokens: &[Token], skip_special: bool) -> String {
        let mut out = String::new();
        for &id in tokens {
            if let Some(piece) = self.pieces.get(id as usize) {
                out.push_str(piece);
            } else if let Some(added) = self.added_tokens.iter().find(|t| t.id == id) {
                if !(skip_special && added.special) {
                    out.push_str(&added.content);
                }
            }
        }
        out
    }
}
