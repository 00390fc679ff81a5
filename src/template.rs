//! Placeholder template parser.
//!
//! Splits a template such as `"{{systemPrompt}}\n{{history}}model:{{completion}}"`
//! on its placeholders and records the literal text before and after each
//! one. Placeholders must appear in the declared order; required ones
//! exactly once.

use aho_corasick::{AhoCorasick, MatchKind};
use anyhow::{bail, Result};
use rustc_hash::FxHashMap;

/// One placeholder to look for.
#[derive(Debug, Clone, Copy)]
pub struct TemplatePart<'a> {
    pub key: &'a str,
    pub text: &'a str,
    pub optional: bool,
}

impl<'a> TemplatePart<'a> {
    pub const fn required(key: &'a str, text: &'a str) -> Self {
        Self { key, text, optional: false }
    }

    pub const fn optional(key: &'a str, text: &'a str) -> Self {
        Self { key, text, optional: true }
    }
}

/// Literal text surrounding a placeholder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaceholderText {
    pub prefix: String,
    pub suffix: String,
}

/// Result of [`parse_text_template`]. Optional placeholders that were not
/// found have no entry.
#[derive(Debug, Clone, Default)]
pub struct ParsedTemplate {
    parts: FxHashMap<String, PlaceholderText>,
}

impl ParsedTemplate {
    pub fn get(&self, key: &str) -> Option<&PlaceholderText> {
        self.parts.get(key)
    }

    /// Like [`get`](Self::get) for placeholders that were required.
    pub fn required(&self, key: &str) -> Result<&PlaceholderText> {
        match self.parts.get(key) {
            Some(part) => Ok(part),
            None => bail!("Template placeholder \"{key}\" was not parsed"),
        }
    }
}

enum Piece<'t> {
    Literal(&'t str),
    Placeholder(usize),
}

/// Split `template` into literal runs and placeholder occurrences.
fn split_template<'t>(template: &'t str, parts: &[TemplatePart<'_>]) -> Result<Vec<Piece<'t>>> {
    let matcher = AhoCorasick::builder()
        .match_kind(MatchKind::LeftmostLongest)
        .build(parts.iter().map(|p| p.text))?;

    let mut pieces = Vec::new();
    let mut last = 0;
    for m in matcher.find_iter(template) {
        pieces.push(Piece::Literal(&template[last..m.start()]));
        pieces.push(Piece::Placeholder(m.pattern().as_usize()));
        last = m.end();
    }
    pieces.push(Piece::Literal(&template[last..]));
    Ok(pieces)
}

fn missing_part_error(parts: &[TemplatePart<'_>], index: usize, found: &ParsedTemplate) -> anyhow::Error {
    let part = &parts[index];
    let previous = parts[..index]
        .iter()
        .rev()
        .find(|p| !p.optional || found.parts.contains_key(p.key));

    match previous {
        Some(previous) => anyhow::anyhow!(
            "Template must contain \"{}\" after \"{}\"",
            part.text,
            previous.text
        ),
        None => anyhow::anyhow!("Template must contain \"{}\" at the beginning", part.text),
    }
}

/// Parse `template` against `parts`, in declared order.
pub fn parse_text_template(template: &str, parts: &[TemplatePart<'_>]) -> Result<ParsedTemplate> {
    let mut result = ParsedTemplate::default();
    let pieces = split_template(template, parts)?;

    let literal = |index: Option<usize>| -> String {
        match index.and_then(|i| pieces.get(i)) {
            Some(Piece::Literal(text)) => text.to_string(),
            _ => String::new(),
        }
    };

    let mut part_index = 0;
    for (i, piece) in pieces.iter().enumerate() {
        let Piece::Placeholder(found) = piece else {
            continue;
        };
        let found = *found;

        if found < part_index {
            bail!("Template must contain exactly one \"{}\"", parts[found].text);
        }

        while part_index < found {
            if !parts[part_index].optional {
                return Err(missing_part_error(parts, part_index, &result));
            }
            part_index += 1;
        }

        result.parts.insert(
            parts[found].key.to_string(),
            PlaceholderText {
                prefix: literal(i.checked_sub(1)),
                suffix: literal(Some(i + 1)),
            },
        );
        part_index += 1;
    }

    while part_index < parts.len() {
        if !parts[part_index].optional {
            return Err(missing_part_error(parts, part_index, &result));
        }
        part_index += 1;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const X: TemplatePart<'static> = TemplatePart::required("x", "{{x}}");
    const Y: TemplatePart<'static> = TemplatePart::required("y", "{{y}}");

    #[test]
    fn prefix_and_suffix_are_collected() {
        let parsed = parse_text_template("A{{x}}B{{y}}C", &[X, Y]).unwrap();
        let x = parsed.get("x").unwrap();
        let y = parsed.get("y").unwrap();
        assert_eq!((x.prefix.as_str(), x.suffix.as_str()), ("A", "B"));
        assert_eq!((y.prefix.as_str(), y.suffix.as_str()), ("B", "C"));
    }

    #[test]
    fn missing_required_placeholder_fails() {
        let err = parse_text_template("A{{x}}B", &[X, Y]).unwrap_err();
        assert_eq!(err.to_string(), "Template must contain \"{{y}}\" after \"{{x}}\"");
    }

    #[test]
    fn missing_first_placeholder_fails() {
        let err = parse_text_template("A{{y}}", &[X, Y]).unwrap_err();
        assert_eq!(err.to_string(), "Template must contain \"{{x}}\" at the beginning");
    }

    #[test]
    fn out_of_order_placeholders_fail() {
        let err = parse_text_template("{{y}}{{x}}", &[X, Y]).unwrap_err();
        assert!(err.to_string().starts_with("Template must contain"));
    }

    #[test]
    fn duplicated_placeholder_fails() {
        let err = parse_text_template("{{x}}{{y}}{{x}}", &[X, Y]).unwrap_err();
        assert_eq!(err.to_string(), "Template must contain exactly one \"{{x}}\"");
    }

    #[test]
    fn optional_placeholder_may_be_absent() {
        let sys = TemplatePart::optional("sys", "{{sys}}");
        let parsed = parse_text_template("{{x}}-{{y}}", &[sys, X, Y]).unwrap();
        assert!(parsed.get("sys").is_none());
        assert_eq!(parsed.get("x").unwrap().prefix, "");
        assert_eq!(parsed.get("y").unwrap().suffix, "");
    }

    #[test]
    fn adjacent_placeholders_have_empty_text_between() {
        let parsed = parse_text_template("{{x}}{{y}}!", &[X, Y]).unwrap();
        assert_eq!(parsed.get("x").unwrap().suffix, "");
        assert_eq!(parsed.get("y").unwrap().prefix, "");
        assert_eq!(parsed.get("y").unwrap().suffix, "!");
    }
}
