//! Model file name parsing, e.g. `llama-2-7b-chat.Q4_K_M.gguf`.

/// Components recognised in a model file name. Dash-separated parts before
/// the parameter count form the name and sub type; parts after it are
/// sorted into version, context size and free-form info.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedModelFileName {
    pub name: Option<String>,
    pub sub_type: String,
    pub quantization: Option<String>,
    pub file_type: Option<String>,
    pub version: Option<String>,
    pub context_size: Option<String>,
    /// Upper-cased, e.g. `13B`.
    pub parameters: Option<String>,
    pub other_info: Vec<String>,
}

pub fn parse_model_file_name(filename: &str) -> ParsedModelFileName {
    let mut parts: Vec<String> = filename.split('-').map(str::to_string).collect();
    let mut parsed = ParsedModelFileName::default();

    if let Some(last) = parts.pop() {
        let mut last_parts: Vec<&str> = last.split('.').collect();
        parsed.file_type = last_parts.pop().map(str::to_string);
        parsed.quantization = last_parts.pop().map(str::to_string);
        if !last_parts.is_empty() {
            parts.push(last_parts.join("."));
        }
    }

    let (mut previous, next) = match parts.iter().position(|part| is_parameters_text(part)) {
        Some(index) => {
            parsed.parameters = Some(parts[index].to_uppercase());
            let next = parts.split_off(index + 1);
            parts.pop();
            (parts, next)
        }
        None => (parts, Vec::new()),
    };

    if !previous.is_empty() {
        parsed.name = Some(previous.remove(0));
    }
    parsed.sub_type = previous.join("-");

    for part in next {
        if is_context_size_text(&part) {
            parsed.context_size = Some(part.to_uppercase());
        } else if is_version_text(&part) {
            parsed.version = Some(part.to_lowercase());
        } else {
            parsed.other_info.push(part);
        }
    }

    parsed
}

/// `[0-9]+[Bb]`
fn is_parameters_text(text: &str) -> bool {
    digits_then(text, |c| c == 'B' || c == 'b')
}

/// `[0-9]+[kKmM]`
fn is_context_size_text(text: &str) -> bool {
    digits_then(text, |c| matches!(c, 'k' | 'K' | 'm' | 'M'))
}

/// Starts with `[vV]?[0-9]`.
fn is_version_text(text: &str) -> bool {
    let rest = text.strip_prefix(['v', 'V']).unwrap_or(text);
    rest.starts_with(|c: char| c.is_ascii_digit())
}

fn digits_then(text: &str, suffix: impl Fn(char) -> bool) -> bool {
    let Some(last) = text.chars().last() else {
        return false;
    };
    let digits = &text[..text.len() - last.len_utf8()];
    suffix(last) && !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(name: &str, sub_type: &str, quantization: &str, parameters: Option<&str>) -> ParsedModelFileName {
        ParsedModelFileName {
            name: Some(name.to_string()),
            sub_type: sub_type.to_string(),
            quantization: Some(quantization.to_string()),
            file_type: Some("gguf".to_string()),
            parameters: parameters.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn name_sub_type_and_parameters() {
        assert_eq!(parse_model_file_name("orca-2-13b.Q4_K_M.gguf"), parsed("orca", "2", "Q4_K_M", Some("13B")));
        assert_eq!(
            parse_model_file_name("dolphin-2.1-mistral-7b.Q4_K_M.gguf"),
            parsed("dolphin", "2.1-mistral", "Q4_K_M", Some("7B"))
        );
    }

    #[test]
    fn version_and_context_size_after_parameters() {
        let mut expected = parsed("phind", "codellama", "Q4_K_M", Some("34B"));
        expected.version = Some("v2".to_string());
        assert_eq!(parse_model_file_name("phind-codellama-34b-v2.Q4_K_M.gguf"), expected);

        let mut expected = parsed("yarn", "llama-2", "Q5_K_S", Some("13B"));
        expected.context_size = Some("64K".to_string());
        assert_eq!(parse_model_file_name("yarn-llama-2-13b-64k.Q5_K_S.gguf"), expected);
    }

    #[test]
    fn dotted_version_stays_in_sub_type_without_parameters() {
        assert_eq!(
            parse_model_file_name("functionary-small-v2.2.q4_0.gguf"),
            parsed("functionary", "small-v2.2", "q4_0", None)
        );
    }

    #[test]
    fn quantization_as_its_own_dash_part() {
        let mut expected = parsed("gemma", "", "Q5_K_M", Some("7B"));
        expected.other_info = vec!["it".to_string()];
        assert_eq!(parse_model_file_name("gemma-7b-it-Q5_K_M.gguf"), expected);

        let mut expected = parsed("llama", "2", "Q4_K_M", Some("7B"));
        expected.other_info = vec!["chat".to_string()];
        assert_eq!(parse_model_file_name("llama-2-7b-chat.Q4_K_M.gguf"), expected);
    }

    #[test]
    fn bare_name() {
        let parsed = parse_model_file_name("model");
        assert_eq!(parsed.file_type.as_deref(), Some("model"));
        assert_eq!(parsed.name, None);
    }
}
