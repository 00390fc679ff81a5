//! Picking a chat wrapper for a model.
//!
//! [`resolve_chat_wrapper`] walks a fixed list of tiers and returns the
//! first wrapper any tier produces:
//!
//! 1. a forced wrapper type,
//! 2. a specialized wrapper whose output is equivalent to the embedded Jinja
//!    template under one of its probes (see [`equivalence`]),
//! 3. a Jinja wrapper built from the embedded template,
//! 4. the model's lineage names,
//! 5. well-known markers inside the embedded template,
//! 6. the model file name,
//! 7. the BOS string,
//! 8. the architecture.
//!
//! Tier 2 tries wrapper types ranked by how well their names match the
//! model name and file name; within a type, probes are tried in declared
//! order and the first equivalent one wins.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::tokenizer::Tokenizer;
use crate::wrapper::{
    AlpacaChatWrapper, AlpacaChatWrapperOptions, BuiltinChatWrapper, ChatMlChatWrapper, ChatWrapper,
    DeepSeekChatWrapper, DeepSeekChatWrapperOptions, FalconChatWrapper, FalconChatWrapperOptions, GemmaChatWrapper,
    GeneralChatWrapper, GeneralChatWrapperOptions, JinjaTemplateChatWrapper, JinjaTemplateChatWrapperOptions,
    Llama2ChatWrapper, Llama2ChatWrapperOptions, Llama3ChatWrapper, Llama3ChatWrapperOptions,
    Llama3_2LightweightChatWrapper, Llama3_2LightweightChatWrapperOptions, MistralChatWrapper,
    MistralChatWrapperOptions, ModelCompatibility, Probe, QwenChatWrapper, QwenChatWrapperOptions, SeedChatWrapper,
    SeedChatWrapperOptions, TemplateChatWrapper, TemplateChatWrapperOptions,
};

pub mod equivalence;
pub mod filename;

pub use equivalence::is_jinja_template_equivalent;
pub use filename::{parse_model_file_name, ParsedModelFileName};

// =============================================================================
// Model information
// =============================================================================

/// The model metadata the resolver and wrapper compatibility checks read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelFileInfo {
    pub architecture: Option<String>,
    pub chat_template: Option<String>,
    pub name: Option<String>,
    pub basename: Option<String>,
    /// e.g. `1B`, `8x7B`
    pub size_label: Option<String>,
    pub base_model_names: Vec<String>,
}

impl ModelFileInfo {
    /// Read the fields from GGUF metadata in its nested JSON form
    /// (`{"general": {"name": ...}, "tokenizer": {"chat_template": ...}}`).
    pub fn from_gguf_metadata(metadata: &Value) -> Self {
        let general = &metadata["general"];
        let string = |value: &Value| value.as_str().map(str::to_string);

        let base_model = &general["base_model"];
        let count = base_model["count"].as_u64().unwrap_or(0);
        let base_model_names = (0..count)
            .filter_map(|i| string(&base_model[i.to_string()]["name"]))
            .collect();

        Self {
            architecture: string(&general["architecture"]),
            chat_template: string(&metadata["tokenizer"]["chat_template"]),
            name: string(&general["name"]),
            basename: string(&general["basename"]),
            size_label: string(&general["size_label"]),
            base_model_names,
        }
    }

    /// Name groups from the model itself down to its base models.
    pub fn lineage_names(&self) -> Vec<Vec<&str>> {
        let mut lineage = Vec::new();
        let own: Vec<&str> = [self.name.as_deref(), self.basename.as_deref()].into_iter().flatten().collect();
        if !own.is_empty() {
            lineage.push(own);
        }
        lineage.extend(self.base_model_names.iter().map(|name| vec![name.as_str()]));
        lineage
    }

    /// Whether any lineage name contains any of `patterns`, ignoring case.
    pub fn lineage_includes(&self, patterns: &[&str]) -> bool {
        self.lineage_names().iter().any(|names| includes_text(names, patterns))
    }
}

fn includes_text(names: &[&str], patterns: &[&str]) -> bool {
    names.iter().any(|name| {
        let name = name.to_lowercase();
        patterns.iter().any(|pattern| name.contains(&pattern.to_lowercase()))
    })
}

// =============================================================================
// Wrapper types
// =============================================================================

/// Resolvable wrapper type names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WrapperType {
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "general")]
    General,
    #[serde(rename = "llama3.2-lightweight")]
    Llama3_2Lightweight,
    #[serde(rename = "llama3")]
    Llama3,
    #[serde(rename = "llama2Chat")]
    Llama2,
    #[serde(rename = "mistral")]
    Mistral,
    #[serde(rename = "alpacaChat")]
    Alpaca,
    #[serde(rename = "chatML")]
    ChatMl,
    #[serde(rename = "falconChat")]
    Falcon,
    #[serde(rename = "gemma")]
    Gemma,
    #[serde(rename = "qwen")]
    Qwen,
    #[serde(rename = "deepSeek")]
    DeepSeek,
    #[serde(rename = "seed")]
    Seed,
    #[serde(rename = "template")]
    Template,
    #[serde(rename = "jinjaTemplate")]
    JinjaTemplate,
}

impl WrapperType {
    /// Types with a native renderer, in tie-break order for tier 2. Families
    /// built on ChatML come before the generic ChatML wrapper.
    pub const SPECIALIZED: [WrapperType; 12] = [
        WrapperType::General,
        WrapperType::DeepSeek,
        WrapperType::Qwen,
        WrapperType::Seed,
        WrapperType::Llama3_2Lightweight,
        WrapperType::Llama3,
        WrapperType::Llama2,
        WrapperType::Mistral,
        WrapperType::Alpaca,
        WrapperType::ChatMl,
        WrapperType::Falcon,
        WrapperType::Gemma,
    ];

    pub const ALL: [WrapperType; 15] = [
        WrapperType::Auto,
        WrapperType::General,
        WrapperType::Llama3_2Lightweight,
        WrapperType::Llama3,
        WrapperType::Llama2,
        WrapperType::Mistral,
        WrapperType::Alpaca,
        WrapperType::ChatMl,
        WrapperType::Falcon,
        WrapperType::Gemma,
        WrapperType::Qwen,
        WrapperType::DeepSeek,
        WrapperType::Seed,
        WrapperType::Template,
        WrapperType::JinjaTemplate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WrapperType::Auto => "auto",
            WrapperType::General => "general",
            WrapperType::Llama3_2Lightweight => "llama3.2-lightweight",
            WrapperType::Llama3 => "llama3",
            WrapperType::Llama2 => "llama2Chat",
            WrapperType::Mistral => "mistral",
            WrapperType::Alpaca => "alpacaChat",
            WrapperType::ChatMl => "chatML",
            WrapperType::Falcon => "falconChat",
            WrapperType::Gemma => "gemma",
            WrapperType::Qwen => "qwen",
            WrapperType::DeepSeek => "deepSeek",
            WrapperType::Seed => "seed",
            WrapperType::Template => "template",
            WrapperType::JinjaTemplate => "jinjaTemplate",
        }
    }

    pub fn is_specialized(&self) -> bool {
        Self::SPECIALIZED.contains(self)
    }
}

impl fmt::Display for WrapperType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WrapperType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match WrapperType::ALL.iter().find(|ty| ty.as_str() == s) {
            Some(ty) => Ok(*ty),
            None => bail!("Unknown chat wrapper type \"{s}\""),
        }
    }
}

/// Per-type options used whenever the resolver builds that wrapper type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomWrapperSettings {
    pub general: Option<GeneralChatWrapperOptions>,
    #[serde(rename = "llama3.2-lightweight")]
    pub llama3_2_lightweight: Option<Llama3_2LightweightChatWrapperOptions>,
    pub llama3: Option<Llama3ChatWrapperOptions>,
    #[serde(rename = "llama2Chat")]
    pub llama2: Option<Llama2ChatWrapperOptions>,
    pub mistral: Option<MistralChatWrapperOptions>,
    #[serde(rename = "alpacaChat")]
    pub alpaca: Option<AlpacaChatWrapperOptions>,
    #[serde(rename = "falconChat")]
    pub falcon: Option<FalconChatWrapperOptions>,
    pub qwen: Option<QwenChatWrapperOptions>,
    #[serde(rename = "deepSeek")]
    pub deep_seek: Option<DeepSeekChatWrapperOptions>,
    pub seed: Option<SeedChatWrapperOptions>,
    pub template: Option<TemplateChatWrapperOptions>,
    #[serde(rename = "jinjaTemplate")]
    pub jinja_template: Option<JinjaTemplateChatWrapperOptions>,
}

// =============================================================================
// Resolution
// =============================================================================

pub struct ResolveOptions<'a> {
    /// `Auto` runs every tier; anything else is tried first.
    pub wrapper_type: WrapperType,
    pub bos_string: Option<&'a str>,
    pub filename: Option<&'a str>,
    pub file_info: Option<&'a ModelFileInfo>,
    pub tokenizer: Option<&'a dyn Tokenizer>,
    pub custom_wrapper_settings: CustomWrapperSettings,
    pub warning_logs: bool,
    /// When false, a Jinja template that fails to build is an error instead
    /// of a reason to try the next tier.
    pub fallback_to_other_wrappers_on_jinja_error: bool,
    /// Never resolve to a Jinja wrapper unless it is the forced type.
    pub no_jinja: bool,
}

impl Default for ResolveOptions<'_> {
    fn default() -> Self {
        Self {
            wrapper_type: WrapperType::Auto,
            bos_string: None,
            filename: None,
            file_info: None,
            tokenizer: None,
            custom_wrapper_settings: CustomWrapperSettings::default(),
            warning_logs: true,
            fallback_to_other_wrappers_on_jinja_error: true,
            no_jinja: false,
        }
    }
}

impl<'a> ResolveOptions<'a> {
    pub fn with_file_info(mut self, file_info: &'a ModelFileInfo) -> Self {
        self.file_info = Some(file_info);
        self
    }

    pub fn with_filename(mut self, filename: &'a str) -> Self {
        self.filename = Some(filename);
        self
    }

    pub fn with_bos_string(mut self, bos_string: &'a str) -> Self {
        self.bos_string = Some(bos_string);
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: &'a dyn Tokenizer) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    fn compatibility(&self) -> ModelCompatibility<'a> {
        ModelCompatibility {
            tokenizer: self.tokenizer,
            file_info: self.file_info,
        }
    }

    /// The custom Jinja template if set, else the embedded one.
    fn jinja_template(&self) -> Option<&str> {
        self.custom_wrapper_settings
            .jinja_template
            .as_ref()
            .map(|options| options.template.as_str())
            .filter(|template| !template.is_empty())
            .or_else(|| self.file_info.and_then(|info| info.chat_template.as_deref()))
    }
}

/// Pick the wrapper that best fits the model, or `None` when nothing
/// points at a format.
pub fn resolve_chat_wrapper(options: &ResolveOptions<'_>) -> Result<Option<BuiltinChatWrapper>> {
    if let Some(wrapper) = resolve_forced_type(options)? {
        return Ok(Some(wrapper));
    }

    let custom = &options.custom_wrapper_settings;
    let jinja_template = options.jinja_template().filter(|template| !template.trim().is_empty());

    if let Some(template) = jinja_template {
        let mut jinja_options = custom.jinja_template.clone().unwrap_or_default();
        jinja_options.template = template.to_string();

        let compat = options.compatibility();
        for wrapper_type in rank_by_name_match(options.filename, options.file_info) {
            if !is_compatible(wrapper_type, &compat) {
                continue;
            }
            if let Some(wrapper) = match_specialized(wrapper_type, custom, &jinja_options, options.tokenizer) {
                debug!(wrapper = wrapper_type.as_str(), "chat wrapper is equivalent to the Jinja template");
                return Ok(Some(wrapper));
            }
        }

        if !options.no_jinja {
            match JinjaTemplateChatWrapper::new(jinja_options) {
                Ok(wrapper) => return Ok(Some(wrapper.into())),
                Err(err) if options.fallback_to_other_wrappers_on_jinja_error => {
                    if options.warning_logs {
                        error!("Error creating Jinja template chat wrapper. Falling back to resolve other chat wrappers. Error: {err:#}");
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    Ok(resolve_by_model_details(options, jinja_template))
}

fn resolve_forced_type(options: &ResolveOptions<'_>) -> Result<Option<BuiltinChatWrapper>> {
    let custom = &options.custom_wrapper_settings;
    match options.wrapper_type {
        WrapperType::Auto => Ok(None),
        WrapperType::Template => match &custom.template {
            Some(template) => Ok(Some(TemplateChatWrapper::new(template.clone())?.into())),
            None => {
                if options.warning_logs {
                    warn!("Template chat wrapper settings must have a template and a history template. Falling back to resolve other chat wrapper types.");
                }
                Ok(None)
            }
        },
        WrapperType::JinjaTemplate => {
            let Some(template) = options.jinja_template() else {
                if options.warning_logs {
                    warn!("Jinja template chat wrapper received no template. Falling back to resolve other chat wrapper types.");
                }
                return Ok(None);
            };
            let mut jinja_options = custom.jinja_template.clone().unwrap_or_default();
            jinja_options.template = template.to_string();
            match JinjaTemplateChatWrapper::new(jinja_options) {
                Ok(wrapper) => Ok(Some(wrapper.into())),
                Err(err) if options.fallback_to_other_wrappers_on_jinja_error => {
                    if options.warning_logs {
                        error!("Error creating Jinja template chat wrapper. Falling back to resolve other chat wrappers. Error: {err:#}");
                    }
                    Ok(None)
                }
                Err(err) => Err(err),
            }
        }
        specialized => Ok(Some(create_specialized(specialized, custom))),
    }
}

/// Tiers 4 to 8.
fn resolve_by_model_details(options: &ResolveOptions<'_>, jinja_template: Option<&str>) -> Option<BuiltinChatWrapper> {
    let custom = &options.custom_wrapper_settings;
    let create = |wrapper_type| Some(create_specialized(wrapper_type, custom));
    let compat = options.compatibility();

    if let Some(info) = options.file_info {
        for names in info.lineage_names() {
            if includes_text(&names, &["llama 3.2", "llama-3.2", "llama3.2"])
                && Llama3_2LightweightChatWrapper::check_model_compatibility(&compat)
            {
                return create(WrapperType::Llama3_2Lightweight);
            } else if includes_text(&names, &["llama 3", "llama-3", "llama3"]) {
                return create(WrapperType::Llama3);
            } else if includes_text(&names, &["Mistral", "Mistral Large", "Mistral-Large", "Codestral"]) {
                return create(WrapperType::Mistral);
            } else if includes_text(&names, &["Gemma", "Gemma 2"]) {
                return create(WrapperType::Gemma);
            }
        }
    }

    if let Some(template) = jinja_template {
        if template.contains("<|im_start|>") {
            return create(WrapperType::ChatMl);
        } else if template.contains("[INST]") {
            let llama2 = custom.llama2.clone().unwrap_or(Llama2ChatWrapperOptions {
                add_space_before_eos: template.contains("' ' + eos_token"),
            });
            return Some(Llama2ChatWrapper::new(llama2).into());
        } else if template.contains("<|start_header_id|>") && template.contains("<|end_header_id|>") {
            return create(WrapperType::Llama3);
        } else if template.contains("<start_of_turn>") {
            return create(WrapperType::Gemma);
        }
    }

    if let Some(wrapper_type) = options.filename.and_then(wrapper_type_from_file_name) {
        return create(wrapper_type);
    }

    if let Some(bos) = options.bos_string.filter(|bos| !bos.is_empty()) {
        if "<s>[INST] <<SYS>>\n".starts_with(bos) {
            return create(WrapperType::Llama2);
        } else if "<|im_start|>system\n".starts_with(bos) {
            return create(WrapperType::ChatMl);
        }
    }

    match options.file_info.and_then(|info| info.architecture.as_deref()) {
        Some("llama") => create(WrapperType::General),
        Some("falcon") => create(WrapperType::Falcon),
        Some("gemma") | Some("gemma2") => create(WrapperType::Gemma),
        _ => None,
    }
}

fn wrapper_type_from_file_name(filename: &str) -> Option<WrapperType> {
    let parsed = parse_model_file_name(filename);
    if !parsed.file_type.as_deref().is_some_and(|file_type| file_type.eq_ignore_ascii_case("gguf")) {
        return None;
    }

    let name = parsed.name.as_deref().map(str::to_lowercase).unwrap_or_default();
    let sub_type = parsed.sub_type.to_lowercase();
    let split_sub_type: Vec<String> = sub_type
        .split('-')
        .map(str::to_string)
        .chain(parsed.other_info.iter().map(|info| info.to_lowercase()))
        .collect();
    let first = split_sub_type.first().map(String::as_str);
    let has = |part: &str| split_sub_type.iter().any(|p| p == part);

    let wrapper_type = match name.as_str() {
        "llama" if has("chat") => WrapperType::Llama2,
        "llama" | "codellama" | "mistral" => WrapperType::General,
        "yarn" if first == Some("llama") => WrapperType::Llama2,
        "orca" => WrapperType::ChatMl,
        "phind" if sub_type == "codellama" => WrapperType::Llama2,
        _ if first == Some("llama") => WrapperType::Llama2,
        _ if sub_type == "alpaca" => WrapperType::Alpaca,
        "dolphin" if has("mistral") => WrapperType::ChatMl,
        "gemma" => WrapperType::Gemma,
        _ if has("chatml") => WrapperType::ChatMl,
        _ => return None,
    };
    Some(wrapper_type)
}

/// Specialized types, best name match against the model name (weighted
/// higher) and the file name first. Ties keep declaration order.
fn rank_by_name_match(filename: Option<&str>, file_info: Option<&ModelFileInfo>) -> Vec<WrapperType> {
    fn points(pattern: &str, text: Option<&str>, exists: f64, position: f64) -> f64 {
        let Some(text) = text else { return 0.0 };
        match text.to_lowercase().find(&pattern.to_lowercase()) {
            Some(index) => exists + ((index + 1) as f64 / text.len() as f64) * position,
            None => 0.0,
        }
    }

    let model_name = file_info.and_then(|info| info.name.as_deref());
    let score = |wrapper_type: &WrapperType| {
        points(wrapper_type.as_str(), model_name, 3.0, 4.0) + points(wrapper_type.as_str(), filename, 2.0, 3.0)
    };

    let mut ranked: Vec<(WrapperType, f64)> = WrapperType::SPECIALIZED.iter().map(|ty| (*ty, score(ty))).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.into_iter().map(|(ty, _)| ty).collect()
}

fn is_compatible(wrapper_type: WrapperType, compat: &ModelCompatibility<'_>) -> bool {
    match wrapper_type {
        WrapperType::Llama3_2Lightweight => Llama3_2LightweightChatWrapper::check_model_compatibility(compat),
        WrapperType::Qwen => QwenChatWrapper::check_model_compatibility(compat),
        _ => true,
    }
}

/// Build a specialized wrapper from the custom settings or defaults.
fn create_specialized(wrapper_type: WrapperType, custom: &CustomWrapperSettings) -> BuiltinChatWrapper {
    match wrapper_type {
        WrapperType::Llama3_2Lightweight => Llama3_2LightweightChatWrapper::new(custom_or_default(&custom.llama3_2_lightweight)).into(),
        WrapperType::Llama3 => Llama3ChatWrapper::new(custom_or_default(&custom.llama3)).into(),
        WrapperType::Llama2 => Llama2ChatWrapper::new(custom_or_default(&custom.llama2)).into(),
        WrapperType::Mistral => MistralChatWrapper::new(custom_or_default(&custom.mistral)).into(),
        WrapperType::Alpaca => AlpacaChatWrapper::new(custom_or_default(&custom.alpaca)).into(),
        WrapperType::ChatMl => ChatMlChatWrapper::new().into(),
        WrapperType::Falcon => FalconChatWrapper::new(custom_or_default(&custom.falcon)).into(),
        WrapperType::Gemma => GemmaChatWrapper::new().into(),
        WrapperType::Qwen => QwenChatWrapper::new(custom_or_default(&custom.qwen)).into(),
        WrapperType::DeepSeek => DeepSeekChatWrapper::new(custom_or_default(&custom.deep_seek)).into(),
        WrapperType::Seed => SeedChatWrapper::new(custom_or_default(&custom.seed)).into(),
        WrapperType::General | WrapperType::Auto | WrapperType::Template | WrapperType::JinjaTemplate => {
            GeneralChatWrapper::new(custom_or_default(&custom.general)).into()
        }
    }
}

fn custom_or_default<O: Clone + Default>(custom: &Option<O>) -> O {
    custom.clone().unwrap_or_default()
}

/// Try each probe of `wrapper_type` against the Jinja template.
fn match_specialized(
    wrapper_type: WrapperType,
    custom: &CustomWrapperSettings,
    jinja_options: &JinjaTemplateChatWrapperOptions,
    tokenizer: Option<&dyn Tokenizer>,
) -> Option<BuiltinChatWrapper> {
    let search = ProbeSearch { jinja_options, tokenizer };

    match wrapper_type {
        WrapperType::General => search
            .first_match(custom_or_default(&custom.general), GeneralChatWrapper::probes(), GeneralChatWrapper::new)
            .map(Into::into),
        WrapperType::Llama3_2Lightweight => search
            .first_match(
                custom_or_default(&custom.llama3_2_lightweight),
                Llama3_2LightweightChatWrapper::probes(),
                Llama3_2LightweightChatWrapper::new,
            )
            .map(Into::into),
        WrapperType::Llama3 => search
            .first_match(custom_or_default(&custom.llama3), Llama3ChatWrapper::probes(), Llama3ChatWrapper::new)
            .map(Into::into),
        WrapperType::Llama2 => search
            .first_match(custom_or_default(&custom.llama2), Llama2ChatWrapper::probes(), Llama2ChatWrapper::new)
            .map(Into::into),
        WrapperType::Mistral => search
            .first_match(custom_or_default(&custom.mistral), MistralChatWrapper::probes(), MistralChatWrapper::new)
            .map(Into::into),
        WrapperType::Alpaca => search
            .first_match(custom_or_default(&custom.alpaca), AlpacaChatWrapper::probes(), AlpacaChatWrapper::new)
            .map(Into::into),
        WrapperType::ChatMl => search
            .first_match((), ChatMlChatWrapper::probes(), |()| ChatMlChatWrapper::new())
            .map(Into::into),
        WrapperType::Falcon => search
            .first_match(custom_or_default(&custom.falcon), FalconChatWrapper::probes(), FalconChatWrapper::new)
            .map(Into::into),
        WrapperType::Gemma => search
            .first_match((), GemmaChatWrapper::probes(), |()| GemmaChatWrapper::new())
            .map(Into::into),
        WrapperType::Qwen => search
            .first_match(custom_or_default(&custom.qwen), QwenChatWrapper::probes(), QwenChatWrapper::new)
            .map(Into::into),
        WrapperType::DeepSeek => search
            .first_match(custom_or_default(&custom.deep_seek), DeepSeekChatWrapper::probes(), DeepSeekChatWrapper::new)
            .map(Into::into),
        WrapperType::Seed => search
            .first_match(custom_or_default(&custom.seed), SeedChatWrapper::probes(), SeedChatWrapper::new)
            .map(Into::into),
        WrapperType::Auto | WrapperType::Template | WrapperType::JinjaTemplate => None,
    }
}

fn renders_tools(jinja_options: &JinjaTemplateChatWrapperOptions) -> bool {
    JinjaTemplateChatWrapper::new(jinja_options.clone()).is_ok_and(|wrapper| wrapper.renders_tools())
}

struct ProbeSearch<'a> {
    jinja_options: &'a JinjaTemplateChatWrapperOptions,
    tokenizer: Option<&'a dyn Tokenizer>,
}

impl ProbeSearch<'_> {
    /// Build with each probe's test options; on the first equivalent one,
    /// build again with its apply options. No probes means one probe that
    /// keeps `base` as is.
    fn first_match<O, W>(&self, base: O, probes: Vec<Probe<O>>, build: impl Fn(O) -> W) -> Option<W>
    where
        O: Clone,
        W: ChatWrapper,
    {
        let probes = if probes.is_empty() { vec![Probe::same(crate::wrapper::keep)] } else { probes };

        for (i, probe) in probes.iter().enumerate() {
            let mut jinja_options = self.jinja_options.clone();
            jinja_options
                .additional_render_parameters
                .extend(probe.jinja_parameters.clone());

            if probe.requires_tool_rendering && !renders_tools(&jinja_options) {
                continue;
            }

            let candidate = build(probe.test_options(&base));

            if is_jinja_template_equivalent(&jinja_options, &candidate, self.tokenizer) {
                debug!(wrapper = candidate.wrapper_name(), probe = i, "probe matched");
                return Some(build(probe.apply_options(&base)));
            }
        }
        None
    }
}
