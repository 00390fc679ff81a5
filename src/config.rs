//! Resolver configuration file.
//!
//! ```toml
//! type = "auto"
//! no_jinja = false
//!
//! [custom_wrapper_settings.llama2Chat]
//! addSpaceBeforeEos = true
//! ```

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::resolve::{CustomWrapperSettings, ResolveOptions, WrapperType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    #[serde(rename = "type")]
    pub wrapper_type: WrapperType,
    pub warning_logs: bool,
    pub fallback_to_other_wrappers_on_jinja_error: bool,
    pub no_jinja: bool,
    pub custom_wrapper_settings: CustomWrapperSettings,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            wrapper_type: WrapperType::Auto,
            warning_logs: true,
            fallback_to_other_wrappers_on_jinja_error: true,
            no_jinja: false,
            custom_wrapper_settings: CustomWrapperSettings::default(),
        }
    }
}

impl ResolverConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| anyhow!("Failed to parse resolver config TOML: {}", e))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read resolver config at '{}'", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid resolver config at '{}'", path.display()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| anyhow!("Failed to serialize resolver config: {}", e))
    }

    /// Resolver options carrying this configuration. Model details are
    /// added by the caller.
    pub fn resolve_options<'a>(&self) -> ResolveOptions<'a> {
        ResolveOptions {
            wrapper_type: self.wrapper_type,
            custom_wrapper_settings: self.custom_wrapper_settings.clone(),
            warning_logs: self.warning_logs,
            fallback_to_other_wrappers_on_jinja_error: self.fallback_to_other_wrappers_on_jinja_error,
            no_jinja: self.no_jinja,
            ..Default::default()
        }
    }
}
