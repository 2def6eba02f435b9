use crate::Result;
use anyhow::{anyhow, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing_subscriber::filter::Directive;

const DEFAULT_LEVEL: &str = "info";

/// Resolved logging configuration after reading the config file and env
/// overrides.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub default_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_level: DEFAULT_LEVEL.to_string(),
        }
    }
}

impl LoggingConfig {
    /// Load configuration with deterministic precedence: defaults, then
    /// `runtool.toml` in the working directory, then `RUNTOOL_LOG`.
    pub fn load(working_directory: Option<&Path>) -> Result<Self> {
        let mut config = LoggingConfig::default();
        if let Some(directory) = working_directory {
            if let Some(file_config) = Self::load_from_file(&directory.join("runtool.toml"))? {
                config.apply(file_config);
            }
        }
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Option<TomlConfig>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let parsed: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(Some(parsed))
    }

    fn apply(&mut self, toml: TomlConfig) {
        if let Some(logging) = toml.logging {
            if let Some(default_level) = logging.default_level {
                self.default_level = default_level;
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(level) = env::var("RUNTOOL_LOG") {
            if !level.trim().is_empty() {
                self.default_level = level;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        // Directive::from_str is lenient enough to accept free text with
        // embedded spaces as a target name, so rule that out first.
        let level = self.default_level.trim();
        if level.is_empty() || level.chars().any(char::is_whitespace) {
            return Err(anyhow!(
                "logging.default_level must be a single tracing directive, got {:?}",
                self.default_level
            ));
        }
        Directive::from_str(level)
            .map_err(|_| anyhow!("logging.default_level must be a valid tracing directive"))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TomlConfig {
    pub logging: Option<TomlLoggingSection>,
}

#[derive(Debug, Deserialize)]
struct TomlLoggingSection {
    pub default_level: Option<String>,
}
