//! Daemon configuration: TOML file layered with `LIVESIFT_*` environment
//! overrides, translated into a [`Catalog`] of command-backed sources.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use livesift_source::{Catalog, LineFormat, MatchWeights, Matcher, Registration};
use livesift_source_command::{
    CommandLine, CommandSource, DEFAULT_DISCOVER_TIMEOUT, DEFAULT_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub matching: MatchWeights,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// One `[[sources]]` entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub name: String,

    /// Query prefix that routes to this source only (e.g. "wifi ").
    #[serde(default)]
    pub trigger: Option<String>,

    #[serde(default)]
    pub icon: Option<String>,

    pub list: String,

    #[serde(default)]
    pub discover: Vec<String>,

    #[serde(default)]
    pub activate: Option<String>,

    #[serde(default)]
    pub deactivate: Option<String>,

    #[serde(default)]
    pub activate_label: Option<String>,

    #[serde(default)]
    pub deactivate_label: Option<String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_discover_timeout_ms")]
    pub discover_timeout_ms: u64,

    pub format: LineFormat,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}
fn default_discover_timeout_ms() -> u64 {
    DEFAULT_DISCOVER_TIMEOUT.as_millis() as u64
}

/// `$XDG_CONFIG_HOME/livesift/config.toml`, whether or not it exists.
pub fn default_path() -> Option<PathBuf> {
    xdg::BaseDirectories::with_prefix("livesift")
        .ok()
        .map(|dirs| dirs.get_config_file("config.toml"))
}

/// Loads and validates configuration. A missing file yields the defaults
/// (no sources).
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(Config::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    let config: Config = figment
        .merge(Env::prefixed("LIVESIFT_").split("__"))
        .extract()?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.catalog().map(drop)
    }

    /// Builds the sources this config describes.
    pub fn catalog(&self) -> Result<Catalog, ConfigError> {
        self.matching
            .validate()
            .map_err(|reason| invalid("matching", reason))?;

        let mut seen = HashSet::new();
        let mut sources = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(invalid("sources.name", "must not be empty"));
            }
            if source.name.contains("::") {
                return Err(invalid(
                    format!("sources.{}.name", source.name),
                    "must not contain '::'",
                ));
            }
            if !seen.insert(source.name.as_str()) {
                return Err(invalid(
                    format!("sources.{}.name", source.name),
                    "duplicate source name",
                ));
            }
            sources.push(source.registration()?);
        }

        Ok(Catalog {
            sources,
            matcher: Matcher::new(self.matching),
        })
    }
}

impl SourceConfig {
    fn field(&self, key: &str) -> String {
        format!("sources.{}.{key}", self.name)
    }

    fn command(&self, key: &str, line: &str) -> Result<CommandLine, ConfigError> {
        CommandLine::parse(line)
            .ok_or_else(|| invalid(self.field(key), "empty command or unbalanced quotes"))
    }

    fn registration(&self) -> Result<Registration, ConfigError> {
        if self.timeout_ms == 0 {
            return Err(invalid(self.field("timeout_ms"), "must be positive"));
        }
        if self.discover_timeout_ms == 0 {
            return Err(invalid(self.field("discover_timeout_ms"), "must be positive"));
        }
        match &self.format {
            LineFormat::Delimited { separator, .. } if *separator == '\\' => {
                return Err(invalid(
                    self.field("format.separator"),
                    "backslash is the escape character",
                ));
            }
            LineFormat::Json { id, name, .. } if id.is_empty() || name.is_empty() => {
                return Err(invalid(
                    self.field("format"),
                    "id and name selectors must not be empty",
                ));
            }
            _ => {}
        }

        let discover = self
            .discover
            .iter()
            .map(|line| self.command("discover", line))
            .collect::<Result<Vec<_>, _>>()?;

        let mut source = CommandSource::new(&self.name, self.command("list", &self.list)?)
            .with_discover(discover)
            .with_timeouts(
                Duration::from_millis(self.timeout_ms),
                Duration::from_millis(self.discover_timeout_ms),
            );
        if let Some(icon) = &self.icon {
            source = source.with_icon(icon);
        }
        if let Some(line) = &self.activate {
            let command = self.command("activate", line)?;
            source = source.with_activate(command, self.activate_label.clone());
        }
        if let Some(line) = &self.deactivate {
            let command = self.command("deactivate", line)?;
            source = source.with_deactivate(command, self.deactivate_label.clone());
        }

        let registration = Registration::new(Arc::new(source), self.format.clone());
        Ok(match &self.trigger {
            Some(trigger) if trigger.is_empty() => {
                return Err(invalid(self.field("trigger"), "must not be empty"));
            }
            Some(trigger) => registration.with_trigger(trigger),
            None => registration,
        })
    }
}
