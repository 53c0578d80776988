use crate::schema::{AuthConfig, ServerConfig};
use crate::Config;
use anyhow::{Context, Result};
use jsonc_parser::{parse_to_serde_value, ParseOptions};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub struct ConfigLoader {
    config: Config,
    config_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            config_paths: Vec::new(),
        }
    }

    pub fn load_from_str(&mut self, content: &str) -> Result<()> {
        let content = substitute_env_vars(content);
        let config = parse_jsonc(&content).with_context(|| "Failed to parse config content")?;
        self.config.merge(config);
        Ok(())
    }

    /// Missing files are skipped silently.
    pub fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let content = substitute_env_vars(&content);
        let config = parse_jsonc(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        tracing::debug!(path = %path.display(), "loaded config file");
        self.config.merge(config);
        self.config_paths.push(path.to_path_buf());
        Ok(())
    }

    pub fn load_global(&mut self) -> Result<()> {
        let global = global_config_path();
        for ext in &["jsonc", "json"] {
            let path = global.with_extension(ext);
            if path.exists() {
                self.load_from_file(&path)?;
                break;
            }
        }
        Ok(())
    }

    pub fn load_from_env(&mut self) -> Result<()> {
        if let Ok(config_path) = env::var("PARLEY_CONFIG") {
            self.load_from_file(&config_path)?;
        }
        self.apply_overrides(|name| env::var(name).ok());
        Ok(())
    }

    /// Single-value overrides (`PARLEY_API_URL`, `PARLEY_WS_URL`,
    /// `PARLEY_TOKEN`). Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let api_url = get("PARLEY_API_URL");
        let ws_url = get("PARLEY_WS_URL");
        if api_url.is_some() || ws_url.is_some() {
            self.config.merge(Config {
                server: Some(ServerConfig {
                    api_url,
                    ws_url,
                    request_timeout_ms: None,
                }),
                ..Default::default()
            });
        }

        if let Some(token) = get("PARLEY_TOKEN") {
            self.config.merge(Config {
                auth: Some(AuthConfig { token: Some(token) }),
                ..Default::default()
            });
        }
    }

    /// Merge order: global file, then an explicit file (`--config`), then
    /// `PARLEY_CONFIG` and the single-value environment overrides.
    pub fn load_all(&mut self, explicit: Option<&Path>) -> Result<Config> {
        self.load_global()?;
        if let Some(path) = explicit {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            self.load_from_file(path)?;
        }
        self.load_from_env()?;
        Ok(self.config.clone())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_paths(&self) -> &[PathBuf] {
        &self.config_paths
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// `<config dir>/parley/parley` without extension.
pub fn global_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("parley/parley")
}

/// Substitute `{env:VAR}` patterns with environment variable values.
fn substitute_env_vars(text: &str) -> String {
    let re = regex::Regex::new(r"\{env:([^}]+)\}").expect("static pattern");
    re.replace_all(text, |caps: &regex::Captures| {
        env::var(caps[1].trim()).unwrap_or_default()
    })
    .to_string()
}

fn parse_jsonc(content: &str) -> Result<Config> {
    let parse_options = ParseOptions {
        allow_trailing_commas: true,
        ..Default::default()
    };
    let parsed = parse_to_serde_value(content, &parse_options)
        .with_context(|| "Failed to parse JSONC")?
        .context("Config content is empty")?;
    serde_json::from_value(parsed).with_context(|| "Failed to parse config JSON")
}
