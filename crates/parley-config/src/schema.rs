use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_WS_URL: &str = "ws://localhost:8000/api/chat";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 10_000;
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RESYNC_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_RESYNC_MAX_POLLS: u32 = 20;
pub const DEFAULT_NOTIFICATION_TTL_MS: u64 = 3_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {field} `{value}`: {reason}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("reconnect.maxDelayMs ({max}) is below reconnect.baseDelayMs ({base})")]
    BackoffRange { base: u64, max: u64 },
}

/// On-disk configuration. Every field is optional; `resolve` fills defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(rename = "$schema", skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<ReconnectConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resync: Option<ResyncConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notifications: Option<NotificationConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(rename = "apiUrl", alias = "api_url", skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(rename = "wsUrl", alias = "ws_url", skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
    #[serde(
        rename = "requestTimeoutMs",
        alias = "request_timeout_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReconnectConfig {
    #[serde(rename = "baseDelayMs", alias = "base_delay_ms", skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
    #[serde(rename = "maxDelayMs", alias = "max_delay_ms", skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(rename = "maxAttempts", alias = "max_attempts", skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResyncConfig {
    #[serde(rename = "intervalMs", alias = "interval_ms", skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(rename = "maxPolls", alias = "max_polls", skip_serializing_if = "Option::is_none")]
    pub max_polls: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationConfig {
    #[serde(rename = "ttlMs", alias = "ttl_ms", skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

trait DeepMerge {
    fn deep_merge(&mut self, other: Self);
}

fn merge_option_replace<T>(target: &mut Option<T>, source: Option<T>) {
    if let Some(value) = source {
        *target = Some(value);
    }
}

fn merge_option_deep<T: DeepMerge>(target: &mut Option<T>, source: Option<T>) {
    if let Some(source_value) = source {
        if let Some(target_value) = target {
            target_value.deep_merge(source_value);
        } else {
            *target = Some(source_value);
        }
    }
}

impl DeepMerge for ServerConfig {
    fn deep_merge(&mut self, other: Self) {
        merge_option_replace(&mut self.api_url, other.api_url);
        merge_option_replace(&mut self.ws_url, other.ws_url);
        merge_option_replace(&mut self.request_timeout_ms, other.request_timeout_ms);
    }
}

impl DeepMerge for AuthConfig {
    fn deep_merge(&mut self, other: Self) {
        merge_option_replace(&mut self.token, other.token);
    }
}

impl DeepMerge for ReconnectConfig {
    fn deep_merge(&mut self, other: Self) {
        merge_option_replace(&mut self.base_delay_ms, other.base_delay_ms);
        merge_option_replace(&mut self.max_delay_ms, other.max_delay_ms);
        merge_option_replace(&mut self.max_attempts, other.max_attempts);
    }
}

impl DeepMerge for ResyncConfig {
    fn deep_merge(&mut self, other: Self) {
        merge_option_replace(&mut self.interval_ms, other.interval_ms);
        merge_option_replace(&mut self.max_polls, other.max_polls);
    }
}

impl DeepMerge for NotificationConfig {
    fn deep_merge(&mut self, other: Self) {
        merge_option_replace(&mut self.ttl_ms, other.ttl_ms);
    }
}

impl DeepMerge for LogConfig {
    fn deep_merge(&mut self, other: Self) {
        merge_option_replace(&mut self.level, other.level);
        merge_option_replace(&mut self.dir, other.dir);
    }
}

impl Config {
    /// Later sources win field by field.
    pub fn merge(&mut self, other: Config) {
        merge_option_replace(&mut self.schema, other.schema);
        merge_option_deep(&mut self.server, other.server);
        merge_option_deep(&mut self.auth, other.auth);
        merge_option_deep(&mut self.reconnect, other.reconnect);
        merge_option_deep(&mut self.resync, other.resync);
        merge_option_deep(&mut self.notifications, other.notifications);
        merge_option_deep(&mut self.log, other.log);
    }

    pub fn token(&self) -> Option<&str> {
        self.auth
            .as_ref()
            .and_then(|auth| auth.token.as_deref())
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    pub fn log_level(&self) -> Option<&str> {
        self.log.as_ref().and_then(|log| log.level.as_deref())
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log.as_ref().and_then(|log| log.dir.clone())
    }

    /// Fill defaults and validate.
    pub fn resolve(&self) -> Result<ClientSettings, ConfigError> {
        let server = self.server.clone().unwrap_or_default();
        let api_url = validate_url(
            "server.apiUrl",
            server.api_url.as_deref().unwrap_or(DEFAULT_API_URL),
            &["http", "https"],
        )?;
        let ws_url = validate_url(
            "server.wsUrl",
            server.ws_url.as_deref().unwrap_or(DEFAULT_WS_URL),
            &["ws", "wss"],
        )?;
        let request_timeout_ms = positive(
            "server.requestTimeoutMs",
            server.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
        )?;

        let reconnect = self.reconnect.clone().unwrap_or_default();
        let base = positive(
            "reconnect.baseDelayMs",
            reconnect.base_delay_ms.unwrap_or(DEFAULT_RECONNECT_BASE_DELAY_MS),
        )?;
        let max = reconnect.max_delay_ms.unwrap_or(DEFAULT_RECONNECT_MAX_DELAY_MS);
        if max < base {
            return Err(ConfigError::BackoffRange { base, max });
        }
        let max_attempts = reconnect
            .max_attempts
            .unwrap_or(DEFAULT_RECONNECT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "reconnect.maxAttempts",
            });
        }

        let resync = self.resync.clone().unwrap_or_default();
        let interval = positive(
            "resync.intervalMs",
            resync.interval_ms.unwrap_or(DEFAULT_RESYNC_INTERVAL_MS),
        )?;
        let max_polls = resync.max_polls.unwrap_or(DEFAULT_RESYNC_MAX_POLLS);
        if max_polls == 0 {
            return Err(ConfigError::Zero {
                field: "resync.maxPolls",
            });
        }

        let ttl = self
            .notifications
            .as_ref()
            .and_then(|n| n.ttl_ms)
            .unwrap_or(DEFAULT_NOTIFICATION_TTL_MS);

        Ok(ClientSettings {
            api_url,
            ws_url,
            request_timeout: Duration::from_millis(request_timeout_ms),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(base),
                max_delay: Duration::from_millis(max),
                max_attempts,
            },
            resync: ResyncPolicy {
                interval: Duration::from_millis(interval),
                max_polls,
            },
            notification_ttl: Duration::from_millis(ttl),
        })
    }
}

fn positive(field: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero { field });
    }
    Ok(value)
}

fn validate_url(field: &'static str, raw: &str, schemes: &[&str]) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let parsed = url::Url::parse(trimmed).map_err(|err| ConfigError::InvalidUrl {
        field,
        value: raw.to_string(),
        reason: err.to_string(),
    })?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(ConfigError::InvalidUrl {
            field,
            value: raw.to_string(),
            reason: format!("expected scheme {}", schemes.join(" or ")),
        });
    }
    Ok(trimmed.to_string())
}

/// Backoff knobs for transport reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RECONNECT_MAX_DELAY_MS),
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncPolicy {
    pub interval: Duration,
    pub max_polls: u32,
}

impl Default for ResyncPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_RESYNC_INTERVAL_MS),
            max_polls: DEFAULT_RESYNC_MAX_POLLS,
        }
    }
}

/// Validated settings the client is built from.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub api_url: String,
    pub ws_url: String,
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub resync: ResyncPolicy,
    pub notification_ttl: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            reconnect: ReconnectPolicy::default(),
            resync: ResyncPolicy::default(),
            notification_ttl: Duration::from_millis(DEFAULT_NOTIFICATION_TTL_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_resolves_to_defaults() {
        let settings = Config::default().resolve().unwrap();
        assert_eq!(settings, ClientSettings::default());
    }

    #[test]
    fn merge_replaces_fields_individually() {
        let mut base: Config = serde_json::from_str(
            r#"{"server": {"apiUrl": "http://a/api", "wsUrl": "ws://a/chat"}, "reconnect": {"maxAttempts": 3}}"#,
        )
        .unwrap();
        let overlay: Config =
            serde_json::from_str(r#"{"server": {"apiUrl": "https://b/api/"}}"#).unwrap();
        base.merge(overlay);

        let settings = base.resolve().unwrap();
        assert_eq!(settings.api_url, "https://b/api");
        assert_eq!(settings.ws_url, "ws://a/chat");
        assert_eq!(settings.reconnect.max_attempts, 3);
        assert_eq!(settings.reconnect.base_delay, Duration::from_secs(1));
    }

    #[test]
    fn rejects_inconsistent_values() {
        let bad_scheme: Config =
            serde_json::from_str(r#"{"server": {"wsUrl": "http://a/chat"}}"#).unwrap();
        assert!(matches!(
            bad_scheme.resolve(),
            Err(ConfigError::InvalidUrl { field: "server.wsUrl", .. })
        ));

        let bad_backoff: Config =
            serde_json::from_str(r#"{"reconnect": {"baseDelayMs": 5000, "maxDelayMs": 100}}"#)
                .unwrap();
        assert!(matches!(
            bad_backoff.resolve(),
            Err(ConfigError::BackoffRange { base: 5000, max: 100 })
        ));

        let zero_polls: Config = serde_json::from_str(r#"{"resync": {"maxPolls": 0}}"#).unwrap();
        assert!(matches!(zero_polls.resolve(), Err(ConfigError::Zero { .. })));
    }

    #[test]
    fn blank_token_is_treated_as_absent() {
        let config: Config = serde_json::from_str(r#"{"auth": {"token": "  "}}"#).unwrap();
        assert!(config.token().is_none());
    }
}
