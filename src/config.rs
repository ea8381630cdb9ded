//! Client configuration
//!
//! Service endpoints, timing and the poll retcode policy. Loaded from an
//! optional JSON file, then overridden by `WEBIM_*` environment variables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{ClientError, ProtocolError, RETCODE_SESSION_INVALIDATED};

/// What the poller does with a non-zero retcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "ms")]
pub enum RetcodeAction {
    /// Treat as an empty batch and poll again at once
    Continue,
    /// Treat as an empty batch and wait before polling again
    Backoff(u64),
    /// Stop polling and report the connection as lost
    Fatal,
}

/// Retcode → action table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetcodePolicy {
    pub rules: HashMap<i64, RetcodeAction>,
    /// Action for codes without a rule
    pub fallback: RetcodeAction,
}

impl Default for RetcodePolicy {
    fn default() -> Self {
        let mut rules = HashMap::new();
        rules.insert(RETCODE_SESSION_INVALIDATED, RetcodeAction::Fatal);
        Self {
            rules,
            fallback: RetcodeAction::Continue,
        }
    }
}

impl RetcodePolicy {
    pub fn action_for(&self, retcode: i64) -> RetcodeAction {
        if retcode == 0 {
            return RetcodeAction::Continue;
        }
        self.rules.get(&retcode).copied().unwrap_or(self.fallback)
    }

    pub fn with_rule(mut self, retcode: i64, action: RetcodeAction) -> Self {
        self.rules.insert(retcode, action);
        self
    }
}

/// Engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Channel host: poll, send, online status, image fetch
    pub channel_host: String,
    /// API host: friends, groups, detail, account lookups
    pub api_host: String,
    /// Web host: group pictures, referer
    pub web_host: String,
    /// Avatar host suffix; requests go to face1..face10 of it
    pub avatar_host: String,
    /// Delay before re-polling after a transport error or unreadable body;
    /// 0 re-polls at once
    pub poll_retry_delay_ms: u64,
    /// Per-request timeout for the HTTP transport
    pub request_timeout_ms: u64,
    /// Maximum concurrent request/response calls
    pub max_workers: usize,
    /// Fetch image bytes while decoding chat messages
    pub fetch_images: bool,
    /// Directory for cached avatars, keyed by account
    pub avatar_cache_dir: Option<PathBuf>,
    pub retcode_policy: RetcodePolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel_host: "http://d.web2.qq.com".to_string(),
            api_host: "http://s.web2.qq.com".to_string(),
            web_host: "http://web2.qq.com".to_string(),
            avatar_host: "qun.qq.com".to_string(),
            poll_retry_delay_ms: 0,
            request_timeout_ms: 120_000,
            max_workers: 8,
            fetch_images: true,
            avatar_cache_dir: None,
            retcode_policy: RetcodePolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Load from a JSON file; missing keys take their defaults
    pub fn from_file(path: &Path) -> Result<Self, ClientError> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| ClientError::Protocol(ProtocolError::Json(e)))
    }

    /// Apply `WEBIM_*` environment overrides
    pub fn with_env_overrides(mut self) -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        if let Some(v) = var("WEBIM_CHANNEL_HOST") {
            self.channel_host = v;
        }
        if let Some(v) = var("WEBIM_API_HOST") {
            self.api_host = v;
        }
        if let Some(v) = var("WEBIM_WEB_HOST") {
            self.web_host = v;
        }
        if let Some(v) = var("WEBIM_AVATAR_CACHE") {
            self.avatar_cache_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("WEBIM_FETCH_IMAGES") {
            self.fetch_images = !matches!(v.as_str(), "0" | "false" | "no");
        }
        if let Some(v) = var("WEBIM_POLL_RETRY_MS") {
            match v.parse() {
                Ok(ms) => self.poll_retry_delay_ms = ms,
                Err(_) => warn!("ignoring invalid WEBIM_POLL_RETRY_MS '{}'", v),
            }
        }
        self
    }

    pub fn poll_retry_delay(&self) -> Duration {
        Duration::from_millis(self.poll_retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetcodePolicy::default();
        assert_eq!(policy.action_for(0), RetcodeAction::Continue);
        assert_eq!(policy.action_for(121), RetcodeAction::Fatal);
        assert_eq!(policy.action_for(102), RetcodeAction::Continue);
        assert_eq!(policy.action_for(116), RetcodeAction::Continue);
    }

    #[test]
    fn test_policy_rules_override_fallback() {
        let policy = RetcodePolicy::default().with_rule(103, RetcodeAction::Backoff(500));
        assert_eq!(policy.action_for(103), RetcodeAction::Backoff(500));
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "channel_host": "http://localhost:9000",
            "fetch_images": false,
            "retcode_policy": {"rules": {"103": {"action": "backoff", "ms": 250}, "121": {"action": "fatal"}}}
        }"#;
        let config: ClientConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.channel_host, "http://localhost:9000");
        assert_eq!(config.api_host, "http://s.web2.qq.com");
        assert!(!config.fetch_images);
        assert_eq!(
            config.retcode_policy.action_for(103),
            RetcodeAction::Backoff(250)
        );
        assert_eq!(config.retcode_policy.action_for(121), RetcodeAction::Fatal);
    }

    #[test]
    fn test_failed_poll_retries_immediately_by_default() {
        let config = ClientConfig::default();
        assert_eq!(config.poll_retry_delay(), Duration::ZERO);
        let config: ClientConfig = serde_json::from_str(r#"{"poll_retry_delay_ms": 250}"#).unwrap();
        assert_eq!(config.poll_retry_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(&path, r#"{"max_workers": 3}"#).unwrap();
        let config = ClientConfig::from_file(&path).unwrap();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.retcode_policy, RetcodePolicy::default());
    }
}
