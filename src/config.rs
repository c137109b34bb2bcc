use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "settings.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:mailsync.db?mode=rwc".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Base64 of a 32-byte key. When unset the key lives in the OS keyring.
    pub encryption_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub fetch_limit: usize,
    pub body_limit: usize,
    pub mailbox: String,
    pub default_category: String,
    pub incremental: bool,
    pub log_messages: bool,
    pub connect_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch_limit: 20,
            body_limit: 10_000,
            mailbox: "INBOX".to_string(),
            default_category: "primary".to_string(),
            incremental: false,
            log_messages: false,
            connect_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Reads `path` if it exists and parses; otherwise defaults. Environment overrides apply either way.
    pub fn load(path: &Path) -> Self {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Ignoring malformed {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("MAILSYNC_DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(key) = lookup("MAILSYNC_ENCRYPTION_KEY") {
            self.security.encryption_key = Some(key);
        }
        if let Some(limit) = lookup("MAILSYNC_FETCH_LIMIT").and_then(|v| v.parse().ok()) {
            self.sync.fetch_limit = limit;
        }
        if let Some(limit) = lookup("MAILSYNC_BODY_LIMIT").and_then(|v| v.parse().ok()) {
            self.sync.body_limit = limit;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [sync]
            fetch_limit = 50
            incremental = true
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.fetch_limit, 50);
        assert!(config.sync.incremental);
        assert_eq!(config.sync.body_limit, 10_000);
        assert_eq!(config.sync.mailbox, "INBOX");
        assert_eq!(config.database.url, "sqlite:mailsync.db?mode=rwc");
        assert!(config.security.encryption_key.is_none());
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("MAILSYNC_DATABASE_URL", "sqlite::memory:"),
            ("MAILSYNC_FETCH_LIMIT", "5"),
            ("MAILSYNC_BODY_LIMIT", "not a number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.sync.fetch_limit, 5);
        assert_eq!(config.sync.body_limit, 10_000);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load(Path::new("/nonexistent/mailsync/settings.toml"));
        assert_eq!(config.sync.default_category, "primary");
    }
}
