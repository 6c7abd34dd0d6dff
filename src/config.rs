//! Application configuration.
//!
//! Read from the environment (optionally seeded from a `.env` file by the
//! binary). Every setting has a default, and an unparsable value falls back
//! to it with a warning.

use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::storage::StorageConfig;
use crate::sync::{SessionConfig, SyncConfig};

/// Runtime settings for the binary
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Sled database directory
    pub storage_path: String,
    /// HTTP control surface port
    pub port: u16,
    pub push_debounce: Duration,
    pub merge_cooldown: Duration,
    pub guard_release: Duration,
    pub presence_refresh: Duration,
    pub presence_sweep: Duration,
    pub presence_stale: Duration,
    /// Stored with this client's presence record; defaults to the crate name
    pub user_agent: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let sync = SyncConfig::default();
        let session = SessionConfig::default();
        Self {
            storage_path: StorageConfig::default().path,
            port: 5000,
            push_debounce: sync.push_debounce,
            merge_cooldown: sync.merge_cooldown,
            guard_release: sync.guard_release,
            presence_refresh: session.refresh_interval,
            presence_sweep: session.sweep_interval,
            presence_stale: session.stale_after,
            user_agent: None,
        }
    }
}

impl AppConfig {
    /// Load from process environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            Duration::from_millis(parse_or(&lookup, key, default.as_millis() as u64))
        };
        let secs = |key: &str, default: Duration| {
            Duration::from_secs(parse_or(&lookup, key, default.as_secs()))
        };

        Self {
            storage_path: lookup("STORAGE_PATH").unwrap_or(defaults.storage_path),
            port: parse_or(&lookup, "PORT", defaults.port),
            push_debounce: millis("PUSH_DEBOUNCE_MS", defaults.push_debounce),
            merge_cooldown: millis("MERGE_COOLDOWN_MS", defaults.merge_cooldown),
            guard_release: millis("GUARD_RELEASE_MS", defaults.guard_release),
            presence_refresh: secs("PRESENCE_REFRESH_SECS", defaults.presence_refresh),
            presence_sweep: secs("PRESENCE_SWEEP_SECS", defaults.presence_sweep),
            presence_stale: secs("PRESENCE_STALE_SECS", defaults.presence_stale),
            user_agent: lookup("USER_AGENT").filter(|ua| !ua.trim().is_empty()),
        }
    }

    pub fn storage(&self) -> StorageConfig {
        StorageConfig::new(&self.storage_path)
    }

    pub fn sync(&self) -> SyncConfig {
        SyncConfig::default()
            .with_push_debounce(self.push_debounce)
            .with_merge_cooldown(self.merge_cooldown)
            .with_guard_release(self.guard_release)
    }

    pub fn session(&self) -> SessionConfig {
        let mut config = SessionConfig {
            refresh_interval: self.presence_refresh,
            sweep_interval: self.presence_sweep,
            stale_after: self.presence_stale,
            ..SessionConfig::default()
        };
        if let Some(user_agent) = &self.user_agent {
            config = config.with_user_agent(user_agent.clone());
        }
        config
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid value for {}: {:?}, using default", key, raw);
            default
        }),
        None => default,
    }
}
