// ============================
// crates/backend-lib/src/config.rs
// ============================
//! Configuration management.
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

/// Application settings
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Data directory path
    pub data_dir: PathBuf,
    /// Log level
    pub log_level: String,
    /// Window within which a new connection must authenticate
    pub auth_timeout_secs: u64,
    /// Maximum chat message length in bytes (longer messages are
    /// rejected, never truncated)
    pub max_chat_len: usize,
    /// Capacity used when a session record carries no explicit limit
    pub default_max_participants: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".parse().unwrap(),
            data_dir: PathBuf::from("data"),
            log_level: "info".to_string(),
            auth_timeout_secs: 10,
            max_chat_len: 4000,
            default_max_participants: 100,
        }
    }
}

impl Settings {
    /// Load settings from `config.toml` merged with `MEETRELAY_`
    /// environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    /// Load settings from an explicit config file path.
    pub fn load_from(path: &str) -> Result<Self> {
        let settings = Figment::from(figment::providers::Serialized::defaults(
            SettingsDefaults::default(),
        ))
        .merge(Toml::file(path))
        .merge(Env::prefixed("MEETRELAY_"))
        .extract()?;

        Ok(settings)
    }
}

// figment needs a Serialize-able defaults provider; keep it private and
// mirror Settings field-for-field.
#[derive(serde::Serialize)]
struct SettingsDefaults {
    bind_addr: String,
    data_dir: PathBuf,
    log_level: String,
    auth_timeout_secs: u64,
    max_chat_len: usize,
    default_max_participants: usize,
}

impl Default for SettingsDefaults {
    fn default() -> Self {
        let s = Settings::default();
        Self {
            bind_addr: s.bind_addr.to_string(),
            data_dir: s.data_dir,
            log_level: s.log_level,
            auth_timeout_secs: s.auth_timeout_secs,
            max_chat_len: s.max_chat_len,
            default_max_participants: s.default_max_participants,
        }
    }
}
