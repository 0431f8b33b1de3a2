//! Environment-variable configuration.
//!
//! All options live under the `LORELAY_` prefix and have working defaults;
//! the resolved configuration is a plain struct passed by reference at
//! startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::acl::AclMode;
use crate::event::{parse_hex32, Pubkey};

pub const ENV_NAME: &str = "LORELAY_NAME";
pub const ENV_DESCRIPTION: &str = "LORELAY_DESCRIPTION";
pub const ENV_DATA_DIR: &str = "LORELAY_DATA_DIR";
pub const ENV_LOG_LEVEL: &str = "LORELAY_LOG_LEVEL";
pub const ENV_LISTEN: &str = "LORELAY_LISTEN";
pub const ENV_PORT: &str = "LORELAY_PORT";
pub const ENV_HEALTH_PORT: &str = "LORELAY_HEALTH_PORT";
pub const ENV_IP_WHITELIST: &str = "LORELAY_IP_WHITELIST";
pub const ENV_ADMINS: &str = "LORELAY_ADMINS";
pub const ENV_ACL_MODE: &str = "LORELAY_ACL_MODE";
pub const ENV_SPIDER_MODE: &str = "LORELAY_SPIDER_MODE";
pub const ENV_SPIDER_REFRESH: &str = "LORELAY_SPIDER_REFRESH_SECS";
pub const ENV_RELAY_URL: &str = "LORELAY_RELAY_URL";

pub const DEFAULT_PORT: u16 = 3334;
pub const DEFAULT_SPIDER_REFRESH: Duration = Duration::from_secs(3600);

/// Error types for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Outbound federation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpiderMode {
    #[default]
    Off,
    Follows,
}

impl FromStr for SpiderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "off" => Ok(SpiderMode::Off),
            "follows" => Ok(SpiderMode::Follows),
            other => Err(format!("unknown spider mode {other:?}")),
        }
    }
}

impl SpiderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpiderMode::Off => "off",
            SpiderMode::Follows => "follows",
        }
    }
}

/// Resolved relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub description: String,
    pub data_dir: PathBuf,
    pub log_level: String,
    pub listen: String,
    pub port: u16,
    pub health_port: Option<u16>,
    /// Allowed remote address prefixes; empty means allow all.
    pub ip_whitelist: Vec<String>,
    pub admins: Vec<Pubkey>,
    pub acl_mode: AclMode,
    pub spider_mode: SpiderMode,
    pub spider_refresh: Duration,
    /// Canonical ws URL clients must echo in AUTH events; derived from the
    /// listen address when unset.
    pub relay_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: "lorelay".to_string(),
            description: String::new(),
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            listen: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            health_port: None,
            ip_whitelist: Vec::new(),
            admins: Vec::new(),
            acl_mode: AclMode::None,
            spider_mode: SpiderMode::Off,
            spider_refresh: DEFAULT_SPIDER_REFRESH,
            relay_url: None,
        }
    }
}

impl Config {
    /// Load configuration from the environment on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Config::default();
        if let Some(name) = var(ENV_NAME) {
            cfg.name = name;
        }
        if let Some(description) = var(ENV_DESCRIPTION) {
            cfg.description = description;
        }
        if let Some(dir) = var(ENV_DATA_DIR) {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(level) = var(ENV_LOG_LEVEL) {
            cfg.log_level = level;
        }
        if let Some(listen) = var(ENV_LISTEN) {
            cfg.listen = listen;
        }
        if let Some(port) = var(ENV_PORT) {
            cfg.port = parse(ENV_PORT, &port)?;
        }
        if let Some(port) = var(ENV_HEALTH_PORT) {
            cfg.health_port = Some(parse(ENV_HEALTH_PORT, &port)?);
        }
        if let Some(list) = var(ENV_IP_WHITELIST) {
            cfg.ip_whitelist = split_list(&list);
        }
        if let Some(list) = var(ENV_ADMINS) {
            let mut admins = Vec::new();
            for entry in split_list(&list) {
                let pubkey = parse_hex32(&entry).map_err(|e| ConfigError::Invalid {
                    key: ENV_ADMINS,
                    reason: e.to_string(),
                })?;
                admins.push(pubkey);
            }
            cfg.admins = admins;
        }
        if let Some(mode) = var(ENV_ACL_MODE) {
            cfg.acl_mode = mode.parse().map_err(|e: crate::acl::AclError| {
                ConfigError::Invalid {
                    key: ENV_ACL_MODE,
                    reason: e.to_string(),
                }
            })?;
        }
        if let Some(mode) = var(ENV_SPIDER_MODE) {
            cfg.spider_mode = mode.parse().map_err(|reason| ConfigError::Invalid {
                key: ENV_SPIDER_MODE,
                reason,
            })?;
        }
        if let Some(secs) = var(ENV_SPIDER_REFRESH) {
            let secs: u64 = parse(ENV_SPIDER_REFRESH, &secs)?;
            cfg.spider_refresh = Duration::from_secs(secs.max(1));
        }
        if let Some(url) = var(ENV_RELAY_URL) {
            cfg.relay_url = Some(url);
        }
        Ok(cfg)
    }

    /// The ws URL clients are expected to address in AUTH events.
    pub fn canonical_url(&self) -> String {
        match &self.relay_url {
            Some(url) => url.clone(),
            None => format!("ws://{}:{}", self.listen, self.port),
        }
    }

    /// Print the resolved configuration as KEY=VALUE lines.
    pub fn print(&self) {
        println!("{ENV_NAME}={}", self.name);
        println!("{ENV_DESCRIPTION}={}", self.description);
        println!("{ENV_DATA_DIR}={}", self.data_dir.display());
        println!("{ENV_LOG_LEVEL}={}", self.log_level);
        println!("{ENV_LISTEN}={}", self.listen);
        println!("{ENV_PORT}={}", self.port);
        println!(
            "{ENV_HEALTH_PORT}={}",
            self.health_port.map(|p| p.to_string()).unwrap_or_default()
        );
        println!("{ENV_IP_WHITELIST}={}", self.ip_whitelist.join(","));
        println!(
            "{ENV_ADMINS}={}",
            self.admins
                .iter()
                .map(hex::encode)
                .collect::<Vec<_>>()
                .join(",")
        );
        println!("{ENV_ACL_MODE}={}", self.acl_mode.as_str());
        println!("{ENV_SPIDER_MODE}={}", self.spider_mode.as_str());
        println!("{ENV_SPIDER_REFRESH}={}", self.spider_refresh.as_secs());
        println!("{ENV_RELAY_URL}={}", self.canonical_url());
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lorelay")
}

fn var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
