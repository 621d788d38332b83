//! Load config from file and environment.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use uav_core::{BincodeCodec, Block, Codec, JsonCodec};

/// Wire encoding used on every connection of this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Bincode,
    Json,
}

impl CodecKind {
    pub fn build(self) -> Arc<dyn Codec> {
        match self {
            CodecKind::Bincode => Arc::new(BincodeCodec),
            CodecKind::Json => Arc::new(JsonCodec),
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bincode" => Some(CodecKind::Bincode),
            "json" => Some(CodecKind::Json),
            _ => None,
        }
    }
}

/// Daemon configuration. File: ~/.config/uav-auth/config.toml or /etc/uav-auth/config.toml.
/// Env overrides: UAV_NODE_ID, UAV_LISTEN_PORT, UAV_SALT, UAV_STATE_PATH, UAV_CODEC, UAV_TIMEOUT_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// TCP port for `serve` and `base-station` (default 8080).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Hex-encoded 32-byte device-function salt. Random per process if absent.
    #[serde(default)]
    pub salt: Option<String>,
    /// JSON peer table, loaded at start and saved after every run.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    #[serde(default)]
    pub codec: CodecKind,
    #[serde(default = "default_receive_timeout_secs")]
    pub receive_timeout_secs: u64,
    /// Serve authentication in session-key mode.
    #[serde(default)]
    pub key_establishment: bool,
    /// Pairs harvested per pre-enrollment.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_node_id() -> String {
    "A".to_string()
}
fn default_listen_port() -> u16 {
    8080
}
fn default_receive_timeout_secs() -> u64 {
    5
}
fn default_batch_size() -> usize {
    uav_core::delegation::DEFAULT_BATCH_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            listen_port: default_listen_port(),
            salt: None,
            state_path: None,
            codec: CodecKind::default(),
            receive_timeout_secs: default_receive_timeout_secs(),
            key_establishment: false,
            batch_size: default_batch_size(),
        }
    }
}

/// Configured salt could not be used.
#[derive(Debug, thiserror::Error)]
pub enum SaltError {
    #[error("salt is not hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("salt must be 32 bytes, got {0}")]
    Length(usize),
}

/// Configured values the daemon cannot run with.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("batch_size must be at least 1")]
    ZeroBatchSize,
    #[error("receive_timeout_secs must be at least 1")]
    ZeroTimeout,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.receive_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    pub fn receive_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.receive_timeout_secs)
    }

    pub fn salt_bytes(&self) -> Result<Option<Block>, SaltError> {
        let Some(s) = &self.salt else {
            return Ok(None);
        };
        let v = hex::decode(s.trim())?;
        let len = v.len();
        let block: Block = v.try_into().map_err(|_| SaltError::Length(len))?;
        Ok(Some(block))
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

/// Apply `UAV_*` overrides; unparsable values are ignored.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("UAV_NODE_ID") {
        if !s.is_empty() {
            c.node_id = s;
        }
    }
    if let Some(p) = var("UAV_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.listen_port = p;
    }
    if let Some(s) = var("UAV_SALT") {
        c.salt = Some(s);
    }
    if let Some(s) = var("UAV_STATE_PATH") {
        c.state_path = Some(PathBuf::from(s));
    }
    if let Some(k) = var("UAV_CODEC").and_then(|s| CodecKind::parse(&s)) {
        c.codec = k;
    }
    if let Some(t) = var("UAV_TIMEOUT_SECS").and_then(|s| s.parse::<u64>().ok()) {
        c.receive_timeout_secs = t;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/uav-auth/config.toml"));
    }
    out.push(PathBuf::from("/etc/uav-auth/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "config file ignored"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "config file unreadable"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.node_id, "A");
        assert_eq!(c.listen_port, 8080);
        assert_eq!(c.receive_timeout_secs, 5);
        assert_eq!(c.batch_size, 5);
        assert_eq!(c.codec, CodecKind::Bincode);
        assert!(!c.key_establishment);
        assert_eq!(c.salt_bytes().unwrap(), None);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c: Config = toml::from_str("node_id = \"B\"\ncodec = \"json\"\nkey_establishment = true\n").unwrap();
        assert_eq!(c.node_id, "B");
        assert_eq!(c.codec, CodecKind::Json);
        assert!(c.key_establishment);
        assert_eq!(c.listen_port, 8080);
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides() {
        let salt = "ab".repeat(32);
        let env: HashMap<&str, &str> = [
            ("UAV_NODE_ID", "C"),
            ("UAV_LISTEN_PORT", "9001"),
            ("UAV_CODEC", "JSON"),
            ("UAV_TIMEOUT_SECS", "not-a-number"),
            ("UAV_SALT", salt.as_str()),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.node_id, "C");
        assert_eq!(c.listen_port, 9001);
        assert_eq!(c.codec, CodecKind::Json);
        assert_eq!(c.receive_timeout_secs, 5);
        assert_eq!(c.salt_bytes().unwrap(), Some([0xab; 32]));
    }

    #[test]
    fn zero_batch_and_timeout_rejected() {
        assert_eq!(Config::default().validate(), Ok(()));
        let c: Config = toml::from_str("batch_size = 0\n").unwrap();
        assert_eq!(c.validate(), Err(ConfigError::ZeroBatchSize));
        let mut c = Config::default();
        apply_env(&mut c, |k| (k == "UAV_TIMEOUT_SECS").then(|| "0".to_string()));
        assert_eq!(c.validate(), Err(ConfigError::ZeroTimeout));
    }

    #[test]
    fn bad_salt_reported() {
        let mut c = Config {
            salt: Some("abcd".into()),
            ..Config::default()
        };
        assert!(matches!(c.salt_bytes(), Err(SaltError::Length(2))));
        c.salt = Some("zz".into());
        assert!(matches!(c.salt_bytes(), Err(SaltError::Hex(_))));
    }
}
