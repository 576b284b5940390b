//! Connector configuration.
//!
//! Loaded from a JSON file. Everything except the relay URL and one of
//! `access_code` / `access_code_hash` is optional; defaults mirror what a
//! stock gateway deployment expects.

use std::path::Path;

use serde::Deserialize;

use crate::protocol::{self, Caps};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0} is required")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub relay_url: String,
    #[serde(default)]
    pub access_code: String,
    #[serde(default)]
    pub access_code_hash: String,
    #[serde(default)]
    pub generation: u32,
    #[serde(default)]
    pub caps: Caps,
    #[serde(default)]
    pub reconnect_seconds: u64,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub auth: GatewayAuth,
    #[serde(default)]
    pub client: GatewayClientInfo,
    #[serde(default)]
    pub min_protocol: u32,
    #[serde(default)]
    pub max_protocol: u32,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub locale: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub challenge_timeout_seconds: u64,
    #[serde(default)]
    pub reconnect_initial_seconds: u64,
    #[serde(default)]
    pub reconnect_max_seconds: u64,
    #[serde(default)]
    pub send_method: String,
    #[serde(default)]
    pub cancel_method: String,
    /// Destination for addressed send methods; unused by chat-style methods.
    #[serde(default)]
    pub send_to: String,
    /// Treat streamed text as cumulative snapshots and emit only deltas.
    #[serde(default)]
    pub cumulative_text: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayAuth {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayClientInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "displayName")]
    pub display_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub mode: String,
}

impl GatewayConfig {
    /// A gateway config with every default applied, as `load` produces for
    /// an empty `gateway` object.
    pub fn defaulted() -> Self {
        let mut cfg = Self::default();
        cfg.apply_defaults();
        cfg
    }

    fn apply_defaults(&mut self) {
        if self.url.is_empty() {
            self.url = "ws://127.0.0.1:18789".to_string();
        }
        if self.client.id.is_empty() {
            self.client.id = "agentbridge-connector".to_string();
        }
        if self.client.display_name.is_empty() {
            self.client.display_name = "AgentBridge Connector".to_string();
        }
        if self.client.version.is_empty() {
            self.client.version = env!("CARGO_PKG_VERSION").to_string();
        }
        if self.client.platform.is_empty() {
            self.client.platform = std::env::consts::OS.to_string();
        }
        if self.client.mode.is_empty() {
            self.client.mode = "operator".to_string();
        }
        if self.min_protocol == 0 {
            self.min_protocol = 3;
        }
        if self.max_protocol == 0 {
            self.max_protocol = self.min_protocol;
        }
        if self.challenge_timeout_seconds == 0 {
            self.challenge_timeout_seconds = 8;
        }
        if self.reconnect_initial_seconds == 0 {
            self.reconnect_initial_seconds = 1;
        }
        if self.reconnect_max_seconds == 0 {
            self.reconnect_max_seconds = 30;
        }
        if self.send_method.is_empty() {
            self.send_method = "send".to_string();
        }
        if self.cancel_method.is_empty() {
            self.cancel_method = "cancel".to_string();
        }
    }
}

/// Load and validate a connector config file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read(path)?;
    let mut cfg: Config = serde_json::from_slice(&raw)?;

    if cfg.relay_url.is_empty() {
        return Err(ConfigError::MissingField("relay_url"));
    }
    if cfg.generation == 0 {
        cfg.generation = 1;
    }
    if cfg.reconnect_seconds == 0 {
        cfg.reconnect_seconds = 2;
    }
    if cfg.access_code_hash.is_empty() {
        if cfg.access_code.is_empty() {
            return Err(ConfigError::MissingField("access_code or access_code_hash"));
        }
        cfg.access_code_hash = protocol::hash_access_code(&cfg.access_code);
    }
    cfg.gateway.apply_defaults();

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_minimal_config_defaults() {
        let (_dir, path) = write_config(
            r#"{"relay_url": "ws://relay.example/tunnel", "access_code": "hunter2"}"#,
        );
        let cfg = load(&path).unwrap();

        assert_eq!(cfg.relay_url, "ws://relay.example/tunnel");
        assert_eq!(cfg.generation, 1);
        assert_eq!(cfg.reconnect_seconds, 2);
        assert_eq!(
            cfg.access_code_hash,
            protocol::hash_access_code("hunter2")
        );
        assert_eq!(cfg.gateway.url, "ws://127.0.0.1:18789");
        assert_eq!(cfg.gateway.min_protocol, 3);
        assert_eq!(cfg.gateway.max_protocol, 3);
        assert_eq!(cfg.gateway.challenge_timeout_seconds, 8);
        assert_eq!(cfg.gateway.reconnect_initial_seconds, 1);
        assert_eq!(cfg.gateway.reconnect_max_seconds, 30);
        assert_eq!(cfg.gateway.send_method, "send");
        assert_eq!(cfg.gateway.cancel_method, "cancel");
        assert_eq!(cfg.gateway.client.id, "agentbridge-connector");
        assert_eq!(cfg.gateway.client.mode, "operator");
    }

    #[test]
    fn test_explicit_hash_wins_over_code() {
        let (_dir, path) = write_config(
            r#"{"relay_url": "ws://r", "access_code": "ignored", "access_code_hash": "sha256:feed"}"#,
        );
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.access_code_hash, "sha256:feed");
    }

    #[test]
    fn test_missing_relay_url_fails() {
        let (_dir, path) = write_config(r#"{"relay_url": "", "access_code": "x"}"#);
        assert!(matches!(
            load(&path),
            Err(ConfigError::MissingField("relay_url"))
        ));
    }

    #[test]
    fn test_missing_credentials_fail() {
        let (_dir, path) = write_config(r#"{"relay_url": "ws://r"}"#);
        assert!(matches!(load(&path), Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_max_protocol_follows_min() {
        let (_dir, path) = write_config(
            r#"{"relay_url": "ws://r", "access_code": "x", "gateway": {"min_protocol": 5}}"#,
        );
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.gateway.min_protocol, 5);
        assert_eq!(cfg.gateway.max_protocol, 5);
    }

    #[test]
    fn test_gateway_overrides_survive() {
        let (_dir, path) = write_config(
            r#"{
                "relay_url": "ws://r",
                "access_code": "x",
                "caps": {"e2ee": true},
                "gateway": {
                    "url": "wss://gw.example",
                    "auth": {"token": "tok"},
                    "client": {"id": "custom", "displayName": "Custom"},
                    "send_method": "chat.send",
                    "cancel_method": "chat.abort",
                    "scopes": ["operator.read"],
                    "cumulative_text": true
                }
            }"#,
        );
        let cfg = load(&path).unwrap();
        assert!(cfg.caps.e2ee);
        assert_eq!(cfg.gateway.url, "wss://gw.example");
        assert_eq!(cfg.gateway.auth.token, "tok");
        assert_eq!(cfg.gateway.client.id, "custom");
        assert_eq!(cfg.gateway.send_method, "chat.send");
        assert_eq!(cfg.gateway.cancel_method, "chat.abort");
        assert_eq!(cfg.gateway.scopes, vec!["operator.read"]);
        assert!(cfg.gateway.cumulative_text);
    }

    #[test]
    fn test_invalid_json_fails() {
        let (_dir, path) = write_config("not json");
        assert!(matches!(load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file_fails() {
        let err = load(Path::new("/nonexistent/agentbridge.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
