use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::llm::Provider;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub ai_model: AiModelConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub subscription: SubscriptionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AiModelConfig {
    pub provider: Provider,
    pub model: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for AiModelConfig {
    fn default() -> Self {
        Self {
            provider: Provider::OpenAi,
            model: "gpt-4o-mini".to_string(),
            endpoint: "https://api.openai.com/v1".to_string(),
            api_key: None,
            timeout_secs: 60,
        }
    }
}

/// Signing secret used when neither the config file nor the environment sets one.
pub const DEFAULT_JWT_SECRET: &str = "studently-dev-secret";

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl_minutes: i64,
    pub dev_email: String,
    pub dev_password: String,
    pub dev_name: String,
}

impl AuthConfig {
    pub fn uses_default_secret(&self) -> bool {
        self.jwt_secret == DEFAULT_JWT_SECRET
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            token_ttl_minutes: 60 * 24,
            dev_email: "dave@studently.uk".to_string(),
            dev_password: "studently".to_string(),
            dev_name: "Dave".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file backing the key/value store. In-memory only when unset.
    pub state_file: Option<String>,
}

/// Per-tool call limits for each subscription tier. `None` means unlimited.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub free_limit: Option<u32>,
    pub pro_limit: Option<u32>,
    pub premium_limit: Option<u32>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            free_limit: Some(5),
            pro_limit: Some(100),
            premium_limit: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;

        let mut config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config.apply_env();

        Ok(config)
    }

    /// Load the config file if present, otherwise start from defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::from_file(path);
        }

        let mut config = Config::default();
        config.apply_env();
        Ok(config)
    }

    /// Override with environment variables if set
    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("STUDENTLY_API_BASE_URL") {
            self.ai_model.endpoint = url;
        }

        let key_var = if self.ai_model.endpoint.contains("groq") {
            "GROQ_API_KEY"
        } else {
            "OPENAI_API_KEY"
        };
        if let Ok(key) = std::env::var(key_var) {
            self.ai_model.api_key = Some(key);
        }

        if let Ok(secret) = std::env::var("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }

        if let Some(port) = std::env::var("STUDENTLY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.server.port = port;
        }
    }
}
