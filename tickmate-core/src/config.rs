use config::{Config, Environment};
use serde::Deserialize;

use crate::error::ConfigError;

/// Environment variables the process refuses to start without.
const REQUIRED_VARS: &[&str] = &[
    "TELEGRAM_BOT_TOKEN",
    "ANGELONE_API_KEY",
    "ANGELONE_CLIENT_CODE",
    "ANGELONE_PIN",
    "ANGELONE_TOTP_SECRET",
    "OPENAI_API_KEY",
];

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub telegram: TelegramConfig,
    pub broker: BrokerConfig,
    pub openai: OpenAiConfig,
    pub session: SessionConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    pub api_key: String,
    pub client_code: String,
    pub pin: String,
    pub totp_secret: String,
    #[serde(default = "default_broker_base_url")]
    pub base_url: String,
}

fn default_broker_base_url() -> String {
    "https://apiconnect.angelone.in".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub timeout_minutes: u64,
    pub sweep_interval_secs: u64,
    pub connection_sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 60,
            sweep_interval_secs: 300,
            connection_sweep_interval_secs: 1800,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub max_history_messages: usize,
    pub confirmation_ttl_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_history_messages: 20,
            confirmation_ttl_secs: 300,
        }
    }
}

impl AppConfig {
    /// Build the configuration from the process environment.
    ///
    /// Every missing required variable is reported in one error so the
    /// operator fixes them in a single pass.
    pub fn from_env() -> Result<Self, ConfigError> {
        let missing: Vec<String> = REQUIRED_VARS
            .iter()
            .filter(|name| std::env::var(name).map(|v| v.is_empty()).unwrap_or(true))
            .map(|name| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingVars(missing));
        }

        Ok(Self {
            telegram: section("TELEGRAM")?,
            broker: section("ANGELONE")?,
            openai: section("OPENAI")?,
            session: section("SESSION")?,
            agent: section("AGENT")?,
        })
    }
}

fn section<T: serde::de::DeserializeOwned>(prefix: &str) -> Result<T, ConfigError> {
    let cfg = Config::builder()
        .add_source(Environment::with_prefix(prefix))
        .build()?;
    Ok(cfg.try_deserialize()?)
}
