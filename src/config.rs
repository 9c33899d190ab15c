use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Telegram tokens look like `123456789:AAH...`; anything shorter is a typo.
pub const MIN_BOT_TOKEN_LEN: usize = 40;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Openrouter,
    Ollama,
    Openai,
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmProvider::Openrouter => write!(f, "openrouter"),
            LlmProvider::Ollama => write!(f, "ollama"),
            LlmProvider::Openai => write!(f, "openai"),
        }
    }
}

impl FromStr for LlmProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openrouter" => Ok(LlmProvider::Openrouter),
            "ollama" => Ok(LlmProvider::Ollama),
            "openai" => Ok(LlmProvider::Openai),
            other => Err(format!(
                "unknown provider '{}' (expected openrouter, openai or ollama)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: String,
    pub base_url: String,
    pub api_key: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl LlmConfig {
    /// Returns the effective base_url: if the stored value is empty,
    /// fall back to the canonical URL for the configured provider.
    pub fn effective_base_url(&self) -> &str {
        if !self.base_url.is_empty() {
            return &self.base_url;
        }
        match self.provider {
            LlmProvider::Openrouter => "https://openrouter.ai/api/v1",
            LlmProvider::Ollama => "http://localhost:11434/v1",
            LlmProvider::Openai => "https://api.openai.com/v1",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Public HTTPS URL; when set the bot receives updates by webhook
    /// instead of long polling.
    pub webhook_url: Option<url::Url>,
    pub webhook_port: u16,
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub max_options: usize,
    pub response_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Process-wide settings, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub llm: LlmConfig,
    pub bot: BotConfig,
    pub health: HealthConfig,
}

/// Every invalid or missing setting found while loading, reported together.
#[derive(Debug, Error)]
#[error("invalid configuration:\n  - {}", .problems.join("\n  - "))]
pub struct ConfigError {
    pub problems: Vec<String>,
}

// ── Raw file layout (every field optional so env can fill the gaps) ──────────

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    telegram: RawTelegram,
    llm: RawLlm,
    bot: RawBot,
    health: RawHealth,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawTelegram {
    bot_token: Option<String>,
    webhook_url: Option<String>,
    webhook_port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawLlm {
    provider: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
    api_key: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawBot {
    max_options: Option<usize>,
    response_timeout: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawHealth {
    enabled: Option<bool>,
    port: Option<u16>,
}

fn default_model() -> String {
    "gpt-4.1-mini".to_string()
}

fn default_max_tokens() -> u32 {
    150
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_options() -> usize {
    5
}

fn default_response_timeout() -> u64 {
    30
}

fn default_webhook_port() -> u16 {
    8443
}

fn default_health_port() -> u16 {
    8000
}

/// Collects problems while resolving settings from file and environment.
struct Resolver<'a, F: Fn(&str) -> Option<String>> {
    env: &'a F,
    problems: Vec<String>,
}

impl<'a, F: Fn(&str) -> Option<String>> Resolver<'a, F> {
    /// First non-blank value among `keys`, with the key it came from.
    fn var(&self, keys: &[&'static str]) -> Option<(&'static str, String)> {
        keys.iter().find_map(|key| {
            (self.env)(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (*key, v))
        })
    }

    fn string(&self, keys: &[&'static str], file: Option<String>) -> Option<String> {
        self.var(keys)
            .map(|(_, v)| v)
            .or_else(|| file.filter(|v| !v.trim().is_empty()))
    }

    fn parsed<T>(&mut self, keys: &[&'static str], file: Option<T>, default: T) -> T
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.var(keys) {
            Some((key, raw)) => match raw.parse() {
                Ok(value) => value,
                Err(e) => {
                    self.problems
                        .push(format!("{} has an invalid value '{}': {}", key, raw, e));
                    default
                }
            },
            None => file.unwrap_or(default),
        }
    }
}

fn is_valid_bot_token(token: &str) -> bool {
    if token.len() < MIN_BOT_TOKEN_LEN {
        return false;
    }
    match token.split_once(':') {
        Some((id, secret)) => {
            !id.is_empty()
                && id.chars().all(|c| c.is_ascii_digit())
                && !secret.is_empty()
                && secret
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        None => false,
    }
}

impl Config {
    /// Load settings from an optional TOML file overlaid with the process
    /// environment (after reading `.env`, if present).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let file = match path {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?,
            ),
            None => None,
        };

        let config = Self::from_sources(file.as_deref(), &|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Resolve settings from raw TOML text and an environment lookup.
    /// Environment values take precedence over the file.
    pub fn from_sources<F>(file: Option<&str>, env: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw: RawConfig = match file {
            Some(content) => toml::from_str(content).context("Failed to parse config file")?,
            None => RawConfig::default(),
        };

        let mut r = Resolver {
            env,
            problems: Vec::new(),
        };

        // Telegram
        let bot_token = r
            .string(&["BOT_TOKEN"], raw.telegram.bot_token)
            .unwrap_or_default();
        if bot_token.is_empty() {
            r.problems.push("BOT_TOKEN is not set".to_string());
        } else if !is_valid_bot_token(&bot_token) {
            r.problems.push(format!(
                "BOT_TOKEN is malformed (expected '<numeric id>:<secret>' of at least {} characters)",
                MIN_BOT_TOKEN_LEN
            ));
        }

        let webhook_url = match r.string(&["WEBHOOK_URL"], raw.telegram.webhook_url) {
            Some(raw_url) => match url::Url::parse(&raw_url) {
                Ok(url) if url.scheme() == "https" => Some(url),
                Ok(_) => {
                    r.problems
                        .push(format!("WEBHOOK_URL must use https: '{}'", raw_url));
                    None
                }
                Err(e) => {
                    r.problems
                        .push(format!("WEBHOOK_URL is not a valid URL '{}': {}", raw_url, e));
                    None
                }
            },
            None => None,
        };
        let webhook_port = r.parsed(
            &["WEBHOOK_PORT"],
            raw.telegram.webhook_port,
            default_webhook_port(),
        );

        // LLM
        let provider = match r.string(&["LLM_PROVIDER"], raw.llm.provider) {
            Some(name) => name.parse::<LlmProvider>().unwrap_or_else(|e| {
                r.problems.push(format!("LLM_PROVIDER: {}", e));
                LlmProvider::default()
            }),
            None => LlmProvider::default(),
        };
        let api_key = r
            .string(
                &["LLM_API_KEY", "OPENAI_API_KEY", "OPENROUTER_API_KEY"],
                raw.llm.api_key,
            )
            .unwrap_or_default();
        if api_key.is_empty() && provider != LlmProvider::Ollama {
            r.problems.push(format!(
                "LLM_API_KEY (or OPENAI_API_KEY) is not set but required by provider '{}'",
                provider
            ));
        }
        let model = r
            .string(&["LLM_MODEL", "OPENAI_MODEL"], raw.llm.model)
            .unwrap_or_else(default_model);
        let base_url = r
            .string(&["LLM_BASE_URL"], raw.llm.base_url)
            .unwrap_or_default();
        let max_tokens = r.parsed(&["LLM_MAX_TOKENS"], raw.llm.max_tokens, default_max_tokens());
        if max_tokens == 0 {
            r.problems.push("LLM_MAX_TOKENS must be positive".to_string());
        }
        let temperature = r.parsed(
            &["LLM_TEMPERATURE"],
            raw.llm.temperature,
            default_temperature(),
        );
        if !(0.0..=2.0).contains(&temperature) {
            r.problems.push(format!(
                "LLM_TEMPERATURE must be between 0 and 2, got {}",
                temperature
            ));
        }

        // Bot behaviour
        let max_options = r.parsed(&["MAX_OPTIONS"], raw.bot.max_options, default_max_options());
        if max_options < 2 {
            r.problems
                .push(format!("MAX_OPTIONS must be at least 2, got {}", max_options));
        }
        let response_timeout = r.parsed(
            &["RESPONSE_TIMEOUT"],
            raw.bot.response_timeout,
            default_response_timeout(),
        );
        if response_timeout == 0 {
            r.problems
                .push("RESPONSE_TIMEOUT must be at least 1 second".to_string());
        }

        // Health
        let health_enabled = r.parsed(&["HEALTH_ENABLED"], raw.health.enabled, true);
        let health_port = r.parsed(&["HEALTH_PORT"], raw.health.port, default_health_port());

        if !r.problems.is_empty() {
            return Err(ConfigError {
                problems: r.problems,
            }
            .into());
        }

        Ok(Config {
            telegram: TelegramConfig {
                bot_token,
                webhook_url,
                webhook_port,
            },
            llm: LlmConfig {
                provider,
                model,
                base_url,
                api_key,
                max_tokens,
                temperature,
            },
            bot: BotConfig {
                max_options,
                response_timeout: Duration::from_secs(response_timeout),
            },
            health: HealthConfig {
                enabled: health_enabled,
                port: health_port,
            },
        })
    }
}
