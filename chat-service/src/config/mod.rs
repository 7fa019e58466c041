use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_TEMPERATURE: f32 = 0.3;
const DEFAULT_MAX_OUTPUT_TOKENS: i32 = 500;
const DEFAULT_STREAM_TIMEOUT_SECS: u64 = 60;
const DEFAULT_GUARD_CACHE_CAPACITY: usize = 2048;
const DEFAULT_GUARD_TIMEOUT_SECS: u64 = 5;

/// System prompt used when neither `CHAT_SYSTEM_PROMPT` nor
/// `CHAT_SYSTEM_PROMPT_PATH` is set.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an AWS cloud assistant. \
Answer questions about Amazon Web Services, cloud architecture, DevOps, \
infrastructure, security, networking, deployment, monitoring, scaling and cost. \
Be concise and accurate. Politely decline anything unrelated to AWS.";

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: String,
    pub otlp_endpoint: Option<String>,
    /// `None` keeps the history log in memory.
    pub mongodb: Option<MongoConfig>,
    pub model: ModelConfig,
    pub google: GoogleConfig,
    pub chat: ChatSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Gemini model id (e.g., gemini-2.5-flash)
    pub name: String,
    pub temperature: f32,
    pub max_output_tokens: i32,
    pub system_prompt: String,
    /// Serve canned responses instead of calling Gemini (local development).
    pub use_mock: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleConfig {
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatSettings {
    /// Upper bound on the streaming phase of a turn.
    pub stream_timeout_secs: u64,
    /// Maximum number of cached guard decisions.
    pub guard_cache_capacity: usize,
    /// Upper bound on one intent classification call.
    pub guard_timeout_secs: u64,
    /// Hold a per-session lock for the whole turn.
    pub serialize_session_turns: bool,
}

impl ChatSettings {
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    pub fn guard_timeout(&self) -> Duration {
        Duration::from_secs(self.guard_timeout_secs)
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            stream_timeout_secs: DEFAULT_STREAM_TIMEOUT_SECS,
            guard_cache_capacity: DEFAULT_GUARD_CACHE_CAPACITY,
            guard_timeout_secs: DEFAULT_GUARD_TIMEOUT_SECS,
            serialize_session_turns: false,
        }
    }
}

impl ChatConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let is_prod = environment == "prod";

        let mongodb = match env::var("MONGODB_URI") {
            Ok(uri) => Some(MongoConfig {
                uri,
                database: get_env("MONGODB_DATABASE", Some("chat_db"), is_prod)?,
            }),
            Err(_) if is_prod => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "MONGODB_URI is required in production but not set"
                )));
            }
            Err(_) => None,
        };

        let use_mock = parse_env("CHAT_USE_MOCK_PROVIDER", false)?;

        Ok(ChatConfig {
            common: common_config,
            environment,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            mongodb,
            model: ModelConfig {
                name: get_env("CHAT_MODEL", Some(DEFAULT_MODEL), is_prod)?,
                temperature: parse_env("CHAT_TEMPERATURE", DEFAULT_TEMPERATURE)?,
                max_output_tokens: parse_env("CHAT_MAX_OUTPUT_TOKENS", DEFAULT_MAX_OUTPUT_TOKENS)?,
                system_prompt: load_system_prompt()?,
                use_mock,
            },
            google: GoogleConfig {
                // The key is optional only when the mock provider is in use.
                api_key: if use_mock {
                    env::var("GOOGLE_API_KEY").unwrap_or_default()
                } else {
                    get_env("GOOGLE_API_KEY", None, is_prod)?
                },
            },
            chat: ChatSettings {
                stream_timeout_secs: parse_env(
                    "CHAT_STREAM_TIMEOUT_SECS",
                    DEFAULT_STREAM_TIMEOUT_SECS,
                )?,
                guard_cache_capacity: parse_env(
                    "CHAT_GUARD_CACHE_CAPACITY",
                    DEFAULT_GUARD_CACHE_CAPACITY,
                )?,
                guard_timeout_secs: parse_env(
                    "CHAT_GUARD_TIMEOUT_SECS",
                    DEFAULT_GUARD_TIMEOUT_SECS,
                )?,
                serialize_session_turns: parse_env("CHAT_SERIALIZE_SESSION_TURNS", false)?,
            },
        })
    }
}

fn load_system_prompt() -> Result<String, AppError> {
    if let Ok(prompt) = env::var("CHAT_SYSTEM_PROMPT") {
        return Ok(prompt.trim().to_string());
    }

    match env::var("CHAT_SYSTEM_PROMPT_PATH") {
        Ok(path) => std::fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!(
                    "Failed to read system prompt from {}: {}",
                    path,
                    e
                ))
            }),
        Err(_) => Ok(DEFAULT_SYSTEM_PROMPT.to_string()),
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val.trim().parse().map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value: {}", key, e))
        }),
        Err(_) => Ok(default),
    }
}
