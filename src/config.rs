use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Web Server
    pub web_host: String,
    pub web_port: u16,
    pub trust_proxy: usize,

    // Runtime
    pub run_mode: RunMode,
    pub log_level: LogLevel,
    pub application_info: String,

    // Features
    pub enable_raw_screenshots: bool,

    // Rate limiting
    pub redis_url: Option<String>,
    pub rate_limit_window: Duration,
    pub rate_limit_delay_after: u64,
    pub rate_limit_delay: Duration,

    // Browser
    pub chrome_path: Option<String>,

    // Upstream APIs
    pub twitter_syndication_url: String,
    pub bsky_service_url: String,
    pub bsky_account_identifier: Option<String>,
    pub bsky_account_password: Option<String>,
    pub bsky_refresh_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Development,
    Production,
}

impl RunMode {
    #[must_use]
    pub fn is_development(self) -> bool {
        self == Self::Development
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    #[must_use]
    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if an environment variable holds an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let run_mode = parse_run_mode(&env_or_default("RUN_MODE", "development"))?;
        let log_level = match optional_env("LOG_LEVEL") {
            Some(level) => parse_log_level(&level)?,
            None if run_mode.is_development() => LogLevel::Debug,
            None => LogLevel::Info,
        };

        Ok(Self {
            // Web Server
            web_host: env_or_default("HOST", "0.0.0.0"),
            web_port: parse_env_u16("PORT", 8080)?,
            trust_proxy: parse_env_usize("TRUST_PROXY", 1)?,

            // Runtime
            run_mode,
            log_level,
            application_info: env_or_default(
                "APPLICATION_INFO",
                "twitshot <https://github.com/allypost/twitter-screenshotter>",
            ),

            // Features
            enable_raw_screenshots: parse_feature_flag(optional_env("ENABLE_RAW_SCREENSHOTS")),

            // Rate limiting
            redis_url: optional_env("REDIS_URL"),
            rate_limit_window: Duration::from_secs(parse_env_u64("RATE_LIMIT_WINDOW_SECS", 60)?),
            rate_limit_delay_after: parse_env_u64("RATE_LIMIT_DELAY_AFTER", 60)?,
            rate_limit_delay: Duration::from_millis(parse_env_u64("RATE_LIMIT_DELAY_MS", 734)?),

            // Browser
            chrome_path: optional_env("CHROME_PATH"),

            // Upstream APIs
            twitter_syndication_url: env_or_default(
                "TWITTER_SYNDICATION_URL",
                "https://cdn.syndication.twimg.com",
            ),
            bsky_service_url: env_or_default("BSKY_SERVICE_URL", "https://public.api.bsky.app"),
            bsky_account_identifier: optional_env("BSKY_ACCOUNT_IDENTIFIER"),
            bsky_account_password: optional_env("BSKY_ACCOUNT_PASSWORD"),
            bsky_refresh_token: optional_env("BSKY_REFRESH_TOKEN"),
        })
    }

    /// Configuration with built-in defaults, independent of the environment.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            web_host: "127.0.0.1".to_string(),
            web_port: 0,
            trust_proxy: 0,
            run_mode: RunMode::Development,
            log_level: LogLevel::Debug,
            application_info: "twitshot-test".to_string(),
            enable_raw_screenshots: true,
            redis_url: None,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_delay_after: 60,
            rate_limit_delay: Duration::from_millis(734),
            chrome_path: None,
            twitter_syndication_url: "https://cdn.syndication.twimg.com".to_string(),
            bsky_service_url: "https://public.api.bsky.app".to_string(),
            bsky_account_identifier: None,
            bsky_account_password: None,
            bsky_refresh_token: None,
        }
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit_window.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "RATE_LIMIT_WINDOW_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        for (name, value) in [
            ("TWITTER_SYNDICATION_URL", &self.twitter_syndication_url),
            ("BSKY_SERVICE_URL", &self.bsky_service_url),
        ] {
            if let Err(e) = url::Url::parse(value) {
                return Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    message: format!("not a valid URL: {e}"),
                });
            }
        }
        if let Some(redis_url) = &self.redis_url {
            if url::Url::parse(redis_url).is_err() {
                return Err(ConfigError::InvalidValue {
                    name: "REDIS_URL".to_string(),
                    message: "not a valid URL".to_string(),
                });
            }
        }
        if self.bsky_account_identifier.is_some() != self.bsky_account_password.is_some() {
            return Err(ConfigError::InvalidValue {
                name: "BSKY_ACCOUNT_IDENTIFIER".to_string(),
                message: "identifier and password must be set together".to_string(),
            });
        }
        Ok(())
    }
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u16(name: &str, default: u16) -> Result<u16, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

/// Feature flags are on unless explicitly switched off.
fn parse_feature_flag(value: Option<String>) -> bool {
    value.map_or(true, |v| {
        !matches!(v.to_lowercase().as_str(), "false" | "f" | "0" | "no")
    })
}

fn parse_run_mode(value: &str) -> Result<RunMode, ConfigError> {
    match value.to_lowercase().as_str() {
        "development" | "dev" => Ok(RunMode::Development),
        "production" | "prod" => Ok(RunMode::Production),
        _ => Err(ConfigError::InvalidValue {
            name: "RUN_MODE".to_string(),
            message: format!("must be 'development' or 'production', got '{value}'"),
        }),
    }
}

fn parse_log_level(value: &str) -> Result<LogLevel, ConfigError> {
    match value.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(ConfigError::InvalidValue {
            name: "LOG_LEVEL".to_string(),
            message: format!("must be one of trace, debug, info, warn, error; got '{value}'"),
        }),
    }
}
