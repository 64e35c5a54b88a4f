//! Configuration types.
//!
//! Settings are read once at startup from the process environment (after an
//! optional `.env` file has been loaded by `main`). Keys are matched
//! case-insensitively: the upper-case name wins, the lower-case name is a
//! fallback.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use secrecy::SecretString;
use tracing::Level;

use crate::error::ConfigError;

/// Queue the worker consumes card application requests from.
pub const CARD_REQUEST_QUEUE: &str = "card_application_requests";

/// Default directory for the rotating log file.
const DEFAULT_LOG_DIR: &str = "logs";

/// Verbosity of the worker's logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    #[default]
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// The tracing level this setting maps to. `Critical` has no tracing
    /// counterpart and is treated as `ERROR`.
    pub fn as_tracing_level(self) -> Level {
        match self {
            Self::Debug => Level::DEBUG,
            Self::Info => Level::INFO,
            Self::Warning => Level::WARN,
            Self::Error | Self::Critical => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARNING" | "WARN" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(format!(
                "unknown log level {other:?} (expected DEBUG, INFO, WARNING, ERROR or CRITICAL)"
            )),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

/// Connection parameters for the message broker.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub vhost: String,
    /// Exchange approval notifications are published to.
    pub exchange: String,
    /// Routing key for approval notifications.
    pub approval_routing_key: String,
}

/// Read-only worker settings, loaded once at process start.
#[derive(Debug, Clone)]
pub struct Settings {
    pub broker: BrokerSettings,
    /// Absolute `http://` or `https://` URL of the card-generation service.
    pub card_generation_url: String,
    pub log_level: LogLevel,
    pub log_dir: PathBuf,
    /// Upper bound on delivery attempts before a rejected message is no
    /// longer requeued. `None` requeues forever.
    pub max_deliveries: Option<u32>,
}

impl Settings {
    /// Build settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let broker = BrokerSettings {
            host: env.required("RABBITMQ_HOST")?,
            port: env.parsed("RABBITMQ_PORT")?,
            username: env.required("RABBITMQ_USERNAME")?,
            password: SecretString::from(env.required("RABBITMQ_PASSWORD")?),
            vhost: env.required("RABBITMQ_VHOST")?,
            exchange: env.required("RABBITMQ_EXCHANGE")?,
            approval_routing_key: env.required("RABBITMQ_APPROVAL_ROUTING_KEY")?,
        };

        let card_generation_url = env.required("CARD_GENERATION_URL")?;
        validate_url("CARD_GENERATION_URL", &card_generation_url)?;

        let log_level = match env.optional("LOG_LEVEL") {
            Some(raw) => raw
                .parse::<LogLevel>()
                .map_err(|message| ConfigError::InvalidValue {
                    key: "LOG_LEVEL".to_string(),
                    message,
                })?,
            None => LogLevel::default(),
        };

        let log_dir = env
            .optional("LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));

        let max_deliveries = match env.optional("MAX_DELIVERIES") {
            Some(_) => {
                let max: u32 = env.parsed("MAX_DELIVERIES")?;
                if max == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "MAX_DELIVERIES".to_string(),
                        message: "must be at least 1".to_string(),
                    });
                }
                Some(max)
            }
            None => None,
        };

        Ok(Self {
            broker,
            card_generation_url,
            log_level,
            log_dir,
            max_deliveries,
        })
    }
}

fn validate_url(key: &str, url: &str) -> Result<(), ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must start with http:// or https://".to_string(),
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .or_else(|| (self.lookup)(&key.to_ascii_lowercase()))
            .filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn parsed<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.required(key)?
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })
    }
}
