use crate::action::SoapAction;
use crate::cli::Cli;
use crate::error::SoapError;
use crate::tag_extractor::TagSets;
use crate::transport::{HttpTransportConfig, ReqwestTransport};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Trait for abstracting environment variable access
pub trait EnvProvider {
    fn get(&self, key: &str) -> Option<String>;
}

/// System environment variable provider for production use
pub struct SystemEnvProvider;

impl EnvProvider for SystemEnvProvider {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("JSON parsing error: {0}")]
    JsonParsing(#[from] serde_json::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable error: {0}")]
    Environment(String),

    #[error("Unsupported configuration file format: {0}")]
    UnsupportedFormat(String),
}

impl From<ConfigError> for SoapError {
    fn from(error: ConfigError) -> Self {
        SoapError::Config(error.to_string())
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

const CONFIG_NAMES: [&str; 4] = [
    "soap-stream.toml",
    "soap-stream.json",
    ".soap-stream.toml",
    ".soap-stream.json",
];

const MAX_LOAD_ATTEMPTS: u32 = 100;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub retry: RetryConfig,
    pub parsing: ParsingConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Time allowed until a response starts, in seconds
    pub timeout_seconds: u64,
    /// User agent string
    pub user_agent: String,
    /// How long idle connections are kept, in seconds
    pub pool_idle_timeout_seconds: u64,
}

/// Reload policy for failed connections
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total connection attempts per run
    pub load_attempts: u32,
    /// Delay before the last retry, in seconds
    pub max_timeout_seconds: f64,
}

/// Response consumption settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ParsingConfig {
    /// Deliver extraction events from a separate worker task
    pub parse_units_async: bool,
    /// Report runs to the activity pool
    pub network_activity_indicator: bool,
    pub unit_tags: Vec<String>,
    pub streaming_tags: Vec<String>,
    pub ordered_special_tags: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            user_agent: format!("soap-stream/{}", env!("CARGO_PKG_VERSION")),
            pool_idle_timeout_seconds: 30,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            load_attempts: 1,
            max_timeout_seconds: 30.0,
        }
    }
}

impl Default for ParsingConfig {
    fn default() -> Self {
        Self {
            parse_units_async: false,
            network_activity_indicator: true,
            unit_tags: vec![],
            streaming_tags: vec![],
            ordered_special_tags: vec![],
        }
    }
}

impl NetworkConfig {
    pub fn transport_config(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            timeout_seconds: self.timeout_seconds,
            user_agent: self.user_agent.clone(),
            pool_idle_timeout_seconds: self.pool_idle_timeout_seconds,
        }
    }

    /// Build the HTTP transport described by this configuration
    pub fn transport(&self) -> Result<ReqwestTransport, SoapError> {
        Ok(ReqwestTransport::new(self.transport_config())?)
    }
}

impl RetryConfig {
    /// Values too large for a [`Duration`] saturate; `validate_config` rejects them
    pub fn max_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.max_timeout_seconds.max(0.0)).unwrap_or(Duration::MAX)
    }
}

impl ParsingConfig {
    pub fn tag_sets(&self) -> TagSets {
        TagSets {
            unit_tags: self.unit_tags.clone(),
            streaming_tags: self.streaming_tags.clone(),
            ordered_special_tags: self.ordered_special_tags.clone(),
        }
    }
}

impl Config {
    /// Copy retry and parsing settings onto an action
    pub fn apply_to(&self, action: &mut SoapAction) {
        action.load_attempts = self.retry.load_attempts;
        action.max_timeout = self.retry.max_timeout();
        action.tags = self.parsing.tag_sets();
        action.parse_units_asynchronously = self.parsing.parse_units_async;
        action.network_activity_indicator = self.parsing.network_activity_indicator;
    }
}

/// Configuration manager for loading and merging configurations
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration with precedence: defaults -> file -> environment -> CLI
    pub async fn load_config(cli: &Cli) -> ConfigResult<Config> {
        let mut config = Config::default();

        if let Some(config_path) = &cli.config {
            config = Self::load_from_file(config_path).await?;
        } else if let Some(found_config) = Self::find_config_file().await? {
            config = found_config;
        }

        config = Self::apply_environment_overrides(config)?;

        // CLI arguments have the highest precedence
        config = Self::merge_with_cli(config, cli);

        Self::validate_config(&config)?;

        Ok(config)
    }

    /// Load configuration from a file (TOML or JSON)
    ///
    /// Sections and keys missing from the file keep their defaults.
    pub async fn load_from_file(path: &Path) -> ConfigResult<Config> {
        let content = tokio::fs::read_to_string(path).await?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(toml::from_str(&content)?),
            Some("json") => Ok(serde_json::from_str(&content)?),
            Some(ext) => Err(ConfigError::UnsupportedFormat(ext.to_string())),
            None => {
                // Try to parse as TOML first, then JSON
                if let Ok(config) = toml::from_str::<Config>(&content) {
                    Ok(config)
                } else {
                    Ok(serde_json::from_str(&content)?)
                }
            }
        }
    }

    /// Find configuration file in standard locations
    pub async fn find_config_file() -> ConfigResult<Option<Config>> {
        match Self::locate_config_file(Path::new("."), dirs::config_dir().as_deref()) {
            Some(path) => Ok(Some(Self::load_from_file(&path).await?)),
            None => Ok(None),
        }
    }

    /// First configuration file in `current_dir`, then in `config_dir/soap-stream`
    pub fn locate_config_file(current_dir: &Path, config_dir: Option<&Path>) -> Option<PathBuf> {
        let local = CONFIG_NAMES.iter().map(|name| current_dir.join(name));
        let user = config_dir
            .map(|dir| dir.join("soap-stream"))
            .into_iter()
            .flat_map(|dir| CONFIG_NAMES.iter().map(move |name| dir.join(name)));

        local.chain(user).find(|path| path.is_file())
    }

    /// Apply environment variable overrides using the system environment
    pub fn apply_environment_overrides(config: Config) -> ConfigResult<Config> {
        Self::apply_environment_overrides_with(&SystemEnvProvider, config)
    }

    /// Apply environment variable overrides with a custom environment provider
    pub fn apply_environment_overrides_with(
        env: &impl EnvProvider,
        mut config: Config,
    ) -> ConfigResult<Config> {
        // Network settings
        if let Some(timeout) = env.get("SOAP_STREAM_TIMEOUT") {
            config.network.timeout_seconds = parse_env("SOAP_STREAM_TIMEOUT", &timeout)?;
        }

        if let Some(user_agent) = env.get("SOAP_STREAM_USER_AGENT") {
            config.network.user_agent = user_agent;
        }

        // Retry settings
        if let Some(attempts) = env.get("SOAP_STREAM_LOAD_ATTEMPTS") {
            config.retry.load_attempts = parse_env("SOAP_STREAM_LOAD_ATTEMPTS", &attempts)?;
        }

        if let Some(max_timeout) = env.get("SOAP_STREAM_MAX_TIMEOUT") {
            config.retry.max_timeout_seconds = parse_env("SOAP_STREAM_MAX_TIMEOUT", &max_timeout)?;
        }

        // Parsing settings
        if let Some(parse_async) = env.get("SOAP_STREAM_PARSE_ASYNC") {
            config.parsing.parse_units_async = parse_env("SOAP_STREAM_PARSE_ASYNC", &parse_async)?;
        }

        if let Some(tags) = env.get("SOAP_STREAM_UNIT_TAGS") {
            config.parsing.unit_tags = split_list(&tags);
        }

        if let Some(tags) = env.get("SOAP_STREAM_STREAMING_TAGS") {
            config.parsing.streaming_tags = split_list(&tags);
        }

        if let Some(tags) = env.get("SOAP_STREAM_ORDERED_TAGS") {
            config.parsing.ordered_special_tags = split_list(&tags);
        }

        Ok(config)
    }

    /// Merge CLI arguments with configuration (CLI takes precedence)
    pub fn merge_with_cli(mut config: Config, cli: &Cli) -> Config {
        if let Some(timeout) = cli.timeout {
            config.network.timeout_seconds = timeout;
        }

        if let Some(attempts) = cli.attempts {
            config.retry.load_attempts = attempts;
        }
        if let Some(max_timeout) = cli.max_timeout {
            config.retry.max_timeout_seconds = max_timeout;
        }

        if cli.async_parse {
            config.parsing.parse_units_async = true;
        }
        if !cli.unit_tags.is_empty() {
            config.parsing.unit_tags = cli.unit_tags.clone();
        }
        if !cli.streaming_tags.is_empty() {
            config.parsing.streaming_tags = cli.streaming_tags.clone();
        }
        if !cli.ordered_tags.is_empty() {
            config.parsing.ordered_special_tags = cli.ordered_tags.clone();
        }

        config
    }

    /// Validate configuration values
    pub fn validate_config(config: &Config) -> ConfigResult<()> {
        if config.network.timeout_seconds == 0 {
            return Err(ConfigError::Validation(
                "Timeout must be greater than 0".to_string(),
            ));
        }

        if config.retry.load_attempts > MAX_LOAD_ATTEMPTS {
            return Err(ConfigError::Validation(format!(
                "Load attempts cannot exceed {}",
                MAX_LOAD_ATTEMPTS
            )));
        }

        let max_timeout = config.retry.max_timeout_seconds;
        if !max_timeout.is_finite()
            || max_timeout < 0.0
            || Duration::try_from_secs_f64(max_timeout).is_err()
        {
            return Err(ConfigError::Validation(format!(
                "Invalid maximum timeout: {}",
                max_timeout
            )));
        }

        let parsing = &config.parsing;
        for tag in parsing
            .unit_tags
            .iter()
            .chain(&parsing.streaming_tags)
            .chain(&parsing.ordered_special_tags)
        {
            if tag.is_empty()
                || tag
                    .chars()
                    .any(|c| c.is_whitespace() || matches!(c, '<' | '>' | '/'))
            {
                return Err(ConfigError::Validation(format!("Invalid tag name: '{}'", tag)));
            }
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Environment(format!("Invalid {} value: {}", key, value)))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
