use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Verbosity levels for output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum VerbosityLevel {
    /// Only warnings and errors
    Quiet,
    /// Run summaries
    #[default]
    Normal,
    /// Attempts, retries and fragment traces
    Verbose,
}

impl VerbosityLevel {
    /// Default `tracing` filter directive when `RUST_LOG` is unset
    pub fn filter_directive(&self) -> &'static str {
        match self {
            VerbosityLevel::Quiet => "warn",
            VerbosityLevel::Normal => "info",
            VerbosityLevel::Verbose => "debug",
        }
    }
}

/// Streaming SOAP client
#[derive(Parser, Debug, Clone)]
#[command(name = "soap-stream")]
#[command(about = "Call a SOAP service and stream units out of the response as it arrives")]
#[command(version)]
pub struct Cli {
    /// Service endpoint
    #[arg(short = 'u', long = "url")]
    pub url: String,

    /// SOAP action name; also the element wrapping the parameters
    #[arg(short = 'a', long = "action")]
    pub action: String,

    /// Namespace of the action element
    #[arg(long = "namespace")]
    pub namespace: Option<String>,

    /// Action parameter as key=value (repeatable, order kept)
    #[arg(short = 'p', long = "param", action = clap::ArgAction::Append)]
    pub params: Vec<String>,

    /// Tag whose closed subtrees are printed as units
    #[arg(long = "unit-tag", action = clap::ArgAction::Append)]
    pub unit_tags: Vec<String>,

    /// Tag whose text is printed chunk by chunk
    #[arg(long = "streaming-tag", action = clap::ArgAction::Append)]
    pub streaming_tags: Vec<String>,

    /// Tag delivered in close order
    #[arg(long = "ordered-tag", action = clap::ArgAction::Append)]
    pub ordered_tags: Vec<String>,

    /// Total connection attempts
    #[arg(long = "attempts")]
    pub attempts: Option<u32>,

    /// Delay before the last retry, in seconds
    #[arg(long = "max-timeout")]
    pub max_timeout: Option<f64>,

    /// Time allowed until the response starts, in seconds
    #[arg(long = "timeout")]
    pub timeout: Option<u64>,

    /// Deliver units from a separate worker task
    #[arg(long = "async-parse")]
    pub async_parse: bool,

    /// User name answered to authentication challenges
    #[arg(long = "username", requires = "password")]
    pub username: Option<String>,

    /// Password answered to authentication challenges
    #[arg(long = "password", requires = "username")]
    pub password: Option<String>,

    /// Configuration file (TOML or JSON)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", help = "Enable verbose output")]
    pub verbose: bool,

    /// Enable quiet mode (warnings and errors only)
    #[arg(
        short = 'q',
        long = "quiet",
        help = "Quiet mode",
        conflicts_with = "verbose"
    )]
    pub quiet: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Parameters split into ordered key/value pairs
    pub fn get_parameters(&self) -> Result<Vec<(String, String)>, String> {
        self.params
            .iter()
            .map(|param| match param.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    Ok((key.trim().to_string(), value.to_string()))
                }
                _ => Err(format!("Invalid parameter '{}', expected key=value", param)),
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.action.trim().is_empty() {
            return Err("SOAP action must not be empty".to_string());
        }
        if let Some(max_timeout) = self.max_timeout
            && Duration::try_from_secs_f64(max_timeout).is_err()
        {
            return Err(format!("Invalid maximum timeout: {}", max_timeout));
        }
        self.get_parameters()?;
        Ok(())
    }

    pub fn verbosity(&self) -> VerbosityLevel {
        if self.quiet {
            VerbosityLevel::Quiet
        } else if self.verbose {
            VerbosityLevel::Verbose
        } else {
            VerbosityLevel::Normal
        }
    }
}
