//! Common CLI flags for logging, and installing the global subscriber from them.

use std::{fmt::Display, str::FromStr};

use snafu::{ResultExt, Snafu};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::writer::BoxMakeWriter,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

/// Filter applied when neither `--log-filter` nor `-v` is given.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Third party targets that are far too chatty at debug and trace level.
const QUIET_TARGETS: &str = "hyper=info,h2=info,aws_smithy_runtime=info,aws_config=info";

#[derive(Debug, Snafu)]
pub enum LoggingError {
    #[snafu(display("Invalid log filter {:?}: {}", filter, source))]
    InvalidLogFilter {
        filter: String,
        source: tracing_subscriber::filter::ParseError,
    },

    #[snafu(display("Unable to install the global log subscriber: {}", source))]
    InstallSubscriber { source: TryInitError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Full,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Invalid log format '{s}'. Valid options: full, pretty, json"
            )),
        }
    }
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDestination {
    Stdout,
    Stderr,
}

impl FromStr for LogDestination {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            _ => Err(format!(
                "Invalid log destination '{s}'. Valid options: stdout, stderr"
            )),
        }
    }
}

impl Display for LogDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// CLI config for the logging related subset of options.
#[derive(Debug, Clone, clap::Parser)]
pub struct LoggingConfig {
    /// Logs: filter directive
    ///
    /// Configures log severity level filter, by target.
    ///
    /// Simplest options: error, warn, info, debug, trace
    ///
    /// Levels for different modules can be specified. For example
    /// `debug,aws_smithy_runtime=info` specifies debug logging for all modules except for the
    /// AWS client runtime, which only logs at info level.
    ///
    /// Extended syntax provided by `tracing-subscriber` includes span/field filters. See
    /// <https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html>
    /// for more details.
    ///
    /// Overridden by `-v`.
    #[clap(long = "log-filter", env = "LOG_FILTER", action)]
    pub log_filter: Option<String>,

    /// Logs: filter short-hand
    ///
    /// Convenient way to set log severity level filter. Overrides `--log-filter`.
    ///
    /// -v   'info'
    ///
    /// -vv  'debug' with quiet AWS and HTTP client internals
    ///
    /// -vvv 'trace' with quiet AWS and HTTP client internals
    #[clap(
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count,
        verbatim_doc_comment
    )]
    pub log_verbose_count: u8,

    /// Logs: destination
    ///
    /// Can be one of: stdout, stderr
    #[clap(
        long = "log-destination",
        env = "LOG_DESTINATION",
        default_value = "stdout",
        action
    )]
    pub log_destination: LogDestination,

    /// Logs: message format
    ///
    /// Can be one of:
    ///
    /// full: human-readable, single line
    ///
    /// pretty: human-readable, multi line
    ///
    /// json: machine-parseable, one object per line
    #[clap(
        long = "log-format",
        env = "LOG_FORMAT",
        default_value = "full",
        action
    )]
    pub log_format: LogFormat,
}

impl LoggingConfig {
    /// The filter directive in effect, `-v` taking precedence over `--log-filter`.
    pub fn filter_directive(&self) -> String {
        match self.log_verbose_count {
            0 => self
                .log_filter
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            1 => "info".to_string(),
            2 => format!("debug,{QUIET_TARGETS}"),
            _ => format!("trace,{QUIET_TARGETS}"),
        }
    }

    /// Install the global tracing subscriber. Fails if one is already installed.
    pub fn install_global_subscriber(&self) -> Result<(), LoggingError> {
        let filter = self.filter_directive();
        let env_filter =
            EnvFilter::try_new(&filter).context(InvalidLogFilterSnafu { filter: &filter })?;

        let writer = match self.log_destination {
            LogDestination::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogDestination::Stderr => BoxMakeWriter::new(std::io::stderr),
        };
        let fmt_layer = tracing_subscriber::fmt::layer().with_writer(writer);
        let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match self.log_format {
            LogFormat::Full => Box::new(fmt_layer),
            LogFormat::Pretty => Box::new(fmt_layer.pretty()),
            LogFormat::Json => Box::new(fmt_layer.json()),
        };

        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(env_filter)
            .try_init()
            .context(InstallSubscriberSnafu)
    }
}
