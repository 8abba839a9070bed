//! CLI argument parsing module
//!
//! Handles command-line argument parsing using `clap` derive macros and turns
//! the raw strings into a validated [`TraceRequest`].
//!
//! Every flag is accepted with one or two dashes (`-trace k1` and
//! `--trace k1`, `-end=...` and `--end=...`); see [`normalize_args`].

use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;

use crate::error::TracerError;
use crate::headless::TraceRequest;

/// Command-line arguments for the tracer.
///
/// # Example
///
/// ```rust,ignore
/// use mqtt_tracer::cli::Args;
///
/// let args = Args::parse_normalized();
/// let request = args.to_request()?;
/// ```
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "mqtt-tracer")]
#[command(about = "Record MQTT messages on a set of topic filters during a time window")]
#[command(version)]
pub struct Args {
    /// Trace key; names the trace and its stored records
    #[arg(long = "trace", value_name = "KEY")]
    pub trace: Option<String>,

    /// Comma-separated topic filters, e.g. "sensors/#,alerts/+"
    #[arg(long, value_name = "FILTERS")]
    pub topics: Option<String>,

    /// Broker profile from the config file (default: default_profile, else the first)
    #[arg(long)]
    pub profile: Option<String>,

    /// Start time (RFC 3339); default: now
    #[arg(long, value_name = "TIME")]
    pub start: Option<String>,

    /// End time (RFC 3339); default: record until interrupted
    #[arg(long, value_name = "TIME")]
    pub end: Option<String>,

    /// Config file holding the broker profiles (default: ~/.emqutiti/config.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// Long flags that may also be spelled with a single dash.
const FLAGS: [&str; 6] = ["trace", "topics", "profile", "start", "end", "config"];

/// Rewrite single-dash spellings of the long flags to their `--` form.
///
/// Covers `-flag value` and `-flag=value`. Values, unknown flags and
/// everything after a bare `--` pass through unchanged.
pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let mut after_separator = false;
    args.into_iter()
        .map(Into::into)
        .map(|arg| {
            if after_separator {
                return arg;
            }
            let Some(text) = arg.to_str() else {
                return arg;
            };
            if text == "--" {
                after_separator = true;
                return arg;
            }
            let single_dash = text.strip_prefix('-').filter(|rest| !rest.starts_with('-'));
            match single_dash {
                Some(rest) if FLAGS.contains(&rest.split('=').next().unwrap_or_default()) => {
                    OsString::from(format!("-{}", text))
                }
                _ => arg,
            }
        })
        .collect()
}

impl Args {
    /// Parse the process arguments, accepting single-dash long flags.
    pub fn parse_normalized() -> Self {
        Self::parse_from(normalize_args(std::env::args_os()))
    }

    /// Validate argument combinations.
    ///
    /// Only checks presence; value syntax is checked by [`Args::to_request`].
    pub fn validate(&self) -> Result<(), String> {
        let missing = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
        if missing(&self.trace) || missing(&self.topics) {
            return Err("--trace and --topics are required".to_string());
        }
        Ok(())
    }

    /// Build the trace request these arguments describe.
    pub fn to_request(&self) -> Result<TraceRequest, TracerError> {
        self.validate().map_err(TracerError::Config)?;
        let mut request = TraceRequest::parse(
            self.trace.as_deref().unwrap_or_default(),
            self.topics.as_deref().unwrap_or_default(),
            self.start.as_deref(),
            self.end.as_deref(),
        )?;
        request.profile = self.profile.clone().filter(|p| !p.is_empty());
        request.config_file = self.config.clone();
        Ok(request)
    }
}
