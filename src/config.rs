//! Functions and structures related to configuring a Stampede load test.
//!
//! Stampede is configured at run time by passing in the options and flags defined
//! by the [`Configuration`] structure. A load test can also set a default host
//! and wait time on its [`Catalog`](../catalog/struct.Catalog.html); command line
//! options always win.

use gumdrop::Options;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::path::PathBuf;

use crate::util;
use crate::StampedeError;

/// The environment variable consulted for the bearer token when `--token-env`
/// is not otherwise configured.
pub const DEFAULT_TOKEN_VARIABLE: &str = "STAMPEDE_TOKEN";

/// Runtime options available when launching a Stampede load test.
///
/// Help is generated for all of these options by passing a `-h` flag to an
/// application built with the Stampede library.
///
/// Stampede leverages [`gumdrop`](https://docs.rs/gumdrop/) to derive the help
/// from the below structure.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"Stampede is a synthetic traffic generator for authenticated HTTP(S) APIs,
written in Rust and inspired by Locust.

The following runtime options are available when launching a load test:"#
)]
pub struct Configuration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V")]
    pub version: bool,
    /// Lists all tasks in the catalog and exits
    // Add a blank line after this option
    #[options(short = "l", help = "Lists all tasks in the catalog and exits\n")]
    pub list: bool,

    /// Defines host to load test (ie http://10.21.32.33)
    #[options(short = "H")]
    pub host: String,
    /// Sets concurrent users (default: 1)
    #[options(short = "u")]
    pub users: Option<usize>,
    /// Sets per-second user hatch rate (default: 1)
    #[options(short = "r", meta = "RATE")]
    pub hatch_rate: Option<usize>,
    /// Stops load test after (30s, 20m, 3h, 1h30m, etc)
    #[options(short = "t", meta = "TIME")]
    pub run_time: String,
    /// Sets minimum pause between tasks in milliseconds
    #[options(no_short, meta = "MS")]
    pub min_wait: Option<usize>,
    /// Sets maximum pause between tasks in milliseconds
    // Add a blank line and then a 'Session:' header after this option
    #[options(
        no_short,
        meta = "MS",
        help = "Sets maximum pause between tasks in milliseconds\n\nSession:"
    )]
    pub max_wait: Option<usize>,

    /// Names the environment variable holding the bearer token
    #[options(no_short, meta = "NAME")]
    pub token_env: String,
    /// Verifies each new session with an authenticated GET of PATH
    // Add a blank line and then a 'Metrics:' header after this option
    #[options(
        no_short,
        meta = "PATH",
        help = "Verifies each new session with an authenticated GET of PATH\n\nMetrics:"
    )]
    pub verify_path: String,

    /// Doesn't track metrics
    #[options(no_short)]
    pub no_metrics: bool,
    /// Tracks additional status code metrics
    #[options(no_short)]
    pub status_codes: bool,
    /// How often to print running metrics (seconds)
    // Add a blank line and then a 'Logging:' header after this option
    #[options(
        no_short,
        meta = "TIME",
        help = "How often to print running metrics (seconds)\n\nLogging:"
    )]
    pub running_metrics: Option<usize>,

    /// Enables log file and sets name
    #[options(no_short, meta = "NAME")]
    pub log_file: String,
    /// Increases log file verbosity (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases console verbosity (-q, -qq, etc)
    #[options(count, short = "q")]
    pub quiet: u8,
    /// Increases console verbosity (-v, -vv, etc)
    #[options(count, short = "v")]
    pub verbose: u8,
}

impl Configuration {
    /// The name of the environment variable the bearer token is read from.
    ///
    /// Tokens are deliberately only accepted through the environment so they
    /// stay out of shell history and process listings.
    pub fn token_variable(&self) -> &str {
        if self.token_env.is_empty() {
            DEFAULT_TOKEN_VARIABLE
        } else {
            &self.token_env
        }
    }

    /// Confirm the configuration is internally consistent.
    pub(crate) fn validate(&self) -> Result<(), StampedeError> {
        // An empty host may still be provided by the catalog; a set host must
        // parse.
        if !self.host.is_empty() {
            util::is_valid_host(&self.host)?;
        }

        if let Some(users) = self.users {
            if users == 0 {
                return Err(StampedeError::InvalidOption {
                    option: "--users".to_string(),
                    value: users.to_string(),
                    detail: "The --users option must be set to at least 1.".to_string(),
                });
            }
        }

        if let Some(hatch_rate) = self.hatch_rate {
            if hatch_rate == 0 {
                return Err(StampedeError::InvalidOption {
                    option: "--hatch-rate".to_string(),
                    value: hatch_rate.to_string(),
                    detail: "The --hatch-rate option must be set to at least 1.".to_string(),
                });
            }
        }

        // Wait bounds set on the command line must be consistent with each other.
        // Bounds inherited from the catalog were validated when the catalog was
        // built; mixed bounds are validated once resolved.
        if let (Some(min_wait), Some(max_wait)) = (self.min_wait, self.max_wait) {
            if min_wait > max_wait {
                return Err(StampedeError::InvalidWaitTime {
                    min_wait,
                    max_wait,
                    detail: "The --min-wait option can not be larger than the --max-wait option."
                        .to_string(),
                });
            }
        }

        if let Some(running_metrics) = self.running_metrics {
            if running_metrics == 0 {
                return Err(StampedeError::InvalidOption {
                    option: "--running-metrics".to_string(),
                    value: running_metrics.to_string(),
                    detail: "The --running-metrics option must be set to at least 1 second."
                        .to_string(),
                });
            }
            if self.no_metrics {
                return Err(StampedeError::InvalidOption {
                    option: "--running-metrics".to_string(),
                    value: running_metrics.to_string(),
                    detail: "The --running-metrics option can not be set together with --no-metrics."
                        .to_string(),
                });
            }
        }

        Ok(())
    }

    /// Initialize the logger, writing to standard out and optionally to a
    /// configurable log file.
    pub(crate) fn initialize_logger(&self) {
        // Configure console output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure log file level.
        let log_level = match self.log_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Open the log file if configured.
        let log_file: Option<PathBuf> = if !self.log_file.is_empty() {
            Some(PathBuf::from(&self.log_file))
        // Otherwise disable the log.
        } else {
            None
        };

        if let Some(log_to_file) = log_file {
            let file = match std::fs::File::create(&log_to_file) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("failed to create log file {}: {}", log_to_file.display(), e);
                    return;
                }
            };
            match CombinedLogger::init(vec![
                SimpleLogger::new(debug_level, Config::default()),
                WriteLogger::new(log_level, Config::default(), file),
            ]) {
                Ok(_) => (),
                Err(e) => {
                    info!("failed to initialize CombinedLogger: {}", e);
                }
            }
            info!("Writing to log file: {}", log_to_file.display());
        } else {
            match CombinedLogger::init(vec![SimpleLogger::new(debug_level, Config::default())]) {
                Ok(_) => (),
                Err(e) => {
                    info!("failed to initialize CombinedLogger: {}", e);
                }
            }
        }

        info!("Output verbosity level: {}", debug_level);
        info!("Logfile verbosity level: {}", log_level);
    }
}
