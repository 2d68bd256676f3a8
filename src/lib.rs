//! # Stampede
//!
//! Stampede is a synthetic traffic generator for authenticated HTTP(S) APIs,
//! inspired by [Locust](https://locust.io/). A load test is a small Cargo
//! application that declares a [`Catalog`](catalog/struct.Catalog.html) of
//! weighted [`TaskDescriptor`](catalog/struct.TaskDescriptor.html)s and hands
//! it to [`Stampede::execute`], which owns everything else: hatching virtual
//! users, deriving an authenticated [`Session`](session/struct.Session.html)
//! per user, pacing tasks with random inclusive pauses, and collecting
//! [`Metrics`](metrics/struct.Metrics.html).
//!
//! Stampede uses [`reqwest`](https://docs.rs/reqwest/) to provide a convenient
//! HTTP client.
//!
//! ## Creating a load test
//!
//! ```rust,no_run
//! use stampede::prelude::*;
//! use serde_json::json;
//!
//! fn main() -> Result<(), StampedeError> {
//!     let metrics = Stampede::initialize()?
//!         .register_catalog(
//!             Catalog::new("StorefrontUser")
//!                 // After each task, pause randomly from 1 to 5 seconds.
//!                 .set_wait_time(1_000, 5_000)?
//!                 .register_task(
//!                     TaskDescriptor::post(
//!                         "/api/v1/cart/add",
//!                         json!({"product_id": "123", "quantity": 1}),
//!                     )
//!                     // Aggregate under one metric key, whatever the path.
//!                     .set_name("/api/cart/add")
//!                     .set_weight(2)?,
//!                 )
//!                 .register_task(
//!                     TaskDescriptor::get("/api/v1/checkout").set_name("/api/checkout"),
//!                 ),
//!         )
//!         .execute()?;
//!     metrics.print();
//!
//!     Ok(())
//! }
//! ```
//!
//! Point the test at a host and give it a token, then launch it:
//!
//! ```bash
//! $ export STAMPEDE_TOKEN=...
//! $ cargo run --release -- --host https://shop.example.com -u 10 -t 5m
//! ```
//!
//! Each virtual user derives its session from the token exactly once, before
//! its first task; tasks then run in a weighted order, with metrics streaming
//! back to the parent for the end-of-run summary tables.

#[macro_use]
extern crate log;

pub mod catalog;
pub mod config;
pub mod metrics;
pub mod prelude;
pub mod session;
pub mod user;
pub mod util;

use gumdrop::Options;
use lazy_static::lazy_static;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use std::time::Duration;
use std::{fmt, io, time};
use tokio::runtime::Runtime;

use crate::catalog::Catalog;
use crate::config::Configuration;
use crate::metrics::{Metrics, RequestMetric};
use crate::session::Session;
use crate::user::{AttackUser, UserCommand};

lazy_static! {
    // Set by the ctrl-c handler; checked by the run loop.
    static ref CANCELED: AtomicBool = AtomicBool::new(false);
}

/// An enumeration of all errors a [`Stampede`] load test can return.
#[derive(Debug)]
pub enum StampedeError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a [`tokio::task::JoinError`](https://docs.rs/tokio/*/tokio/task/struct.JoinError.html).
    TokioJoin(tokio::task::JoinError),
    /// Failed to parse a hostname.
    InvalidHost {
        /// The invalid hostname that caused this error.
        host: String,
        /// An optional explanation of the error.
        detail: String,
        /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
        parse_error: url::ParseError,
    },
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid wait time specified.
    InvalidWaitTime {
        /// The specified minimum wait time, in milliseconds.
        min_wait: usize,
        /// The specified maximum wait time, in milliseconds.
        max_wait: usize,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid weight specified.
    InvalidWeight {
        /// The specified weight.
        weight: usize,
        /// An optional explanation of the error.
        detail: String,
    },
    /// The bearer token could not be used to derive session headers.
    InvalidToken {
        /// An optional explanation of the error.
        detail: String,
    },
    /// No bearer token was found in the configured environment variable.
    MissingToken {
        /// The environment variable that was consulted.
        variable: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// [`Stampede`] has no [`Catalog`](catalog/struct.Catalog.html) with tasks defined.
    NoCatalog {
        /// An optional explanation of the error.
        detail: String,
    },
}

/// Implement a helper to provide a text description of all possible types of errors.
impl StampedeError {
    fn describe(&self) -> &str {
        match *self {
            StampedeError::Io(_) => "io::Error",
            StampedeError::Reqwest(_) => "reqwest::Error",
            StampedeError::TokioJoin(_) => "tokio::task::JoinError",
            StampedeError::InvalidHost { .. } => "failed to parse hostname",
            StampedeError::InvalidOption { .. } => "invalid option or value specified",
            StampedeError::InvalidWaitTime { .. } => "invalid wait_time specified",
            StampedeError::InvalidWeight { .. } => "invalid weight specified",
            StampedeError::InvalidToken { .. } => "invalid bearer token",
            StampedeError::MissingToken { .. } => "no bearer token provisioned",
            StampedeError::NoCatalog { .. } => "no catalog with tasks defined",
        }
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for StampedeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            StampedeError::Io(ref source) => {
                write!(f, "StampedeError: {} ({})", self.describe(), source)
            }
            StampedeError::Reqwest(ref source) => {
                write!(f, "StampedeError: {} ({})", self.describe(), source)
            }
            StampedeError::TokioJoin(ref source) => {
                write!(f, "StampedeError: {} ({})", self.describe(), source)
            }
            StampedeError::InvalidHost {
                ref parse_error, ..
            } => write!(f, "StampedeError: {} ({})", self.describe(), parse_error),
            _ => write!(f, "StampedeError: {}", self.describe()),
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for StampedeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            StampedeError::Io(ref source) => Some(source),
            StampedeError::Reqwest(ref source) => Some(source),
            StampedeError::TokioJoin(ref source) => Some(source),
            StampedeError::InvalidHost {
                ref parse_error, ..
            } => Some(parse_error),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for StampedeError {
    fn from(err: reqwest::Error) -> StampedeError {
        StampedeError::Reqwest(err)
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for StampedeError {
    fn from(err: io::Error) -> StampedeError {
        StampedeError::Io(err)
    }
}

/// Auto-convert TokioJoin errors.
impl From<tokio::task::JoinError> for StampedeError {
    fn from(err: tokio::task::JoinError) -> StampedeError {
        StampedeError::TokioJoin(err)
    }
}

/// A load test moves through each of the following phases during a complete run.
#[derive(Clone, Debug, PartialEq)]
pub enum RunPhase {
    /// Users are hatching and beginning to generate load.
    Starting,
    /// All users have hatched and are generating load.
    Running,
    /// Users are stopping.
    Stopping,
}

/// Internal global run state for the load test.
struct RunState {
    /// A timestamp tracking when the previous user was launched.
    spawn_user_timer: time::Instant,
    /// How many milliseconds until the next user should be spawned.
    spawn_user_in_ms: usize,
    /// This variable accounts for time spent doing things which is then
    /// subtracted from the time sleeping to avoid an unintentional drift in
    /// events that are supposed to happen regularly.
    drift_timer: tokio::time::Instant,
    /// Unbounded sender cloned into all user threads to stream metrics to the
    /// parent.
    all_threads_metrics_tx: flume::Sender<RequestMetric>,
    /// Unbounded receiver used by the parent to receive metrics from users.
    metrics_rx: flume::Receiver<RequestMetric>,
    /// Collection of all user threads so they can be stopped later.
    users: Vec<tokio::task::JoinHandle<()>>,
    /// All unbounded senders to allow communication with user threads.
    user_channels: Vec<flume::Sender<UserCommand>>,
    /// Timer tracking when to next display running metrics, if enabled.
    running_metrics_timer: time::Instant,
    /// Boolean flag indicating if all users have been spawned.
    all_users_spawned: bool,
}

/// Global internal state for the load test.
///
/// Created with [`Stampede::initialize`], configured with a
/// [`Catalog`](catalog/struct.Catalog.html), and consumed by
/// [`Stampede::execute`].
pub struct Stampede {
    /// Configuration loaded from the command line.
    pub configuration: Configuration,
    /// The catalog of tasks virtual users run.
    catalog: Option<Catalog>,
    /// Pre-allocated states for each user that will be hatched.
    weighted_users: Vec<AttackUser>,
    /// Total run time in seconds, parsed from `--run-time`; 0 runs until
    /// interrupted.
    run_time: usize,
    /// Which phase the load test is currently in.
    attack_phase: RunPhase,
    /// All metrics merged together.
    metrics: Metrics,
}

impl Stampede {
    /// Load configuration from the command line and initialize the load test.
    ///
    /// # Example
    /// ```rust,no_run
    /// use stampede::prelude::*;
    ///
    /// let stampede = Stampede::initialize();
    /// ```
    pub fn initialize() -> Result<Self, StampedeError> {
        Ok(Stampede {
            configuration: Configuration::parse_args_default_or_exit(),
            catalog: None,
            weighted_users: Vec::new(),
            run_time: 0,
            attack_phase: RunPhase::Starting,
            metrics: Metrics::default(),
        })
    }

    /// Initialize the load test with an already built configuration, used by
    /// test harnesses that don't parse the process's command line.
    pub fn initialize_with_config(configuration: Configuration) -> Result<Self, StampedeError> {
        Ok(Stampede {
            configuration,
            catalog: None,
            weighted_users: Vec::new(),
            run_time: 0,
            attack_phase: RunPhase::Starting,
            metrics: Metrics::default(),
        })
    }

    /// Register the catalog of tasks virtual users will run.
    ///
    /// # Example
    /// ```rust
    /// use stampede::prelude::*;
    ///
    /// fn register() -> Result<(), StampedeError> {
    ///     let _stampede = Stampede::initialize_with_config(Default::default())?
    ///         .register_catalog(
    ///             Catalog::new("Example")
    ///                 .register_task(TaskDescriptor::get("/")),
    ///         );
    ///     Ok(())
    /// }
    /// ```
    pub fn register_catalog(mut self, catalog: Catalog) -> Self {
        trace!("register_catalog: {}", catalog.name);
        self.catalog = Some(catalog);
        self
    }

    /// Execute the load test, returning the collected [`Metrics`](metrics/struct.Metrics.html).
    ///
    /// Validates the configuration, expands task weights, reads the bearer
    /// token from the configured environment variable, pre-allocates a state
    /// per virtual user and then runs the phased attack: hatch users at the
    /// configured rate, generate load until the run time expires or the
    /// operator interrupts, then stop users and drain metrics.
    pub fn execute(mut self) -> Result<Metrics, StampedeError> {
        // If version flag is set, display package name and version and exit.
        if self.configuration.version {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }

        // A catalog with at least one task is required.
        let mut catalog = match self.catalog.take() {
            Some(catalog) => catalog,
            None => {
                return Err(StampedeError::NoCatalog {
                    detail: "No catalog is registered.".to_string(),
                })
            }
        };
        if catalog.tasks.is_empty() {
            return Err(StampedeError::NoCatalog {
                detail: format!("Catalog {} has no tasks registered.", catalog.name),
            });
        }

        // Display the catalog, then exit.
        if self.configuration.list {
            println!("Available tasks:");
            println!(" - {}:", catalog.name);
            for task in &catalog.tasks {
                println!(
                    "    o {} {} (weight: {})",
                    task.method,
                    task.reporting_name(),
                    task.weight
                );
            }
            std::process::exit(0);
        }

        // Validate the configuration before starting to log.
        self.configuration.validate()?;
        self.configuration.initialize_logger();

        self.run_time = util::parse_timespan(&self.configuration.run_time);
        if self.run_time > 0 {
            info!("run_time = {}", self.run_time);
        } else {
            info!("no run_time configured, load test runs until interrupted");
        }

        // Confirm there's a valid host to run against.
        let base_url = catalog::get_base_url(&self.configuration.host, catalog.host.as_deref())?;
        info!("global host configured: {}", base_url);

        // Resolve wait-time bounds; command line options win over the catalog.
        let wait_time = self.resolve_wait_time(&catalog)?;

        // The bearer token must be provisioned and valid before any user
        // starts; deriving a session here fails fast on both counts.
        let token = Session::from_env(self.configuration.token_variable())?
            .token()
            .to_string();

        // Apply weights, building the task execution order.
        catalog.weighted_tasks = catalog.weight_tasks();

        // Allocate a state for each user that will be hatched.
        let users = self.configuration.users.unwrap_or(1);
        info!("initializing {} user states...", users);
        let mut weighted_users = Vec::with_capacity(users);
        for index in 0..users {
            weighted_users.push(AttackUser::new(
                index,
                base_url.clone(),
                wait_time,
                token.clone(),
                &self.configuration,
            )?);
        }
        self.weighted_users = weighted_users;

        self.metrics.display_metrics = !self.configuration.no_metrics;
        self.metrics.display_status_codes = self.configuration.status_codes;

        let rt = Runtime::new()?;
        self = rt.block_on(self.start_attack(catalog))?;

        info!("load test finished");
        Ok(self.metrics)
    }

    // Determine the pause bounds users draw from between tasks: command line
    // options override the catalog; a resolved maximum of 0 disables pausing.
    fn resolve_wait_time(
        &self,
        catalog: &Catalog,
    ) -> Result<Option<(usize, usize)>, StampedeError> {
        let (catalog_min, catalog_max) = catalog.wait_time.unwrap_or((0, 0));
        let min_wait = self.configuration.min_wait.unwrap_or(catalog_min);
        let max_wait = self.configuration.max_wait.unwrap_or(catalog_max);

        if min_wait > max_wait {
            return Err(StampedeError::InvalidWaitTime {
                min_wait,
                max_wait,
                detail: "The resolved minimum wait can not be larger than the resolved maximum wait."
                    .to_string(),
            });
        }

        if max_wait == 0 {
            Ok(None)
        } else {
            info!("wait_time = {}-{} ms", min_wait, max_wait);
            Ok(Some((min_wait, max_wait)))
        }
    }

    // Change from one attack phase to another.
    fn set_attack_phase(&mut self, run_state: &mut RunState, phase: RunPhase) {
        // There's nothing to do if already in the specified phase.
        if self.attack_phase == phase {
            return;
        }

        // The drift timer starts at 0 any time the phase is changed.
        run_state.drift_timer = tokio::time::Instant::now();

        info!("entering phase: {:?}", &phase);
        self.attack_phase = phase;
    }

    // Run the phased load test on the tokio runtime.
    async fn start_attack(mut self, catalog: Catalog) -> Result<Self, StampedeError> {
        trace!("start_attack: {}", catalog.name);

        let (all_threads_metrics_tx, metrics_rx) = flume::unbounded();
        let mut run_state = RunState {
            spawn_user_timer: time::Instant::now(),
            spawn_user_in_ms: 0,
            drift_timer: tokio::time::Instant::now(),
            all_threads_metrics_tx,
            metrics_rx,
            users: Vec::new(),
            user_channels: Vec::new(),
            running_metrics_timer: time::Instant::now(),
            all_users_spawned: false,
        };

        // A fresh run can always be canceled again.
        CANCELED.store(false, Ordering::SeqCst);
        setup_ctrlc_handler();

        let started = time::Instant::now();

        loop {
            match self.attack_phase {
                RunPhase::Starting => {
                    self.spawn_users(&mut run_state, &catalog).await;
                    if self.weighted_users.is_empty() && !run_state.all_users_spawned {
                        run_state.all_users_spawned = true;
                        info!("launched {} users...", self.metrics.users);
                        self.set_attack_phase(&mut run_state, RunPhase::Running);
                    }
                }
                RunPhase::Running => {
                    // Wake regularly to collect metrics and check timers.
                    run_state.drift_timer =
                        util::sleep_minus_drift(Duration::from_millis(500), run_state.drift_timer)
                            .await;
                }
                RunPhase::Stopping => {
                    self.stop_users(&mut run_state).await?;
                    // Collect metrics sent while users were shutting down.
                    self.receive_metrics(&run_state);
                    break;
                }
            }

            self.receive_metrics(&run_state);
            self.metrics.duration = started.elapsed().as_secs() as usize;

            // If enabled, display running metrics at the configured interval.
            if let Some(running_metrics) = self.configuration.running_metrics {
                if util::timer_expired(run_state.running_metrics_timer, running_metrics) {
                    run_state.running_metrics_timer = time::Instant::now();
                    self.metrics.print_running();
                }
            }

            // Transition to stopping when the run-time timer expires or the
            // operator interrupts the load test.
            if util::timer_expired(started, self.run_time) || CANCELED.load(Ordering::SeqCst) {
                self.set_attack_phase(&mut run_state, RunPhase::Stopping);
            }
        }

        self.metrics.duration = started.elapsed().as_secs() as usize;

        Ok(self)
    }

    // Spawn the next user when the hatch timer allows, otherwise sleep until
    // it does.
    async fn spawn_users(&mut self, run_state: &mut RunState, catalog: &Catalog) {
        let hatch_rate = self.configuration.hatch_rate.unwrap_or(1);

        // Determine if it's time to spawn a user.
        if run_state.spawn_user_in_ms == 0
            || util::ms_timer_expired(run_state.spawn_user_timer, run_state.spawn_user_in_ms)
        {
            if let Some(mut thread_user) = self.weighted_users.pop() {
                // Reset the spawn timer.
                run_state.spawn_user_timer = time::Instant::now();

                // Remember which position in the launch order this user has.
                thread_user.weighted_users_index = self.metrics.users;

                // To determine how long before we spawn the next user, start
                // with 1,000.0 milliseconds and divide by the hatch rate.
                run_state.spawn_user_in_ms = (1_000.0 / hatch_rate as f32) as usize;

                // Create a per-thread channel allowing the parent to control
                // the user thread.
                let (parent_sender, thread_receiver) = flume::unbounded();
                run_state.user_channels.push(parent_sender);

                // Copy the user-to-parent sender channel, used by all threads.
                thread_user.channel_to_parent = Some(run_state.all_threads_metrics_tx.clone());

                // Copy the catalog into the thread.
                let thread_catalog = catalog.clone();

                // We number threads from 1 as they're human-visible (in the
                // logs), whereas metrics.users starts at 0.
                let thread_number = self.metrics.users + 1;

                // Launch a new user.
                let user = tokio::spawn(user::user_main(
                    thread_number,
                    thread_catalog,
                    thread_user,
                    thread_receiver,
                ));

                run_state.users.push(user);
                self.metrics.users += 1;
            }
        } else {
            // Otherwise, sleep until the next user is due to hatch.
            let sleep_duration = Duration::from_millis(run_state.spawn_user_in_ms as u64);
            debug!("sleeping {:?}...", sleep_duration);
            run_state.drift_timer =
                util::sleep_minus_drift(sleep_duration, run_state.drift_timer).await;
        }
    }

    // Tell all users to exit, and wait for them to do so.
    async fn stop_users(&mut self, run_state: &mut RunState) -> Result<(), StampedeError> {
        info!("stopping {} users...", run_state.users.len());
        for user_channel in &run_state.user_channels {
            // A user that already exited has dropped its receiver.
            let _ = user_channel.send(UserCommand::Exit);
        }
        for user in run_state.users.drain(..) {
            user.await?;
        }
        Ok(())
    }

    // Drain all metrics currently queued by user threads.
    fn receive_metrics(&mut self, run_state: &RunState) {
        while let Ok(raw_request) = run_state.metrics_rx.try_recv() {
            self.metrics
                .record_request(raw_request, self.configuration.status_codes);
        }
    }
}

// Flag the load test as canceled on the first ctrl-c; exit immediately on the
// second.
fn setup_ctrlc_handler() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let result = ctrlc::set_handler(|| {
            if CANCELED.load(Ordering::SeqCst) {
                std::process::exit(1);
            }
            warn!("caught ctrl-c, stopping...");
            CANCELED.store(true, Ordering::SeqCst);
        });
        if let Err(e) = result {
            debug!("failed to set ctrl-c handler: {}", e);
        }
    });
}
