//! Virtual user state and the per-user run loop.
//!
//! Each virtual user owns an [`AttackUser`]: a dedicated HTTP client, the base
//! URL requests are built against, the pause bounds, and -- once initialized --
//! the user's [`Session`]. The parent communicates with running users only
//! through channels; no state is shared between users.

use rand::Rng;
use reqwest::{Client, Response};
use std::fmt;
use std::time::{Duration, Instant};
use url::Url;

use crate::catalog::{Catalog, TaskDescriptor, TaskMethod};
use crate::config::Configuration;
use crate::metrics::RequestMetric;
use crate::session::Session;
use crate::StampedeError;

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Commands sent from the parent to the virtual user threads.
#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    /// Tell user thread to exit.
    Exit,
}

/// An enumeration of all errors a task execution can return.
#[derive(Debug)]
pub enum TaskError {
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
    Url(url::ParseError),
    /// The task ran before the user's session was initialized; no request was
    /// made.
    MissingSession,
}

impl TaskError {
    fn describe(&self) -> &str {
        match *self {
            TaskError::Reqwest(_) => "reqwest::Error",
            TaskError::Url(_) => "url::ParseError",
            TaskError::MissingSession => "task invoked before session initialization",
        }
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TaskError::Reqwest(ref source) => {
                write!(f, "TaskError: {} ({})", self.describe(), source)
            }
            TaskError::Url(ref source) => write!(f, "TaskError: {} ({})", self.describe(), source),
            _ => write!(f, "TaskError: {}", self.describe()),
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            TaskError::Reqwest(ref source) => Some(source),
            TaskError::Url(ref source) => Some(source),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for TaskError {
    fn from(err: reqwest::Error) -> TaskError {
        TaskError::Reqwest(err)
    }
}

/// Auto-convert Url errors.
impl From<url::ParseError> for TaskError {
    fn from(err: url::ParseError) -> TaskError {
        TaskError::Url(err)
    }
}

/// An individual virtual user state, repeatedly running all tasks in the
/// catalog it was launched with.
#[derive(Debug, Clone)]
pub struct AttackUser {
    /// The 0-indexed position of this user in the launch order.
    pub weighted_users_index: usize,
    /// A [`reqwest::Client`](https://docs.rs/reqwest/*/reqwest/struct.Client.html)
    /// instance, private to this user.
    pub client: Client,
    /// The base URL to prepend on all request paths.
    pub base_url: Url,
    /// Optional pause range in milliseconds drawn from after each task.
    pub wait_time: Option<(usize, usize)>,
    /// The pre-provisioned bearer token the session is derived from.
    token: String,
    /// Authentication state, derived once when the user starts. Tasks fail
    /// until this is set.
    session: Option<Session>,
    /// A local copy of the run configuration.
    pub config: Configuration,
    /// Sender for streaming request metrics to the parent, if enabled.
    pub(crate) channel_to_parent: Option<flume::Sender<RequestMetric>>,
}

impl AttackUser {
    /// Create a new virtual user state.
    pub fn new(
        weighted_users_index: usize,
        base_url: Url,
        wait_time: Option<(usize, usize)>,
        token: String,
        configuration: &Configuration,
    ) -> Result<Self, StampedeError> {
        trace!("new user: {}", weighted_users_index);
        let builder = Client::builder().user_agent(APP_USER_AGENT);
        #[cfg(feature = "cookies")]
        let builder = builder.cookie_store(true);
        let client = builder.build()?;

        Ok(AttackUser {
            weighted_users_index,
            client,
            base_url,
            wait_time,
            token,
            session: None,
            config: configuration.clone(),
            channel_to_parent: None,
        })
    }

    /// Derive this user's session from its pre-provisioned token.
    ///
    /// Called once, before the first task runs. The session is immutable for
    /// the rest of the user's lifetime.
    pub fn initialize_session(&mut self) -> Result<(), StampedeError> {
        let session = Session::new(&self.token)?;
        debug!(
            "user {} session initialized from token",
            self.weighted_users_index
        );
        self.session = Some(session);
        Ok(())
    }

    /// The user's session, if initialized.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// A helper that prepends the base URL to the path. For example, if you
    /// pass in `/foo` and `--host` is set to `http://127.0.0.1` it will return
    /// `http://127.0.0.1/foo`. If `path` is passed in with a hard-coded host,
    /// it is used unchanged.
    pub fn build_url(&self, path: &str) -> Result<String, TaskError> {
        // If the path includes a host, use it.
        if let Ok(parsed_path) = Url::parse(path) {
            if parsed_path.host().is_some() {
                return Ok(path.to_string());
            }
        }

        Ok(self.base_url.join(path)?.to_string())
    }

    /// Execute a single task from the catalog: build the request, attach the
    /// session's headers, send it, and stream the timing and outcome to the
    /// metrics collector.
    ///
    /// Failures (non-2xx statuses, transport errors) are recorded in the
    /// metrics and returned, but never retried; a failing task doesn't stop
    /// the user or the load test.
    pub async fn execute(&self, task: &TaskDescriptor) -> Result<Response, TaskError> {
        let request_name = task.reporting_name().to_string();

        // No task runs before the session is initialized; the failure is
        // recorded without any request going out.
        let session = match &self.session {
            Some(session) => session,
            None => {
                warn!(
                    "user {}: {} {} invoked with no session",
                    self.weighted_users_index, task.method, task.path
                );
                self.record_failure(task.method, &request_name);
                return Err(TaskError::MissingSession);
            }
        };

        // A malformed path manifests as a failed request, not a fatal error.
        let url = match self.build_url(&task.path) {
            Ok(url) => url,
            Err(e) => {
                warn!("{}: failed to build url: {}", &task.path, e);
                self.record_failure(task.method, &request_name);
                return Err(e);
            }
        };

        let mut request_builder = match task.method {
            TaskMethod::Delete => self.client.delete(&url),
            TaskMethod::Get => self.client.get(&url),
            TaskMethod::Head => self.client.head(&url),
            TaskMethod::Patch => self.client.patch(&url),
            TaskMethod::Post => self.client.post(&url),
            TaskMethod::Put => self.client.put(&url),
        }
        .headers(session.headers().clone());

        if let Some(payload) = &task.payload {
            request_builder = request_builder.json(payload);
        }

        // Make the actual request.
        let started = Instant::now();
        let response = request_builder.send().await;
        let elapsed = started.elapsed();

        let mut raw_request =
            RequestMetric::new(task.method, &request_name, self.weighted_users_index);
        raw_request.set_response_time(elapsed.as_millis());
        match &response {
            Ok(r) => {
                let status_code = r.status();
                debug!("{}: status_code {}", &url, status_code);
                if self.config.status_codes {
                    raw_request.set_status_code(Some(status_code));
                }
                if !status_code.is_success() {
                    raw_request.success = false;
                }
            }
            Err(e) => {
                warn!("{}: {}", &url, e);
                raw_request.success = false;
                raw_request.set_status_code(None);
            }
        };
        self.send_to_parent(raw_request);

        Ok(response?)
    }

    // Record a task that failed before a request could be made.
    fn record_failure(&self, method: TaskMethod, request_name: &str) {
        let mut raw_request = RequestMetric::new(method, request_name, self.weighted_users_index);
        raw_request.success = false;
        self.send_to_parent(raw_request);
    }

    // Stream a raw metric to the parent, best effort.
    fn send_to_parent(&self, raw_request: RequestMetric) {
        if self.config.no_metrics {
            return;
        }
        if let Some(parent) = &self.channel_to_parent {
            let _ = parent.send(raw_request);
        }
    }
}

/// Draw a random pause in milliseconds, inclusively between `min_wait` and
/// `max_wait`.
pub(crate) fn random_wait_time(min_wait: usize, max_wait: usize) -> usize {
    if max_wait == 0 {
        0
    } else {
        rand::thread_rng().gen_range(min_wait..=max_wait)
    }
}

/// The main loop of a virtual user: initialize the session, optionally verify
/// it, then repeatedly run the weighted tasks until told to exit, pausing a
/// random inclusive duration between tasks.
pub(crate) async fn user_main(
    thread_number: usize,
    thread_catalog: Catalog,
    mut thread_user: AttackUser,
    thread_receiver: flume::Receiver<UserCommand>,
) {
    info!(
        "launching user {} from {}...",
        thread_number, thread_catalog.name
    );

    // User is starting: the session must exist before any task runs.
    if let Err(e) = thread_user.initialize_session() {
        warn!(
            "user {} unable to initialize session: {}",
            thread_number, e
        );
        return;
    }

    // Optionally confirm the session's token is accepted before generating
    // load. A failed verification is recorded and logged; whether the test
    // results are still useful is the operator's call, so the user proceeds.
    if !thread_user.config.verify_path.is_empty() {
        let verify_task = TaskDescriptor::get(&thread_user.config.verify_path);
        match thread_user.execute(&verify_task).await {
            Ok(response) if response.status().is_success() => {
                debug!("user {} session verified", thread_number);
            }
            Ok(response) => {
                warn!(
                    "user {} session verification returned {}",
                    thread_number,
                    response.status()
                );
            }
            Err(e) => {
                warn!("user {} session verification failed: {}", thread_number, e);
            }
        }
    }

    // Loop launching tasks until the parent tells us to stop.
    if !thread_catalog.weighted_tasks.is_empty() {
        'run_tasks: loop {
            for (thread_task_index, thread_task_name) in &thread_catalog.weighted_tasks {
                let task = &thread_catalog.tasks[*thread_task_index];
                debug!(
                    "[user {}]: running {} task from {}",
                    thread_number, thread_task_name, thread_catalog.name
                );
                // Failures were already recorded in the metrics.
                let _error = thread_user.execute(task).await;

                if received_exit(&thread_receiver) {
                    break 'run_tasks;
                }

                // If a wait time is configured, pause before the next task.
                if let Some((min_wait, max_wait)) = thread_user.wait_time {
                    let mut wait_time = random_wait_time(min_wait, max_wait);
                    // Never sleep more than 500 milliseconds, allowing a
                    // sleeping user to shut down quickly when the load test
                    // ends.
                    let maximum_sleep_time = 500;

                    while wait_time > 0 {
                        // Exit immediately if message received from parent.
                        if received_exit(&thread_receiver) {
                            break 'run_tasks;
                        }

                        // Wake regularly to detect if the load test has shut down.
                        let sleep_duration = if wait_time > maximum_sleep_time {
                            wait_time -= maximum_sleep_time;
                            Duration::from_millis(maximum_sleep_time as u64)
                        } else {
                            let sleep_duration = Duration::from_millis(wait_time as u64);
                            wait_time = 0;
                            sleep_duration
                        };

                        debug!(
                            "user {} from {} sleeping {:?} ...",
                            thread_number, thread_catalog.name, sleep_duration
                        );

                        tokio::time::sleep(sleep_duration).await;
                    }
                }
            }
        }
    }

    info!(
        "exiting user {} from {}...",
        thread_number, thread_catalog.name
    );
}

// Determine if the parent has sent a UserCommand::Exit message.
fn received_exit(thread_receiver: &flume::Receiver<UserCommand>) -> bool {
    while let Ok(command) = thread_receiver.try_recv() {
        match command {
            // UserCommand::Exit received.
            UserCommand::Exit => {
                return true;
            }
        }
    }
    // UserCommand::Exit not received.
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::get_base_url;
    use gumdrop::Options;

    fn test_user() -> AttackUser {
        let configuration = Configuration::parse_args_default(&Vec::<&str>::new())
            .expect("failed to parse empty options");
        let base_url = get_base_url("http://example.com", None).unwrap();
        AttackUser::new(0, base_url, None, "abc123".to_string(), &configuration).unwrap()
    }

    #[test]
    fn wait_time_draws_are_inclusive() {
        // With bounds of 1000-5000 ms, every draw lies within the bounds,
        // inclusively.
        for _ in 0..1_000 {
            let wait_time = random_wait_time(1_000, 5_000);
            assert!(wait_time >= 1_000);
            assert!(wait_time <= 5_000);
        }

        // Identical bounds always draw exactly that pause.
        for _ in 0..10 {
            assert_eq!(random_wait_time(250, 250), 250);
        }

        // A max_wait of 0 disables the pause entirely.
        assert_eq!(random_wait_time(0, 0), 0);
    }

    #[test]
    fn urls_are_built_from_the_base_url() {
        let user = test_user();
        assert_eq!(
            user.build_url("/api/v1/checkout").unwrap(),
            "http://example.com/api/v1/checkout"
        );
        // A path carrying its own host is used unchanged.
        assert_eq!(
            user.build_url("http://other.example.com/foo").unwrap(),
            "http://other.example.com/foo"
        );
    }

    #[tokio::test]
    async fn task_fails_without_session() {
        let user = test_user();
        assert!(user.session().is_none());

        // The session invariant holds before any network access: the checkout
        // task fails without a request going out.
        let task = TaskDescriptor::get("/api/v1/checkout");
        match user.execute(&task).await {
            Err(TaskError::MissingSession) => (),
            _ => panic!("expected MissingSession"),
        }
    }

    #[test]
    fn session_initializes_from_token() {
        let mut user = test_user();
        user.initialize_session().unwrap();
        assert_eq!(user.session().unwrap().token(), "abc123");
    }
}
