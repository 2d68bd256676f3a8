//! Helpers and objects for declaring what a Stampede load test does.
//!
//! A load test is declared with two objects:
//!
//! - [`TaskDescriptor`] a named action: an HTTP method, a target path, an
//!   optional JSON payload, and a weight controlling how often it runs.
//! - [`Catalog`] the collection of tasks a virtual user repeatedly performs,
//!   together with an optional default host and wait time.
//!
//! ## Declaring tasks
//!
//! ```rust
//! use stampede::prelude::*;
//! use serde_json::json;
//!
//! fn storefront_catalog() -> Result<Catalog, StampedeError> {
//!     Ok(Catalog::new("StorefrontUser")
//!         .set_wait_time(1_000, 5_000)?
//!         .register_task(
//!             TaskDescriptor::post("/api/v1/cart/add", json!({"product_id": "123", "quantity": 1}))
//!                 .set_name("/api/cart/add")
//!                 .set_weight(2)?,
//!         )
//!         .register_task(TaskDescriptor::get("/api/v1/checkout").set_name("/api/checkout")))
//! }
//! ```
//!
//! Tasks with a display name aggregate in the metrics under that name instead
//! of the literal path, so per-instance path variations roll up under a single
//! metric key.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::util;
use crate::StampedeError;

/// Supported HTTP methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskMethod {
    Delete,
    Get,
    Head,
    Patch,
    Post,
    Put,
}

/// Implement format trait to allow displaying methods the way they appear on
/// the wire and in the metrics tables.
impl fmt::Display for TaskMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TaskMethod::Delete => write!(f, "DELETE"),
            TaskMethod::Get => write!(f, "GET"),
            TaskMethod::Head => write!(f, "HEAD"),
            TaskMethod::Patch => write!(f, "PATCH"),
            TaskMethod::Post => write!(f, "POST"),
            TaskMethod::Put => write!(f, "PUT"),
        }
    }
}

/// An individual task within a [`Catalog`].
///
/// A task descriptor is static data: once registered it is never mutated, and
/// every execution of the task builds the same request (plus the per-user
/// session headers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// An index into [`Catalog::tasks`], assigned at registration.
    pub catalog_index: usize,
    /// The HTTP method used when the task runs.
    pub method: TaskMethod,
    /// The path requested when the task runs, relative to the configured host.
    pub path: String,
    /// An optional JSON payload sent as the request body.
    pub payload: Option<serde_json::Value>,
    /// An optional display name, used in place of the path when aggregating
    /// and displaying metrics about requests made by the task.
    pub name: String,
    /// An integer value that controls the frequency that this task will be run.
    pub weight: usize,
}

impl TaskDescriptor {
    /// Creates a new task descriptor for an arbitrary HTTP method.
    ///
    /// For the common methods, [`TaskDescriptor::get`] and
    /// [`TaskDescriptor::post`] are more convenient.
    pub fn new(method: TaskMethod, path: &str) -> Self {
        trace!("new task: {} {}", method, path);
        TaskDescriptor {
            catalog_index: usize::max_value(),
            method,
            path: path.to_string(),
            payload: None,
            name: "".to_string(),
            weight: 1,
        }
    }

    /// Creates a task descriptor that makes a `GET` request of a path.
    ///
    /// # Example
    /// ```rust
    /// use stampede::prelude::*;
    ///
    /// let checkout = TaskDescriptor::get("/api/v1/checkout");
    /// ```
    pub fn get(path: &str) -> Self {
        TaskDescriptor::new(TaskMethod::Get, path)
    }

    /// Creates a task descriptor that makes a `POST` request of a path with a
    /// JSON payload.
    ///
    /// # Example
    /// ```rust
    /// use stampede::prelude::*;
    /// use serde_json::json;
    ///
    /// let add_to_cart = TaskDescriptor::post(
    ///     "/api/v1/cart/add",
    ///     json!({"product_id": "123", "quantity": 1}),
    /// );
    /// ```
    pub fn post(path: &str, payload: serde_json::Value) -> Self {
        TaskDescriptor::new(TaskMethod::Post, path).set_payload(payload)
    }

    /// Set an optional display name for the task, used when aggregating and
    /// displaying metrics about requests made by the task.
    ///
    /// Without a name, metrics aggregate under the literal request path.
    pub fn set_name(mut self, name: &str) -> Self {
        trace!("[{}] set_name: {}", self.path, name);
        self.name = name.to_string();
        self
    }

    /// Set an optional JSON payload, sent as the request body each time the
    /// task runs.
    pub fn set_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets a weight on an individual task. The larger the value of weight, the
    /// more often it will be run. For example, if one task has a weight of 3 and
    /// another task has a weight of 1, the first task will run 3 times as often.
    ///
    /// # Example
    /// ```rust
    /// use stampede::prelude::*;
    ///
    /// fn catalog() -> Result<Catalog, StampedeError> {
    ///     Ok(Catalog::new("Example")
    ///         .register_task(TaskDescriptor::get("/a").set_weight(9)?)
    ///         .register_task(TaskDescriptor::get("/b").set_weight(3)?))
    /// }
    /// ```
    pub fn set_weight(mut self, weight: usize) -> Result<Self, StampedeError> {
        trace!("[{}] set_weight: {}", self.path, weight);
        if weight == 0 {
            return Err(StampedeError::InvalidWeight {
                weight,
                detail: format!("Weight for task {} must be set to at least 1.", self.path),
            });
        }
        self.weight = weight;
        Ok(self)
    }

    /// The name this task's requests aggregate under in the metrics: the
    /// display name when set, otherwise the request path.
    pub fn reporting_name(&self) -> &str {
        if self.name.is_empty() {
            &self.path
        } else {
            &self.name
        }
    }
}

/// The collection of tasks a virtual user repeatedly performs.
///
/// Once created, [`TaskDescriptor`]s must be registered with it, and finally it
/// must be registered with the [`Stampede`](../struct.Stampede.html) object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    /// The name of the catalog, used in logs.
    pub name: String,
    /// A vector containing one copy of each task virtual users will run.
    pub tasks: Vec<TaskDescriptor>,
    /// A weighted execution order built from `tasks` before the load test
    /// starts; pairs of (task index, reporting name).
    pub weighted_tasks: Vec<(usize, String)>,
    /// An optional default host, used if the `--host` option is not set.
    pub host: Option<String>,
    /// An optional default pause range in milliseconds, drawn from after each
    /// task, used if the `--min-wait`/`--max-wait` options are not set.
    pub wait_time: Option<(usize, usize)>,
}

impl Catalog {
    /// Creates a new catalog. Once created, tasks are registered with
    /// [`Catalog::register_task`].
    ///
    /// # Example
    /// ```rust
    /// use stampede::prelude::*;
    ///
    /// let catalog = Catalog::new("StorefrontUser");
    /// ```
    pub fn new(name: &str) -> Self {
        trace!("new catalog: name: {}", &name);
        Catalog {
            name: name.to_string(),
            tasks: Vec::new(),
            weighted_tasks: Vec::new(),
            host: None,
            wait_time: None,
        }
    }

    /// Registers a task with the catalog, where it is stored in the
    /// [`Catalog::tasks`] vector. Virtual users run registered tasks in a
    /// weighted order for the duration of the load test.
    pub fn register_task(mut self, mut task: TaskDescriptor) -> Self {
        trace!("{} register_task: {} {}", self.name, task.method, task.path);
        task.catalog_index = self.tasks.len();
        self.tasks.push(task);
        self
    }

    /// Set a default host for the catalog. If no `--host` option is set when
    /// running the load test, this host will be prepended on all request paths.
    /// For example, this can point a load test at a local development
    /// environment by default, with `--host` used to override when testing
    /// another environment.
    pub fn set_host(mut self, host: &str) -> Self {
        trace!("{} set_host: {}", self.name, host);
        // Host validation happens at startup.
        self.host = Some(host.to_string());
        self
    }

    /// Configure virtual users to pause after running each task. The length of
    /// the pause is drawn randomly from `min_wait` to `max_wait` milliseconds,
    /// inclusively. The `--min-wait` and `--max-wait` options override this.
    ///
    /// # Example
    /// ```rust
    /// use stampede::prelude::*;
    ///
    /// fn catalog() -> Result<Catalog, StampedeError> {
    ///     // Pause 1 to 5 seconds after each task.
    ///     Catalog::new("Example").set_wait_time(1_000, 5_000)
    /// }
    /// ```
    pub fn set_wait_time(
        mut self,
        min_wait: usize,
        max_wait: usize,
    ) -> Result<Self, StampedeError> {
        trace!(
            "{} set_wait_time: min: {} max: {}",
            self.name,
            min_wait,
            max_wait
        );
        if min_wait > max_wait {
            return Err(StampedeError::InvalidWaitTime {
                min_wait,
                max_wait,
                detail: format!(
                    "min_wait({}) can't be larger than max_wait({}) in catalog {}.",
                    min_wait, max_wait, self.name
                ),
            });
        }
        self.wait_time = Some((min_wait, max_wait));
        Ok(self)
    }

    /// Expand the registered tasks into a weighted execution order.
    ///
    /// Weights are first reduced by their greatest common divisor, then tasks
    /// are interleaved round-robin so execution alternates between tasks
    /// instead of running each task's full allocation back to back.
    pub(crate) fn weight_tasks(&self) -> Vec<(usize, String)> {
        trace!("weight_tasks for {}", self.name);

        let first_weight = match self.tasks.first() {
            Some(task) => task.weight,
            None => return Vec::new(),
        };
        let divisor = self
            .tasks
            .iter()
            .skip(1)
            .fold(first_weight, |acc, task| util::gcd(acc, task.weight));

        // One bucket per task, holding weight/divisor copies of its index.
        let mut available: Vec<Vec<(usize, String)>> = self
            .tasks
            .iter()
            .map(|task| {
                let count = task.weight / divisor;
                debug!(
                    "{} {} ({}) loads {} times",
                    task.method,
                    task.path,
                    task.reporting_name(),
                    count
                );
                vec![(task.catalog_index, task.reporting_name().to_string()); count]
            })
            .collect();

        let total_tasks: usize = available.iter().map(|bucket| bucket.len()).sum();

        // Interleave one copy of each remaining task at a time.
        let mut weighted_tasks = Vec::with_capacity(total_tasks);
        while weighted_tasks.len() < total_tasks {
            for bucket in available.iter_mut() {
                if let Some(task) = bucket.pop() {
                    weighted_tasks.push(task);
                }
            }
        }
        weighted_tasks
    }
}

/// Determine the base URL all request paths are built from: the `--host`
/// option when set, otherwise the catalog's default host.
pub(crate) fn get_base_url(
    config_host: &str,
    catalog_host: Option<&str>,
) -> Result<Url, StampedeError> {
    let host = if !config_host.is_empty() {
        config_host
    } else {
        match catalog_host {
            Some(host) => host,
            None => {
                return Err(StampedeError::InvalidOption {
                    option: "--host".to_string(),
                    value: "".to_string(),
                    detail:
                        "A host must be defined via the --host option or Catalog::set_host()."
                            .to_string(),
                })
            }
        }
    };

    Url::parse(host).map_err(|parse_error| StampedeError::InvalidHost {
        host: host.to_string(),
        detail: "Failed to parse base URL.".to_string(),
        parse_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporting_names() {
        let named = TaskDescriptor::get("/api/v1/checkout").set_name("/api/checkout");
        assert_eq!(named.reporting_name(), "/api/checkout");

        let unnamed = TaskDescriptor::get("/api/v1/checkout");
        assert_eq!(unnamed.reporting_name(), "/api/v1/checkout");
    }

    #[test]
    fn zero_weight_rejected() {
        assert!(TaskDescriptor::get("/").set_weight(0).is_err());
        assert!(TaskDescriptor::get("/").set_weight(1).is_ok());
    }

    #[test]
    fn invalid_wait_time_rejected() {
        assert!(Catalog::new("Example").set_wait_time(5_000, 1_000).is_err());
        assert!(Catalog::new("Example").set_wait_time(1_000, 5_000).is_ok());
        // Identical bounds are a fixed-length pause, not an error.
        assert!(Catalog::new("Example").set_wait_time(500, 500).is_ok());
    }

    #[test]
    fn weighted_interleave() {
        let catalog = Catalog::new("Example")
            .register_task(TaskDescriptor::get("/a").set_weight(9).unwrap())
            .register_task(TaskDescriptor::get("/b").set_weight(3).unwrap());
        let weighted = catalog.weight_tasks();

        // Weights 9 and 3 reduce to 3 and 1.
        assert_eq!(weighted.len(), 4);
        assert_eq!(weighted.iter().filter(|(index, _)| *index == 0).count(), 3);
        assert_eq!(weighted.iter().filter(|(index, _)| *index == 1).count(), 1);
        // Round-robin interleave runs each task before repeating any.
        assert_eq!(weighted[0].0, 0);
        assert_eq!(weighted[1].0, 1);
    }

    #[test]
    fn base_url_precedence() {
        let catalog_host = Some("http://fallback.example.com");

        // The command line host wins when set.
        let base_url = get_base_url("http://example.com", catalog_host).unwrap();
        assert_eq!(base_url.as_str(), "http://example.com/");

        // Otherwise the catalog host is used.
        let base_url = get_base_url("", catalog_host).unwrap();
        assert_eq!(base_url.as_str(), "http://fallback.example.com/");

        // No host at all is an error.
        assert!(get_base_url("", None).is_err());
    }
}
