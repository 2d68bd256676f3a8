//! A one-stop `use` for everything needed to write a Stampede load test.

pub use crate::catalog::{Catalog, TaskDescriptor, TaskMethod};
pub use crate::config::Configuration;
pub use crate::metrics::Metrics;
pub use crate::session::Session;
pub use crate::user::{AttackUser, TaskError};
pub use crate::{Stampede, StampedeError};
