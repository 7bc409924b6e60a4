use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Anything the registry can poll: DALs, API clients, raw backend connections.
#[async_trait]
pub trait Checkable: Send + Sync + 'static {
    /// Report the current status. `Ok` carries details for display, an error
    /// marks the unit as failed for this poll.
    async fn status(&self) -> Result<Value, CheckError>;
}

/// A failed health check. This is data recorded by the registry, it never
/// reaches callers of [`HealthRegistry::get_status`](crate::HealthRegistry::get_status).
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct CheckError {
    pub message: String,
    pub details: Option<Value>,
}

impl CheckError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Registration of one checkable unit.
#[derive(Clone)]
pub struct HealthCheck {
    pub name: String,
    pub checker: Arc<dyn Checkable>,
    /// Poll period, also the upper bound on a single poll's duration.
    pub interval: Duration,
    /// A failing fatal check makes the whole process unhealthy, a failing
    /// non-fatal one only degrades it.
    pub fatal: bool,
}

impl HealthCheck {
    pub fn new(name: &str, checker: Arc<dyn Checkable>, interval: Duration) -> Self {
        Self {
            name: name.to_owned(),
            checker,
            interval,
            fatal: false,
        }
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

impl fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheck")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("fatal", &self.fatal)
            .finish_non_exhaustive()
    }
}
