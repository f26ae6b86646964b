//! Diagnostic and user-facing side channels.
//!
//! [`Observability`] receives breadcrumbs and captured errors for diagnostics.
//! [`Notifier`] surfaces short user-facing copy at retry lifecycle points.
//! Neither is ever consulted for control flow.

use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::error::Error;

/// Severity of a breadcrumb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
}

/// A structured trace entry describing one step taken.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Breadcrumb {
    pub category: String,
    pub message: String,
    pub level: Level,
    pub data: Map<String, Value>,
}

impl Breadcrumb {
    pub fn new(category: impl Into<String>, message: impl Into<String>, level: Level) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
            level,
            data: Map::new(),
        }
    }

    /// Attach a data field.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }
}

/// Observability collaborator (error tracker, crash reporter).
pub trait Observability: Send + Sync {
    fn add_breadcrumb(&self, breadcrumb: Breadcrumb);

    fn capture_exception(&self, error: &Error, context: &str);
}

/// Forwards breadcrumbs and exceptions to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObservability;

impl Observability for TracingObservability {
    fn add_breadcrumb(&self, crumb: Breadcrumb) {
        let data = Value::Object(crumb.data);
        match crumb.level {
            Level::Debug => debug!(category = %crumb.category, %data, "{}", crumb.message),
            Level::Info => info!(category = %crumb.category, %data, "{}", crumb.message),
            Level::Warning => warn!(category = %crumb.category, %data, "{}", crumb.message),
            Level::Error => error!(category = %crumb.category, %data, "{}", crumb.message),
        }
    }

    fn capture_exception(&self, err: &Error, context: &str) {
        error!(kind = err.kind(), context, "{}", err);
    }
}

/// Lifecycle point a notice belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// An attempt failed and another is scheduled.
    Retrying,
    /// The operation succeeded after at least one retry.
    Recovered,
    /// Retries are exhausted.
    Failed,
}

/// User-facing copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    /// `attempt` is the 1-based number of the attempt that just failed.
    pub fn retrying(attempt: u32, delay: Duration) -> Self {
        let seconds = delay.as_millis() as f64 / 1000.0;
        Self {
            kind: NoticeKind::Retrying,
            message: format!("Attempt {attempt} failed. Retrying in {seconds}s"),
        }
    }

    pub fn recovered(retries: u32) -> Self {
        Self {
            kind: NoticeKind::Recovered,
            message: format!("Operation succeeded after {retries} retries"),
        }
    }

    pub fn exhausted(max_retries: u32) -> Self {
        Self {
            kind: NoticeKind::Failed,
            message: format!("Failed after {max_retries} retries. Please try again later."),
        }
    }
}

/// Notification collaborator (toasts, banners).
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Logs notices through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        match notice.kind {
            NoticeKind::Retrying => warn!("{}", notice.message),
            NoticeKind::Recovered => info!("{}", notice.message),
            NoticeKind::Failed => error!("{}", notice.message),
        }
    }
}
