//! Push notification capability.
//!
//! One interface for every platform; the implementation is picked when the
//! [`SyncContext`](crate::SyncContext) is built. Delivery itself happens
//! outside this crate.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Web,
    Ios,
    Android,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Web => write!(f, "web"),
            Self::Ios => write!(f, "ios"),
            Self::Android => write!(f, "android"),
        }
    }
}

/// Outcome of a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Granted,
    Denied,
    /// The user has not decided yet.
    Prompt,
}

/// Device token the backend addresses notifications to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushToken {
    pub platform: Platform,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: Value,
}

pub type NotificationHandler = Arc<dyn Fn(&PushNotification) + Send + Sync>;
pub type TokenHandler = Arc<dyn Fn(&PushToken) + Send + Sync>;

/// Platform push integration.
pub trait PushCapability: Send + Sync {
    fn platform(&self) -> Platform;

    fn request_permission(&self) -> BoxFuture<'_, Result<Permission>>;

    /// Register the device and return its token. Needs granted permission.
    fn register(&self) -> BoxFuture<'_, Result<PushToken>>;

    fn on_notification(&self, handler: NotificationHandler);

    fn on_token_refresh(&self, handler: TokenHandler);
}
