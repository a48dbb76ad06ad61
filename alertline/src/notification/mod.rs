//! Notification model and aggregation.
//!
//! [`NotificationCenter`] merges the REST snapshot with the push stream into one
//! deduplicated, newest-first collection with read/dismiss tracking.

mod center;
mod types;

pub use center::{NotificationCenter, PUSH_RECONNECT_DELAY};
pub use types::{
    NewNotification, Notification, NotificationQuery, NotificationSource, NotificationStats,
    NotificationType, Priority, parse_push_notification,
};

use crate::request::ApiError;
use async_trait::async_trait;
use thiserror::Error;

/// REST operations the aggregator needs from the backend
#[async_trait]
pub trait NotificationBackend: Send + Sync {
    async fn list_notifications(
        &self,
        query: NotificationQuery,
    ) -> Result<Vec<Notification>, ApiError>;

    async fn mark_read(&self, id: &str) -> Result<Notification, ApiError>;

    async fn respond(
        &self,
        id: &str,
        action: &str,
        note: Option<&str>,
    ) -> Result<Notification, ApiError>;

    async fn delete_notification(&self, id: &str) -> Result<(), ApiError>;

    async fn stats(&self) -> Result<NotificationStats, ApiError>;
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification {0} not found")]
    NotFound(String),

    #[error("notification {0} has already been responded to")]
    AlreadyResponded(String),

    #[error("action {action} is not allowed for notification {id}")]
    ActionNotAllowed { id: String, action: String },

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl NotificationError {
    /// Sentence to show the operator for this failure
    pub fn user_message(&self) -> String {
        match self {
            NotificationError::Api(error) => error.user_message().to_string(),
            other => other.to_string(),
        }
    }
}
