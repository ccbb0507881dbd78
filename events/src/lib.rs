//! Event system infrastructure for the reading sync fabric.
//!
//! This crate provides the seam between the API layer (which persists
//! progress changes and catalog releases) and the real-time delivery
//! channels (the reliable progress channel and the best-effort
//! notification channel).
//!
//! # Architecture
//!
//! - **DomainEvent**: Enum representing the events the API layer can publish
//! - **EventHandler**: Trait for implementing event handlers
//! - **EventPublisher**: Publishes events to registered handlers
//!
//! This crate has no dependencies on internal crates (progress, notify, etc.),
//! avoiding circular dependencies. Both delivery crates implement
//! `EventHandler` and are registered with the publisher at startup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A type alias for the opaque user identity carried by every event.
pub type UserId = String;

/// Domain events that represent business-level changes in the system.
/// These events are emitted once the API layer has already persisted the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DomainEvent {
    /// Emitted when a user's reading position changes.
    /// Routed to every live reliable-channel session belonging to `user_id`.
    ProgressUpdated {
        user_id: UserId,
        content_id: String,
        position: i64,
        /// Unix seconds. Stamped with server time during delivery when absent.
        timestamp: Option<i64>,
    },
    /// Emitted when a followable topic reaches a new milestone (e.g. a new chapter).
    /// Pushed to every registered best-effort client.
    ReleasePublished {
        topic_id: String,
        title: String,
        milestone: i64,
        message: String,
        timestamp: Option<i64>,
    },
}

impl DomainEvent {
    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::ProgressUpdated { .. } => "progress_updated",
            DomainEvent::ReleasePublished { .. } => "release_published",
        }
    }

    /// Checks the arguments a caller is responsible for before any handler runs.
    pub fn validate(&self) -> Result<(), PublishError> {
        match self {
            DomainEvent::ProgressUpdated { user_id, .. } if user_id.is_empty() => {
                Err(PublishError::MissingUserId)
            }
            _ => Ok(()),
        }
    }
}

/// Argument errors reported back to whoever called `publish`.
///
/// Delivery failures never show up here; handlers log those themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
    MissingUserId,
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::MissingUserId => write!(f, "missing_user_id"),
        }
    }
}

impl std::error::Error for PublishError {}

/// Trait for handling domain events.
/// Implementations perform side effects like pushing to live connections.
/// A handler ignores events it is not interested in.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DomainEvent);
}

/// Publishes domain events to registered handlers.
/// Handlers are called sequentially in registration order.
#[derive(Clone)]
pub struct EventPublisher {
    handlers: Arc<Vec<Arc<dyn EventHandler>>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Vec::new()),
        }
    }

    /// Register a new event handler.
    /// Note: This creates a new publisher instance with the additional handler.
    /// Store the returned publisher in your application state.
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        let mut handlers = (*self.handlers).clone();
        handlers.push(handler);
        self.handlers = Arc::new(handlers);
        self
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Publish an event to all registered handlers.
    /// Invalid events are refused before any handler sees them. Handlers own
    /// their delivery error reporting; one handler never prevents the
    /// remaining handlers from running.
    pub async fn publish(&self, event: DomainEvent) -> Result<(), PublishError> {
        event.validate()?;
        for handler in self.handlers.iter() {
            handler.handle(&event).await;
        }
        Ok(())
    }

    /// Convenience for the API layer: publish a progress change for `user_id`.
    pub async fn publish_progress(
        &self,
        user_id: impl Into<UserId>,
        content_id: impl Into<String>,
        position: i64,
    ) -> Result<(), PublishError> {
        self.publish(DomainEvent::ProgressUpdated {
            user_id: user_id.into(),
            content_id: content_id.into(),
            position,
            timestamp: None,
        })
        .await
    }

    /// Convenience for the API layer: announce a new milestone of a topic.
    pub async fn publish_release(
        &self,
        topic_id: impl Into<String>,
        title: impl Into<String>,
        milestone: i64,
        message: impl Into<String>,
    ) -> Result<(), PublishError> {
        self.publish(DomainEvent::ReleasePublished {
            topic_id: topic_id.into(),
            title: title.into(),
            milestone,
            message: message.into(),
            timestamp: None,
        })
        .await
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}
