use crate::dispatcher::Dispatcher;
use crate::message::ProgressUpdate;
use async_trait::async_trait;
use events::{DomainEvent, EventHandler};
use log::*;

/// Routes `ProgressUpdated` domain events into the progress dispatch queue.
///
/// Other event kinds are ignored.
pub struct ProgressEventHandler {
    dispatcher: Dispatcher,
}

impl ProgressEventHandler {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl EventHandler for ProgressEventHandler {
    async fn handle(&self, event: &DomainEvent) {
        let DomainEvent::ProgressUpdated {
            user_id,
            content_id,
            position,
            timestamp,
        } = event
        else {
            return;
        };

        debug!(
            "Handling ProgressUpdated event for user {} (content={}, position={})",
            user_id, content_id, position
        );

        let update = ProgressUpdate {
            timestamp: *timestamp,
            ..ProgressUpdate::new(user_id.clone(), content_id.clone(), *position)
        };

        if let Err(e) = self.dispatcher.publish(user_id, update).await {
            error!("Failed to dispatch progress event for user {user_id}: {e}");
        }
    }
}
