use crate::fanout::Notifier;
use crate::message::ReleaseNotification;
use async_trait::async_trait;
use events::{DomainEvent, EventHandler};
use log::*;

/// Turns `ReleasePublished` domain events into release notifications.
pub struct ReleaseEventHandler {
    notifier: Notifier,
}

impl ReleaseEventHandler {
    pub fn new(notifier: Notifier) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl EventHandler for ReleaseEventHandler {
    async fn handle(&self, event: &DomainEvent) {
        if let DomainEvent::ReleasePublished {
            topic_id,
            title,
            milestone,
            message,
            timestamp,
        } = event
        {
            debug!("Handling ReleasePublished event for topic {topic_id}");

            let release = ReleaseNotification {
                timestamp: timestamp.unwrap_or(0),
                ..ReleaseNotification::new(topic_id.clone(), title.clone(), *milestone, message.clone())
            };
            self.notifier.publish_release(release).await;
        }
    }
}
