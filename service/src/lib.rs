use config::Config;
use events::EventPublisher;

pub mod config;
pub mod logging;

// Service-level state handed to the API layer that sits in front of the sync fabric.
// The API layer persists a change, then publishes it through `event_publisher`.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub event_publisher: EventPublisher,
}

impl AppState {
    pub fn new(app_config: Config, event_publisher: EventPublisher) -> Self {
        Self {
            config: app_config,
            event_publisher,
        }
    }

    pub fn event_publisher(&self) -> &EventPublisher {
        &self.event_publisher
    }
}
