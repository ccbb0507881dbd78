use chrono::{DateTime, Utc};
use dashmap::DashMap;
use events::UserId;
use std::net::SocketAddr;

/// One client's interest in release notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub user_id: UserId,
    pub address: SocketAddr,
    /// Empty means every topic.
    pub topic_ids: Vec<String>,
    pub preferences: Vec<String>,
    pub client_label: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl Registration {
    pub fn new(user_id: impl Into<UserId>, address: SocketAddr, topic_ids: Vec<String>) -> Self {
        Self {
            user_id: user_id.into(),
            address,
            topic_ids,
            preferences: Vec::new(),
            client_label: None,
            registered_at: Utc::now(),
        }
    }

    /// An entry without a topic filter matches every scoped query.
    pub fn matches_any(&self, topic_ids: &[String]) -> bool {
        self.topic_ids.is_empty() || self.topic_ids.iter().any(|t| topic_ids.contains(t))
    }
}

/// Registrations of the best-effort channel, keyed by user.
///
/// The most recent registration of a user is authoritative, so each user
/// holds at most one entry.
#[derive(Debug, Default)]
pub struct RegistrationTable {
    entries: DashMap<UserId, Registration>,
}

impl RegistrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every prior entry of the user, whatever address it came from.
    /// Returns the entry it replaced, if any.
    pub fn upsert(&self, registration: Registration) -> Option<Registration> {
        self.entries
            .insert(registration.user_id.clone(), registration)
    }

    /// Removes the user's entries. An empty `topic_ids` removes all of them;
    /// otherwise only entries matching one of the topics are removed.
    /// Returns how many entries were removed.
    pub fn remove(&self, user_id: &str, topic_ids: &[String]) -> usize {
        let removed = if topic_ids.is_empty() {
            self.entries.remove(user_id)
        } else {
            self.entries
                .remove_if(user_id, |_, registration| registration.matches_any(topic_ids))
        };
        usize::from(removed.is_some())
    }

    pub fn get(&self, user_id: &str) -> Option<Registration> {
        self.entries.get(user_id).map(|entry| entry.value().clone())
    }

    /// Point-in-time copy of every entry for fan-out.
    pub fn snapshot_all(&self) -> Vec<Registration> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
