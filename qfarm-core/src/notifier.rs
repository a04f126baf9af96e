//! Lifecycle event publishing.

use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::store::{Store, keys};

/// A fire-and-forget lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Repository the event belongs to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Event tag, e.g. `all-done` or `golint-done`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Optional payload such as a build number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

/// Pipeline milestones that are not tied to a single analyzer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventType {
    /// The whole job finished.
    AllDone,
    /// The repository was fetched.
    DownloadDone,
    /// Coverage analysis finished.
    CoverageDone,
    /// Coverage analysis failed.
    CoverageError,
    /// The job failed.
    Error,
    /// The latest commit was analyzed before.
    AlreadyAnalyzed,
}

impl EventType {
    /// Wire tag of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AllDone => "all-done",
            EventType::DownloadDone => "download-done",
            EventType::CoverageDone => "coverage-done",
            EventType::CoverageError => "coverage-error",
            EventType::Error => "error",
            EventType::AlreadyAnalyzed => "already-analyzed",
        }
    }
}

/// Publishes events to the shared `events` topic.
#[derive(Clone)]
pub struct Notifier {
    store: Arc<dyn Store>,
}

impl Notifier {
    /// Notifier publishing through `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Publish an event without payload.
    pub fn send(&self, repo: &str, description: impl Into<String>, event_type: &str) {
        self.publish(Event {
            repo: repo.to_string(),
            description: description.into(),
            event_type: event_type.to_string(),
            payload: None,
        });
    }

    /// Publish an event carrying a payload.
    pub fn send_with_payload(
        &self,
        repo: &str,
        description: impl Into<String>,
        event_type: &str,
        payload: impl Into<String>,
    ) {
        self.publish(Event {
            repo: repo.to_string(),
            description: description.into(),
            event_type: event_type.to_string(),
            payload: Some(payload.into()),
        });
    }

    fn publish(&self, event: Event) {
        let data = match serde_json::to_vec(&event) {
            Ok(data) => data,
            Err(err) => {
                warn!("can't marshal event: {err}");
                return;
            }
        };
        if let Err(err) = self.store.publish(keys::EVENTS, data) {
            warn!("can't send event to subscribers: {err}");
        }
    }
}
