//! Inbound notification model and the dispatcher that presents it.

use crate::realtime::{Topic, TopicId, TopicKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod dispatcher;

pub use dispatcher::{
    Lifecycle, LogPresenter, NotificationDispatcher, PresentOptions, Presenter,
    CONNECTION_INDICATOR_ID, TERMINAL_FAILURE_ID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// A push notification as delivered by the hub. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEnvelope {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_kind: Option<TopicKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<TopicId>,
}

impl NotificationEnvelope {
    /// The subscription this envelope was routed through, if it names one.
    pub fn topic(&self) -> Option<Topic> {
        match (self.topic_kind, &self.topic_id) {
            (Some(kind), Some(id)) => Some(Topic {
                kind,
                id: id.clone(),
            }),
            _ => None,
        }
    }

    /// Text shown to the user.
    pub fn display_text(&self) -> String {
        if self.title.is_empty() {
            self.message.clone()
        } else {
            format!("{}: {}", self.title, self.message)
        }
    }
}
