//! Topic subscriptions: the set of groups the client wants events for.
//!
//! The registry is the desired state only. It never assumes the hub still
//! remembers membership after a dropped connection, so every (re)connect
//! replays the whole set.

use super::transport::Transport;
use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicKind {
    Monitor,
    Environment,
    Region,
    NamedGroup,
}

impl TopicKind {
    fn group(self) -> &'static str {
        match self {
            TopicKind::Monitor => "MonitorGroup",
            TopicKind::Environment => "EnvironmentGroup",
            TopicKind::Region => "RegionGroup",
            TopicKind::NamedGroup => "Group",
        }
    }

    /// Hub method joining a topic of this kind, e.g. `JoinMonitorGroup`.
    pub fn join_method(self) -> String {
        format!("Join{}", self.group())
    }

    /// Hub method leaving a topic of this kind, e.g. `LeaveMonitorGroup`.
    pub fn leave_method(self) -> String {
        format!("Leave{}", self.group())
    }

    fn label(self) -> &'static str {
        match self {
            TopicKind::Monitor => "monitor",
            TopicKind::Environment => "environment",
            TopicKind::Region => "region",
            TopicKind::NamedGroup => "group",
        }
    }
}

/// Topic identifier: monitors are numbered, the other kinds are named.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TopicId {
    Number(i64),
    Name(String),
}

impl TopicId {
    fn to_value(&self) -> Value {
        match self {
            TopicId::Number(n) => Value::from(*n),
            TopicId::Name(name) => Value::from(name.as_str()),
        }
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicId::Number(n) => write!(f, "{}", n),
            TopicId::Name(name) => write!(f, "{}", name),
        }
    }
}

impl From<i64> for TopicId {
    fn from(n: i64) -> Self {
        TopicId::Number(n)
    }
}

impl From<&str> for TopicId {
    fn from(name: &str) -> Self {
        TopicId::Name(name.to_string())
    }
}

impl From<String> for TopicId {
    fn from(name: String) -> Self {
        TopicId::Name(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic {
    pub kind: TopicKind,
    pub id: TopicId,
}

impl Topic {
    pub fn new(kind: TopicKind, id: impl Into<TopicId>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn monitor(id: i64) -> Self {
        Self::new(TopicKind::Monitor, id)
    }

    pub fn environment(name: &str) -> Self {
        Self::new(TopicKind::Environment, name)
    }

    pub fn region(name: &str) -> Self {
        Self::new(TopicKind::Region, name)
    }

    pub fn group(name: &str) -> Self {
        Self::new(TopicKind::NamedGroup, name)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.label(), self.id)
    }
}

/// Desired topic set. Set semantics: inserting twice is a no-op.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    desired: BTreeSet<Topic>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the topic was already desired.
    pub fn insert(&mut self, topic: Topic) -> bool {
        self.desired.insert(topic)
    }

    /// Returns false if the topic was not desired.
    pub fn remove(&mut self, topic: &Topic) -> bool {
        self.desired.remove(topic)
    }

    pub fn contains(&self, topic: &Topic) -> bool {
        self.desired.contains(topic)
    }

    pub fn len(&self) -> usize {
        self.desired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.desired.is_empty()
    }

    /// Current desired set, in stable order.
    pub fn snapshot(&self) -> Vec<Topic> {
        self.desired.iter().cloned().collect()
    }
}

/// Issues the join call for `topic`.
pub async fn join(transport: &dyn Transport, topic: &Topic) -> Result<(), ClientError> {
    call(transport, &topic.kind.join_method(), topic).await
}

/// Issues the leave call for `topic`.
pub async fn leave(transport: &dyn Transport, topic: &Topic) -> Result<(), ClientError> {
    call(transport, &topic.kind.leave_method(), topic).await
}

/// Joins every topic in `topics`. Failures are logged and returned; they never
/// stop the remaining joins.
pub async fn replay(transport: &dyn Transport, topics: &[Topic]) -> Vec<ClientError> {
    let mut failures = Vec::new();
    for topic in topics {
        if let Err(e) = join(transport, topic).await {
            failures.push(e);
        }
    }
    debug!(
        topics = topics.len(),
        failed = failures.len(),
        "Replayed subscriptions"
    );
    failures
}

async fn call(transport: &dyn Transport, method: &str, topic: &Topic) -> Result<(), ClientError> {
    match transport.invoke(method, vec![topic.id.to_value()]).await {
        Ok(_) => {
            debug!(topic = %topic, method = %method, "Subscription call acknowledged");
            Ok(())
        }
        Err(e) => {
            warn!(topic = %topic, method = %method, error = %e, "Subscription call failed");
            Err(ClientError::SubscriptionFailure {
                topic: topic.clone(),
                reason: e.to_string(),
            })
        }
    }
}
