use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A customer (client) of the tenant's business. Read by the template
/// renderer when personalising drip-campaign emails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Customer {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl Customer {
    pub fn new(
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            first_name: first_name.into(),
            last_name: last_name.into(),
            email: email.into(),
            organization: None,
            phone: None,
        }
    }

    /// First and last name joined by a space, trimmed when either is empty.
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// Domain event emitted by the sequence engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub enrollment_id: Option<Uuid>,
    pub sequence_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub step_order: Option<u32>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Enrollment lifecycle
    Enrolled,
    Unsubscribed,
    SequenceCompleted,
    EnrollmentNeedsAttention,
    EnrollmentResumed,
    // Dispatch
    EmailSent,
    EmailFailed,
}
