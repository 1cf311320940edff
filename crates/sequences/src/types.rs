use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use studio_core::{StudioError, StudioResult};
use uuid::Uuid;

/// Upper bound on a single step delay, roughly ten years.
pub const MAX_DELAY_DAYS: u32 = 3_650;
pub const MAX_DELAY_HOURS: u32 = MAX_DELAY_DAYS * 24;

/// A named drip campaign owning an ordered list of email steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub trigger_type: TriggerType,
    /// Free-form trigger parameters, e.g. `{"inactiveDays": 90}`.
    pub trigger_config: serde_json::Value,
    pub is_active: bool,
    /// Always sorted ascending by `step_order`.
    pub steps: Vec<SequenceStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sequence {
    /// Step at the given zero-based cursor position.
    pub fn step_at(&self, index: u32) -> Option<&SequenceStep> {
        self.steps.get(index as usize)
    }
}

/// Business event that enrolls a customer into a sequence. Evaluating the
/// trigger happens outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    ClientCreated,
    PackagePurchased,
    SessionCompleted,
    #[serde(alias = "no_booking_days")]
    DaysInactive,
    MembershipExpiring,
    InvoicePaid,
    QuoteSent,
    Manual,
}

/// One email within a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceStep {
    pub id: Uuid,
    pub sequence_id: Uuid,
    /// Zero-based, unique and gapless within the sequence.
    pub step_order: u32,
    /// Delay measured from the previous step's send (or from enrollment for step 0).
    pub delay_days: u32,
    pub delay_hours: u32,
    pub subject: String,
    pub html_content: String,
    pub text_content: Option<String>,
    /// Carried through unchanged; the processor does not evaluate it.
    pub conditions: Option<serde_json::Value>,
}

impl SequenceStep {
    pub fn delay(&self) -> Duration {
        Duration::days(i64::from(self.delay_days)) + Duration::hours(i64::from(self.delay_hours))
    }

    /// When this step is due if the previous send happened at `base`.
    pub fn due_after(&self, base: DateTime<Utc>) -> StudioResult<DateTime<Utc>> {
        base.checked_add_signed(self.delay()).ok_or_else(|| {
            StudioError::Validation(format!(
                "step {} delay of {}d {}h overflows the schedule",
                self.step_order, self.delay_days, self.delay_hours
            ))
        })
    }
}

/// Reject delays the scheduler cannot represent.
pub fn validate_delay(delay_days: u32, delay_hours: u32) -> StudioResult<()> {
    if delay_days > MAX_DELAY_DAYS {
        return Err(StudioError::Validation(format!(
            "delay_days must be at most {MAX_DELAY_DAYS}, got {delay_days}"
        )));
    }
    if delay_hours > MAX_DELAY_HOURS {
        return Err(StudioError::Validation(format!(
            "delay_hours must be at most {MAX_DELAY_HOURS}, got {delay_hours}"
        )));
    }
    Ok(())
}

/// One customer's progress through one sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub customer_id: Uuid,
    pub status: EnrollmentStatus,
    /// Zero-based cursor into the sequence's steps.
    pub current_step: u32,
    /// `None` means no further email is scheduled.
    pub next_email_at: Option<DateTime<Utc>>,
    pub emails_sent: u32,
    /// Consecutive failed sends of the current step.
    pub failed_attempts: u32,
    pub enrolled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Enrollment {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EnrollmentStatus::Active
            && self.next_email_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Unsubscribed,
    /// Retries exhausted; waits for an operator to resume or unsubscribe.
    NeedsAttention,
}

/// Immutable log record of one send attempt for one (enrollment, step) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSequenceEmail {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub step_order: u32,
    /// `None` when the attempt failed.
    pub sent_at: Option<DateTime<Utc>>,
    pub status: DeliveryStatus,
    /// Provider message id (Resend).
    pub resend_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Failed,
}

// ─── Requests ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSequence {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trigger_type: TriggerType,
    #[serde(default = "empty_object")]
    pub trigger_config: serde_json::Value,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub steps: Vec<NewStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStep {
    #[serde(default)]
    pub delay_days: u32,
    #[serde(default)]
    pub delay_hours: u32,
    pub subject: String,
    pub html_content: String,
    #[serde(default)]
    pub text_content: Option<String>,
    #[serde(default)]
    pub conditions: Option<serde_json::Value>,
}

/// Partial update of a step; an absent field is left unchanged.
///
/// `text_content` and `conditions` can be cleared: `Some(None)` (JSON `null`)
/// removes the value, `None` (field absent) keeps it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepUpdate {
    pub delay_days: Option<u32>,
    pub delay_hours: Option<u32>,
    pub subject: Option<String>,
    pub html_content: Option<String>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub text_content: Option<Option<String>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Option<serde_json::Value>>,
}

/// Marks a field that appeared in the payload, even as `null`.
fn present<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

fn default_true() -> bool {
    true
}
