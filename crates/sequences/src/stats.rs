//! Read-only rollups over enrollments and the send log of one sequence.

use serde::{Deserialize, Serialize};
use studio_core::{StudioError, StudioResult};
use uuid::Uuid;

use crate::store::SequenceStore;
use crate::types::{DeliveryStatus, EnrollmentStatus};

/// Count of send-log rows per delivery status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailStatusBreakdown {
    pub sent: u64,
    pub delivered: u64,
    pub opened: u64,
    pub clicked: u64,
    pub bounced: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceStats {
    pub sequence_id: Uuid,
    pub total_enrollments: u64,
    pub active_enrollments: u64,
    pub completed_enrollments: u64,
    pub unsubscribed_enrollments: u64,
    pub needs_attention_enrollments: u64,
    pub total_emails_sent: u64,
    pub email_stats: EmailStatusBreakdown,
    /// Percentage of opened over sent.
    pub open_rate: f64,
    /// Percentage of clicked over opened.
    pub click_rate: f64,
}

/// Recompute the stats of `sequence_id` from the store.
pub fn get_sequence_stats(store: &dyn SequenceStore, sequence_id: Uuid) -> StudioResult<SequenceStats> {
    if store.get_sequence(sequence_id).is_none() {
        return Err(StudioError::not_found("Sequence", sequence_id));
    }

    let counts = store.email_status_counts(sequence_id);
    let count = |status: DeliveryStatus| counts.get(&status).copied().unwrap_or(0);
    let email_stats = EmailStatusBreakdown {
        sent: count(DeliveryStatus::Sent),
        delivered: count(DeliveryStatus::Delivered),
        opened: count(DeliveryStatus::Opened),
        clicked: count(DeliveryStatus::Clicked),
        bounced: count(DeliveryStatus::Bounced),
        failed: count(DeliveryStatus::Failed),
    };

    Ok(SequenceStats {
        sequence_id,
        total_enrollments: store.count_enrollments(sequence_id, None),
        active_enrollments: store.count_enrollments(sequence_id, Some(EnrollmentStatus::Active)),
        completed_enrollments: store
            .count_enrollments(sequence_id, Some(EnrollmentStatus::Completed)),
        unsubscribed_enrollments: store
            .count_enrollments(sequence_id, Some(EnrollmentStatus::Unsubscribed)),
        needs_attention_enrollments: store
            .count_enrollments(sequence_id, Some(EnrollmentStatus::NeedsAttention)),
        total_emails_sent: email_stats.sent,
        open_rate: percentage(email_stats.opened, email_stats.sent),
        click_rate: percentage(email_stats.clicked, email_stats.opened),
        email_stats,
    })
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}
