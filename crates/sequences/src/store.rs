//! Persistence for sequences, enrollments, customers and the send log.
//!
//! [`InMemorySequenceStore`] is backed by DashMap. A relational backend
//! implements the same trait; `record_delivery` must then run in one
//! transaction, and the compare-and-set writes become a conditional
//! `UPDATE ... WHERE status = $expected AND current_step = $expected`.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use studio_core::{Customer, StudioError, StudioResult};
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{DeliveryStatus, EmailSequenceEmail, Enrollment, EnrollmentStatus, Sequence};

/// Storage collaborator used by the service, processor and stats aggregator.
pub trait SequenceStore: Send + Sync {
    // Customers
    fn upsert_customer(&self, customer: Customer) -> StudioResult<Customer>;
    fn get_customer(&self, id: Uuid) -> Option<Customer>;
    fn find_customers_by_email(&self, email: &str) -> Vec<Customer>;

    // Sequences (steps travel with their sequence)
    fn insert_sequence(&self, sequence: Sequence) -> StudioResult<()>;
    fn get_sequence(&self, id: Uuid) -> Option<Sequence>;
    fn list_sequences(&self) -> Vec<Sequence>;
    fn update_sequence(&self, sequence: Sequence) -> StudioResult<()>;
    /// Fails with `Conflict` while any enrollment references the sequence.
    fn delete_sequence(&self, id: Uuid) -> StudioResult<()>;

    // Enrollments
    /// Fails with `Conflict` if the customer already has an active
    /// enrollment in the same sequence.
    fn insert_enrollment(&self, enrollment: Enrollment) -> StudioResult<()>;
    fn get_enrollment(&self, id: Uuid) -> Option<Enrollment>;
    fn list_enrollments(&self, sequence_id: Option<Uuid>) -> Vec<Enrollment>;
    /// Unconditional write, used by admin operations.
    fn update_enrollment(&self, enrollment: &Enrollment) -> StudioResult<()>;
    /// Write `updated` only if the stored enrollment still has the status
    /// and cursor of `expected`; `Conflict` otherwise.
    fn advance_enrollment(&self, expected: &Enrollment, updated: &Enrollment) -> StudioResult<()>;
    /// Active enrollments whose `next_email_at` has elapsed.
    fn due_enrollments(&self, now: DateTime<Utc>) -> Vec<Enrollment>;
    fn count_enrollments(&self, sequence_id: Uuid, status: Option<EnrollmentStatus>) -> u64;

    // Send log
    /// Append a log row and persist the enrollment as one unit.
    ///
    /// The row is always appended, since the send already happened. The
    /// enrollment write follows [`SequenceStore::advance_enrollment`]: when the
    /// stored record no longer matches `expected` it is left untouched and
    /// `Conflict` is returned.
    fn record_delivery(
        &self,
        email: EmailSequenceEmail,
        expected: &Enrollment,
        updated: &Enrollment,
    ) -> StudioResult<()>;
    /// The earliest non-failed row for this (enrollment, step) pair.
    fn delivered_step(&self, enrollment_id: Uuid, step_order: u32) -> Option<EmailSequenceEmail>;
    fn has_delivered_step(&self, enrollment_id: Uuid, step_order: u32) -> bool {
        self.delivered_step(enrollment_id, step_order).is_some()
    }
    fn emails_for_enrollment(&self, enrollment_id: Uuid) -> Vec<EmailSequenceEmail>;
    fn email_status_counts(&self, sequence_id: Uuid) -> HashMap<DeliveryStatus, u64>;
}

/// Thread-safe in-memory store.
pub struct InMemorySequenceStore {
    customers: DashMap<Uuid, Customer>,
    sequences: DashMap<Uuid, Sequence>,
    enrollments: DashMap<Uuid, Enrollment>,
    emails: RwLock<Vec<EmailSequenceEmail>>,
    enroll_gate: Mutex<()>,
}

impl InMemorySequenceStore {
    pub fn new() -> Self {
        info!("Sequence store initialized (in-memory)");
        Self {
            customers: DashMap::new(),
            sequences: DashMap::new(),
            enrollments: DashMap::new(),
            emails: RwLock::new(Vec::new()),
            enroll_gate: Mutex::new(()),
        }
    }
}

impl Default for InMemorySequenceStore {
    fn default() -> Self {
        Self::new()
    }
}

/// The processor only moves an enrollment it still owns: same status, same step.
fn unchanged_since(stored: &Enrollment, expected: &Enrollment) -> StudioResult<()> {
    if stored.status == expected.status && stored.current_step == expected.current_step {
        return Ok(());
    }
    Err(StudioError::Conflict(format!(
        "enrollment {} moved to {:?} at step {} (expected {:?} at step {})",
        stored.id, stored.status, stored.current_step, expected.status, expected.current_step
    )))
}

fn sorted(mut sequence: Sequence) -> Sequence {
    sequence.steps.sort_by_key(|s| s.step_order);
    sequence
}

impl SequenceStore for InMemorySequenceStore {
    fn upsert_customer(&self, customer: Customer) -> StudioResult<Customer> {
        if customer.email.trim().is_empty() {
            return Err(StudioError::Validation("customer email must not be empty".into()));
        }
        self.customers.insert(customer.id, customer.clone());
        Ok(customer)
    }

    fn get_customer(&self, id: Uuid) -> Option<Customer> {
        self.customers.get(&id).map(|r| r.value().clone())
    }

    fn find_customers_by_email(&self, email: &str) -> Vec<Customer> {
        self.customers
            .iter()
            .filter(|r| r.value().email.eq_ignore_ascii_case(email))
            .map(|r| r.value().clone())
            .collect()
    }

    fn insert_sequence(&self, sequence: Sequence) -> StudioResult<()> {
        if self.sequences.contains_key(&sequence.id) {
            return Err(StudioError::Conflict(format!("sequence {} already exists", sequence.id)));
        }
        self.sequences.insert(sequence.id, sorted(sequence));
        Ok(())
    }

    fn get_sequence(&self, id: Uuid) -> Option<Sequence> {
        self.sequences.get(&id).map(|r| r.value().clone())
    }

    fn list_sequences(&self) -> Vec<Sequence> {
        let mut sequences: Vec<Sequence> =
            self.sequences.iter().map(|r| r.value().clone()).collect();
        sequences.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sequences
    }

    fn update_sequence(&self, sequence: Sequence) -> StudioResult<()> {
        let mut entry = self
            .sequences
            .get_mut(&sequence.id)
            .ok_or_else(|| StudioError::not_found("Sequence", sequence.id))?;
        *entry = sorted(sequence);
        Ok(())
    }

    fn delete_sequence(&self, id: Uuid) -> StudioResult<()> {
        let referenced = self.enrollments.iter().any(|r| r.value().sequence_id == id);
        if referenced {
            return Err(StudioError::Conflict(format!(
                "sequence {id} still has enrollments"
            )));
        }
        self.sequences
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StudioError::not_found("Sequence", id))
    }

    fn insert_enrollment(&self, enrollment: Enrollment) -> StudioResult<()> {
        let _gate = self.enroll_gate.lock();
        let duplicate = self.enrollments.iter().any(|r| {
            let e = r.value();
            e.customer_id == enrollment.customer_id
                && e.sequence_id == enrollment.sequence_id
                && matches!(e.status, EnrollmentStatus::Active | EnrollmentStatus::NeedsAttention)
        });
        if duplicate {
            return Err(StudioError::Conflict(format!(
                "customer {} is already enrolled in sequence {}",
                enrollment.customer_id, enrollment.sequence_id
            )));
        }
        self.enrollments.insert(enrollment.id, enrollment);
        Ok(())
    }

    fn get_enrollment(&self, id: Uuid) -> Option<Enrollment> {
        self.enrollments.get(&id).map(|r| r.value().clone())
    }

    fn list_enrollments(&self, sequence_id: Option<Uuid>) -> Vec<Enrollment> {
        let mut enrollments: Vec<Enrollment> = self
            .enrollments
            .iter()
            .filter(|r| sequence_id.map_or(true, |id| r.value().sequence_id == id))
            .map(|r| r.value().clone())
            .collect();
        enrollments.sort_by(|a, b| a.enrolled_at.cmp(&b.enrolled_at));
        enrollments
    }

    fn update_enrollment(&self, enrollment: &Enrollment) -> StudioResult<()> {
        let mut entry = self
            .enrollments
            .get_mut(&enrollment.id)
            .ok_or_else(|| StudioError::not_found("Enrollment", enrollment.id))?;
        *entry = enrollment.clone();
        Ok(())
    }

    fn advance_enrollment(&self, expected: &Enrollment, updated: &Enrollment) -> StudioResult<()> {
        let mut entry = self
            .enrollments
            .get_mut(&expected.id)
            .ok_or_else(|| StudioError::not_found("Enrollment", expected.id))?;
        unchanged_since(&entry, expected)?;
        *entry = updated.clone();
        Ok(())
    }

    fn due_enrollments(&self, now: DateTime<Utc>) -> Vec<Enrollment> {
        let mut due: Vec<Enrollment> = self
            .enrollments
            .iter()
            .filter(|r| r.value().is_due(now))
            .map(|r| r.value().clone())
            .collect();
        due.sort_by(|a, b| a.next_email_at.cmp(&b.next_email_at));
        debug!(count = due.len(), "Loaded due enrollments");
        due
    }

    fn count_enrollments(&self, sequence_id: Uuid, status: Option<EnrollmentStatus>) -> u64 {
        self.enrollments
            .iter()
            .filter(|r| {
                let e = r.value();
                e.sequence_id == sequence_id && status.map_or(true, |s| e.status == s)
            })
            .count() as u64
    }

    fn record_delivery(
        &self,
        email: EmailSequenceEmail,
        expected: &Enrollment,
        updated: &Enrollment,
    ) -> StudioResult<()> {
        let mut emails = self.emails.write();
        let mut entry = self
            .enrollments
            .get_mut(&expected.id)
            .ok_or_else(|| StudioError::not_found("Enrollment", expected.id))?;
        emails.push(email);
        unchanged_since(&entry, expected)?;
        *entry = updated.clone();
        Ok(())
    }

    fn delivered_step(&self, enrollment_id: Uuid, step_order: u32) -> Option<EmailSequenceEmail> {
        self.emails
            .read()
            .iter()
            .find(|e| {
                e.enrollment_id == enrollment_id
                    && e.step_order == step_order
                    && e.status != DeliveryStatus::Failed
            })
            .cloned()
    }

    fn emails_for_enrollment(&self, enrollment_id: Uuid) -> Vec<EmailSequenceEmail> {
        self.emails
            .read()
            .iter()
            .filter(|e| e.enrollment_id == enrollment_id)
            .cloned()
            .collect()
    }

    fn email_status_counts(&self, sequence_id: Uuid) -> HashMap<DeliveryStatus, u64> {
        let enrollment_ids: HashSet<Uuid> = self
            .enrollments
            .iter()
            .filter(|r| r.value().sequence_id == sequence_id)
            .map(|r| *r.key())
            .collect();

        let mut counts = HashMap::new();
        for email in self.emails.read().iter() {
            if enrollment_ids.contains(&email.enrollment_id) {
                *counts.entry(email.status).or_insert(0) += 1;
            }
        }
        counts
    }
}
