use std::sync::Arc;

use chrono::Utc;
use studio_core::event_bus::{make_event, noop_sink, EventSink};
use studio_core::types::EventType;
use studio_core::{Customer, StudioError, StudioResult};
use tracing::info;
use uuid::Uuid;

use crate::state_machine::ensure_transition;
use crate::stats::{get_sequence_stats, SequenceStats};
use crate::store::SequenceStore;
use crate::types::{
    validate_delay, Enrollment, EnrollmentStatus, NewSequence, NewStep, Sequence, SequenceStep,
    StepUpdate, TriggerType,
};

/// Admin operations behind the sequence screens: sequence and step editing,
/// enrollment, unsubscribe and reporting.
#[derive(Clone)]
pub struct SequenceService {
    store: Arc<dyn SequenceStore>,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for SequenceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceService")
            .field("sequences", &self.store.list_sequences().len())
            .finish()
    }
}

impl SequenceService {
    pub fn new(store: Arc<dyn SequenceStore>) -> Self {
        Self {
            store,
            event_sink: noop_sink(),
        }
    }

    /// Attach an event sink for emitting domain events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn store(&self) -> Arc<dyn SequenceStore> {
        self.store.clone()
    }

    // ─── Sequences ─────────────────────────────────────────────────────────

    pub fn create_sequence(&self, req: NewSequence) -> StudioResult<Sequence> {
        if req.name.trim().is_empty() {
            return Err(StudioError::Validation("sequence name must not be empty".into()));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let steps = req
            .steps
            .into_iter()
            .enumerate()
            .map(|(order, step)| build_step(id, order as u32, step))
            .collect::<StudioResult<Vec<_>>>()?;

        let sequence = Sequence {
            id,
            name: req.name,
            description: req.description,
            trigger_type: req.trigger_type,
            trigger_config: req.trigger_config,
            is_active: req.is_active,
            steps,
            created_at: now,
            updated_at: now,
        };

        info!(sequence_id = %id, name = %sequence.name, steps = sequence.steps.len(), "Creating sequence");
        self.store.insert_sequence(sequence.clone())?;
        Ok(sequence)
    }

    pub fn get_sequence(&self, id: Uuid) -> StudioResult<Sequence> {
        self.store
            .get_sequence(id)
            .ok_or_else(|| StudioError::not_found("Sequence", id))
    }

    pub fn list_sequences(&self) -> Vec<Sequence> {
        self.store.list_sequences()
    }

    pub fn set_active(&self, id: Uuid, active: bool) -> StudioResult<Sequence> {
        let mut sequence = self.get_sequence(id)?;
        sequence.is_active = active;
        sequence.updated_at = Utc::now();
        info!(sequence_id = %id, active, "Toggling sequence");
        self.store.update_sequence(sequence.clone())?;
        Ok(sequence)
    }

    pub fn toggle_active(&self, id: Uuid) -> StudioResult<Sequence> {
        let current = self.get_sequence(id)?.is_active;
        self.set_active(id, !current)
    }

    pub fn delete_sequence(&self, id: Uuid) -> StudioResult<()> {
        self.store.delete_sequence(id)?;
        info!(sequence_id = %id, "Deleted sequence");
        Ok(())
    }

    // ─── Steps ─────────────────────────────────────────────────────────────

    /// Append a step at the end of the sequence.
    pub fn add_step(&self, sequence_id: Uuid, req: NewStep) -> StudioResult<SequenceStep> {
        let mut sequence = self.get_sequence(sequence_id)?;
        let step = build_step(sequence_id, sequence.steps.len() as u32, req)?;
        sequence.steps.push(step.clone());
        self.save(sequence)?;
        Ok(step)
    }

    pub fn update_step(&self, sequence_id: Uuid, step_id: Uuid, update: StepUpdate) -> StudioResult<SequenceStep> {
        let mut sequence = self.get_sequence(sequence_id)?;
        let step = sequence
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or_else(|| StudioError::not_found("Step", step_id))?;

        validate_delay(
            update.delay_days.unwrap_or(step.delay_days),
            update.delay_hours.unwrap_or(step.delay_hours),
        )?;

        if let Some(days) = update.delay_days {
            step.delay_days = days;
        }
        if let Some(hours) = update.delay_hours {
            step.delay_hours = hours;
        }
        if let Some(subject) = update.subject {
            step.subject = subject;
        }
        if let Some(html) = update.html_content {
            step.html_content = html;
        }
        if let Some(text) = update.text_content {
            step.text_content = text;
        }
        if let Some(conditions) = update.conditions {
            step.conditions = conditions;
        }

        let updated = step.clone();
        self.save(sequence)?;
        Ok(updated)
    }

    /// Remove the step at `step_order` and close the gap.
    pub fn delete_step(&self, sequence_id: Uuid, step_order: u32) -> StudioResult<Sequence> {
        let mut sequence = self.get_sequence(sequence_id)?;
        let before = sequence.steps.len();
        sequence.steps.retain(|s| s.step_order != step_order);
        if sequence.steps.len() == before {
            return Err(StudioError::not_found("Step", step_order));
        }
        renumber(&mut sequence.steps);
        self.save(sequence)
    }

    /// Reorder steps to match `step_ids`, which must name every step once.
    pub fn reorder_steps(&self, sequence_id: Uuid, step_ids: &[Uuid]) -> StudioResult<Sequence> {
        let mut sequence = self.get_sequence(sequence_id)?;
        if step_ids.len() != sequence.steps.len() {
            return Err(StudioError::Validation(format!(
                "expected {} step ids, got {}",
                sequence.steps.len(),
                step_ids.len()
            )));
        }

        let mut reordered = Vec::with_capacity(step_ids.len());
        for id in step_ids {
            let pos = sequence
                .steps
                .iter()
                .position(|s| s.id == *id)
                .ok_or_else(|| StudioError::Validation(format!("step {id} listed twice or not in sequence")))?;
            reordered.push(sequence.steps.swap_remove(pos));
        }
        renumber(&mut reordered);
        sequence.steps = reordered;
        self.save(sequence)
    }

    fn save(&self, mut sequence: Sequence) -> StudioResult<Sequence> {
        sequence.updated_at = Utc::now();
        self.store.update_sequence(sequence.clone())?;
        Ok(sequence)
    }

    // ─── Customers & enrollments ───────────────────────────────────────────

    pub fn upsert_customer(&self, customer: Customer) -> StudioResult<Customer> {
        self.store.upsert_customer(customer)
    }

    /// Enroll a customer; the first email is due after step 0's delay.
    pub fn enroll(&self, sequence_id: Uuid, customer_id: Uuid) -> StudioResult<Enrollment> {
        let sequence = self.get_sequence(sequence_id)?;
        if !sequence.is_active {
            return Err(StudioError::Validation(format!("sequence {sequence_id} is not active")));
        }
        let first = sequence
            .step_at(0)
            .ok_or_else(|| StudioError::Validation(format!("sequence {sequence_id} has no steps")))?;
        if self.store.get_customer(customer_id).is_none() {
            return Err(StudioError::not_found("Customer", customer_id));
        }

        let now = Utc::now();
        let enrollment = Enrollment {
            id: Uuid::new_v4(),
            sequence_id,
            customer_id,
            status: EnrollmentStatus::Active,
            current_step: 0,
            next_email_at: Some(first.due_after(now)?),
            emails_sent: 0,
            failed_attempts: 0,
            enrolled_at: now,
            completed_at: None,
        };
        self.store.insert_enrollment(enrollment.clone())?;

        info!(
            enrollment_id = %enrollment.id,
            sequence_id = %sequence_id,
            customer_id = %customer_id,
            "Customer enrolled in sequence"
        );
        self.emit(EventType::Enrolled, &enrollment);
        Ok(enrollment)
    }

    pub fn get_enrollment(&self, id: Uuid) -> StudioResult<Enrollment> {
        self.store
            .get_enrollment(id)
            .ok_or_else(|| StudioError::not_found("Enrollment", id))
    }

    pub fn list_enrollments(&self, sequence_id: Option<Uuid>) -> Vec<Enrollment> {
        self.store.list_enrollments(sequence_id)
    }

    pub fn unsubscribe(&self, enrollment_id: Uuid) -> StudioResult<Enrollment> {
        let mut enrollment = self.get_enrollment(enrollment_id)?;
        ensure_transition(enrollment.status, EnrollmentStatus::Unsubscribed)?;
        enrollment.status = EnrollmentStatus::Unsubscribed;
        enrollment.next_email_at = None;
        self.store.update_enrollment(&enrollment)?;
        info!(enrollment_id = %enrollment_id, "Enrollment unsubscribed");
        self.emit(EventType::Unsubscribed, &enrollment);
        Ok(enrollment)
    }

    /// Unsubscribe every open enrollment of every customer using `email`.
    /// Returns how many enrollments were closed.
    pub fn unsubscribe_email(&self, email: &str) -> StudioResult<usize> {
        let mut closed = 0;
        for customer in self.store.find_customers_by_email(email) {
            let open: Vec<Enrollment> = self
                .store
                .list_enrollments(None)
                .into_iter()
                .filter(|e| {
                    e.customer_id == customer.id
                        && matches!(e.status, EnrollmentStatus::Active | EnrollmentStatus::NeedsAttention)
                })
                .collect();
            for enrollment in open {
                self.unsubscribe(enrollment.id)?;
                closed += 1;
            }
        }
        Ok(closed)
    }

    /// Put a parked enrollment back on schedule; the failed step is retried
    /// on the next run.
    pub fn resume(&self, enrollment_id: Uuid) -> StudioResult<Enrollment> {
        let mut enrollment = self.get_enrollment(enrollment_id)?;
        ensure_transition(enrollment.status, EnrollmentStatus::Active)?;
        enrollment.status = EnrollmentStatus::Active;
        enrollment.failed_attempts = 0;
        enrollment.next_email_at = Some(Utc::now());
        self.store.update_enrollment(&enrollment)?;
        info!(enrollment_id = %enrollment_id, "Enrollment resumed");
        self.emit(EventType::EnrollmentResumed, &enrollment);
        Ok(enrollment)
    }

    pub fn stats(&self, sequence_id: Uuid) -> StudioResult<SequenceStats> {
        get_sequence_stats(self.store.as_ref(), sequence_id)
    }

    fn emit(&self, event_type: EventType, enrollment: &Enrollment) {
        self.event_sink.emit(make_event(
            event_type,
            Some(enrollment.id),
            Some(enrollment.sequence_id),
            Some(enrollment.customer_id),
            None,
        ));
    }

    // ─── Demo data ─────────────────────────────────────────────────────────

    /// Seeds two demo sequences for development.
    pub fn seed_demo_sequences(&self) -> StudioResult<Vec<Sequence>> {
        info!("Seeding demo sequences");

        let welcome = self.create_sequence(NewSequence {
            name: "Welcome Series".to_string(),
            description: "Onboarding emails for new clients".to_string(),
            trigger_type: TriggerType::ClientCreated,
            trigger_config: serde_json::json!({}),
            is_active: true,
            steps: vec![
                NewStep {
                    delay_days: 0,
                    delay_hours: 0,
                    subject: "Vítejte, {{customer.firstName}}!".to_string(),
                    html_content: "<p>Dobrý den {{customer.fullName}},</p><p>děkujeme, že jste s námi.</p>\
                                   <p><a href=\"{{unsubscribeUrl}}\">Odhlásit</a></p>"
                        .to_string(),
                    text_content: Some("Dobrý den {{customer.fullName}}, děkujeme, že jste s námi.".to_string()),
                    conditions: None,
                },
                NewStep {
                    delay_days: 3,
                    delay_hours: 0,
                    subject: "Tipy pro začátek".to_string(),
                    html_content: "<p>{{customer.firstName}}, tady je pár tipů.</p>".to_string(),
                    text_content: None,
                    conditions: None,
                },
            ],
        })?;

        let win_back = self.create_sequence(NewSequence {
            name: "Win-back".to_string(),
            description: "Re-engage clients without a booking".to_string(),
            trigger_type: TriggerType::DaysInactive,
            trigger_config: serde_json::json!({"inactiveDays": 90}),
            is_active: true,
            steps: vec![NewStep {
                delay_days: 0,
                delay_hours: 2,
                subject: "Chybíte nám, {{customer.firstName}}".to_string(),
                html_content: "<p>Rezervujte si termín do konce roku {{year}}.</p>".to_string(),
                text_content: None,
                conditions: None,
            }],
        })?;

        info!("Seeded 2 demo sequences");
        Ok(vec![welcome, win_back])
    }
}

fn build_step(sequence_id: Uuid, step_order: u32, req: NewStep) -> StudioResult<SequenceStep> {
    if req.subject.trim().is_empty() {
        return Err(StudioError::Validation("step subject must not be empty".into()));
    }
    validate_delay(req.delay_days, req.delay_hours)?;
    Ok(SequenceStep {
        id: Uuid::new_v4(),
        sequence_id,
        step_order,
        delay_days: req.delay_days,
        delay_hours: req.delay_hours,
        subject: req.subject,
        html_content: req.html_content,
        text_content: req.text_content,
        conditions: req.conditions,
    })
}

/// Renumber `step_order` contiguously from 0 in the current vector order.
fn renumber(steps: &mut [SequenceStep]) {
    for (order, step) in steps.iter_mut().enumerate() {
        step.step_order = order as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySequenceStore;
    use chrono::Duration;
    use studio_core::event_bus::capture_sink;

    fn service() -> SequenceService {
        SequenceService::new(Arc::new(InMemorySequenceStore::new()))
    }

    fn new_step(subject: &str, days: u32) -> NewStep {
        NewStep {
            delay_days: days,
            delay_hours: 0,
            subject: subject.to_string(),
            html_content: "<p>body</p>".to_string(),
            text_content: None,
            conditions: None,
        }
    }

    fn new_sequence(steps: Vec<NewStep>) -> NewSequence {
        NewSequence {
            name: "Package follow-up".to_string(),
            description: String::new(),
            trigger_type: TriggerType::PackagePurchased,
            trigger_config: serde_json::json!({}),
            is_active: true,
            steps,
        }
    }

    #[test]
    fn test_reorder_renumbers_contiguously() {
        let svc = service();
        let seq = svc
            .create_sequence(new_sequence(vec![new_step("a", 0), new_step("b", 1), new_step("c", 2)]))
            .unwrap();
        let ids: Vec<Uuid> = seq.steps.iter().rev().map(|s| s.id).collect();

        let reordered = svc.reorder_steps(seq.id, &ids).unwrap();

        let subjects: Vec<&str> = reordered.steps.iter().map(|s| s.subject.as_str()).collect();
        assert_eq!(subjects, ["c", "b", "a"]);
        let orders: Vec<u32> = reordered.steps.iter().map(|s| s.step_order).collect();
        assert_eq!(orders, [0, 1, 2]);
        assert_eq!(svc.get_sequence(seq.id).unwrap().steps[0].subject, "c");
    }

    #[test]
    fn test_reorder_rejects_incomplete_list() {
        let svc = service();
        let seq = svc
            .create_sequence(new_sequence(vec![new_step("a", 0), new_step("b", 1)]))
            .unwrap();
        let dup = vec![seq.steps[0].id, seq.steps[0].id];
        assert!(matches!(svc.reorder_steps(seq.id, &dup), Err(StudioError::Validation(_))));
    }

    #[test]
    fn test_update_step_changes_only_given_fields() {
        let svc = service();
        let seq = svc.create_sequence(new_sequence(vec![new_step("a", 2)])).unwrap();
        let step_id = seq.steps[0].id;

        let updated = svc
            .update_step(
                seq.id,
                step_id,
                StepUpdate {
                    subject: Some("Připomínka".to_string()),
                    delay_hours: Some(6),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(updated.subject, "Připomínka");
        assert_eq!(updated.delay_hours, 6);
        assert_eq!(updated.delay_days, 2);
        assert_eq!(svc.get_sequence(seq.id).unwrap().steps[0].subject, "Připomínka");
        assert!(svc.update_step(seq.id, Uuid::new_v4(), StepUpdate::default()).is_err());
    }

    #[test]
    fn test_update_step_clears_optional_fields() {
        let svc = service();
        let mut step = new_step("a", 0);
        step.text_content = Some("plain".to_string());
        step.conditions = Some(serde_json::json!({ "tag": "vip" }));
        let seq = svc.create_sequence(new_sequence(vec![step])).unwrap();
        let step_id = seq.steps[0].id;

        // Absent fields are kept.
        let kept = svc
            .update_step(
                seq.id,
                step_id,
                StepUpdate {
                    subject: Some("b".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(kept.text_content.as_deref(), Some("plain"));
        assert!(kept.conditions.is_some());

        let cleared = svc
            .update_step(
                seq.id,
                step_id,
                StepUpdate {
                    text_content: Some(None),
                    conditions: Some(None),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(cleared.text_content.is_none());
        assert!(cleared.conditions.is_none());
        assert!(svc.get_sequence(seq.id).unwrap().steps[0].text_content.is_none());
    }

    #[test]
    fn test_out_of_range_delay_rejected() {
        let svc = service();
        let huge = new_step("a", u32::MAX);
        assert!(matches!(
            svc.create_sequence(new_sequence(vec![huge])),
            Err(StudioError::Validation(_))
        ));

        let seq = svc.create_sequence(new_sequence(vec![new_step("a", 1)])).unwrap();
        let step_id = seq.steps[0].id;
        let result = svc.update_step(
            seq.id,
            step_id,
            StepUpdate {
                delay_hours: Some(u32::MAX),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(StudioError::Validation(_))));
        assert_eq!(svc.get_sequence(seq.id).unwrap().steps[0].delay_hours, 0);

        let mut late = new_step("b", 0);
        late.delay_hours = u32::MAX;
        assert!(svc.add_step(seq.id, late).is_err());
    }

    #[test]
    fn test_delete_step_closes_gap() {
        let svc = service();
        let seq = svc
            .create_sequence(new_sequence(vec![new_step("a", 0), new_step("b", 1), new_step("c", 2)]))
            .unwrap();

        let updated = svc.delete_step(seq.id, 1).unwrap();

        let pairs: Vec<(u32, &str)> = updated
            .steps
            .iter()
            .map(|s| (s.step_order, s.subject.as_str()))
            .collect();
        assert_eq!(pairs, [(0, "a"), (1, "c")]);
    }

    #[test]
    fn test_enroll_schedules_first_step_delay() {
        let svc = service();
        let seq = svc.create_sequence(new_sequence(vec![new_step("a", 1)])).unwrap();
        let customer = svc
            .upsert_customer(Customer::new("Jan", "Novák", "jan@example.cz"))
            .unwrap();

        let before = Utc::now();
        let enrollment = svc.enroll(seq.id, customer.id).unwrap();

        let next = enrollment.next_email_at.unwrap();
        assert!(next >= before + Duration::days(1));
        assert_eq!(enrollment.current_step, 0);
        assert!(matches!(svc.enroll(seq.id, customer.id), Err(StudioError::Conflict(_))));
    }

    #[test]
    fn test_enroll_requires_active_sequence_with_steps() {
        let svc = service();
        let customer = svc
            .upsert_customer(Customer::new("Jan", "Novák", "jan@example.cz"))
            .unwrap();

        let empty = svc.create_sequence(new_sequence(Vec::new())).unwrap();
        assert!(svc.enroll(empty.id, customer.id).is_err());

        let paused = svc.create_sequence(new_sequence(vec![new_step("a", 0)])).unwrap();
        svc.toggle_active(paused.id).unwrap();
        assert!(matches!(svc.enroll(paused.id, customer.id), Err(StudioError::Validation(_))));
    }

    #[test]
    fn test_unsubscribe_by_email() {
        let sink = capture_sink();
        let svc = service().with_event_sink(sink.clone());
        let first = svc.create_sequence(new_sequence(vec![new_step("a", 0)])).unwrap();
        let second = svc.create_sequence(new_sequence(vec![new_step("b", 0)])).unwrap();
        let customer = svc
            .upsert_customer(Customer::new("Jan", "Novák", "Jan@Example.cz"))
            .unwrap();
        let e1 = svc.enroll(first.id, customer.id).unwrap();
        svc.enroll(second.id, customer.id).unwrap();

        let closed = svc.unsubscribe_email("jan@example.cz").unwrap();

        assert_eq!(closed, 2);
        let e1 = svc.get_enrollment(e1.id).unwrap();
        assert_eq!(e1.status, EnrollmentStatus::Unsubscribed);
        assert!(e1.next_email_at.is_none());
        assert_eq!(sink.count_type(EventType::Unsubscribed), 2);
        assert!(svc.unsubscribe(e1.id).is_err());
    }

    #[test]
    fn test_resume_requires_needs_attention() {
        let svc = service();
        let seq = svc.create_sequence(new_sequence(vec![new_step("a", 0)])).unwrap();
        let customer = svc
            .upsert_customer(Customer::new("Jan", "Novák", "jan@example.cz"))
            .unwrap();
        let mut enrollment = svc.enroll(seq.id, customer.id).unwrap();
        assert!(svc.resume(enrollment.id).is_err());

        enrollment.status = EnrollmentStatus::NeedsAttention;
        enrollment.failed_attempts = 10;
        enrollment.next_email_at = None;
        svc.store().update_enrollment(&enrollment).unwrap();

        let resumed = svc.resume(enrollment.id).unwrap();
        assert_eq!(resumed.status, EnrollmentStatus::Active);
        assert_eq!(resumed.failed_attempts, 0);
        assert!(resumed.next_email_at.is_some());
    }

    #[test]
    fn test_seed_demo_sequences() {
        let svc = service();
        let seeded = svc.seed_demo_sequences().unwrap();
        assert_eq!(seeded.len(), 2);
        assert_eq!(svc.list_sequences().len(), 2);
    }
}
