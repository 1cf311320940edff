//! Sequence processor. Polls due enrollments, renders and dispatches one
//! email per enrollment, then advances, completes or parks it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use studio_channels::{EmailSender, OutboundEmail};
use studio_core::config::{SequencesConfig, MAX_RETRY_BACKOFF_SECS};
use studio_core::event_bus::{make_event, noop_sink, EventSink};
use studio_core::types::EventType;
use studio_core::{StudioError, StudioResult};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::state_machine::ensure_transition;
use crate::store::SequenceStore;
use crate::template::{TemplateContext, TemplateRenderer};
use crate::types::{
    DeliveryStatus, EmailSequenceEmail, Enrollment, EnrollmentStatus, Sequence, SequenceStep,
};

/// Aggregate counts for one processor run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSummary {
    pub processed: u32,
    pub sent: u32,
    pub failed: u32,
    pub completed: u32,
    pub needs_attention: u32,
    /// Enrollments that were unsubscribed or otherwise moved while the run
    /// held them; nothing was advanced.
    pub skipped: u32,
    /// Steps found already delivered by an earlier run; advanced without a
    /// new send and not counted in `sent`.
    pub replayed: u32,
}

/// How failed sends are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts before the enrollment moves to `needs_attention`.
    /// 0 retries forever.
    pub max_attempts: u32,
    /// Base delay, doubled per consecutive failure. Zero keeps
    /// `next_email_at` unchanged so the next tick retries.
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SequencesConfig) -> Self {
        let secs = |value: u64| Duration::seconds(value.min(MAX_RETRY_BACKOFF_SECS) as i64);
        Self {
            max_attempts: config.max_attempts,
            backoff: secs(config.retry_backoff_secs),
            max_backoff: secs(config.max_backoff_secs),
        }
    }

    /// Retry forever on every tick.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: 0,
            backoff: Duration::zero(),
            max_backoff: Duration::zero(),
        }
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }

    /// Delay before the next attempt after `attempts` consecutive failures.
    fn delay_after(&self, attempts: u32) -> Option<Duration> {
        if self.backoff <= Duration::zero() {
            return None;
        }
        let exponent = attempts.saturating_sub(1).min(20);
        let cap = self.max_backoff.max(self.backoff).num_milliseconds();
        let millis = self
            .backoff
            .num_milliseconds()
            .saturating_mul(1_i64 << exponent)
            .min(cap);
        Some(Duration::milliseconds(millis))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SequencesConfig::default())
    }
}

/// What happened to a single enrollment during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnrollmentOutcome {
    /// Email sent and cursor moved to the next step.
    Advanced,
    /// Email sent and it was the last step.
    Finished,
    /// Cursor was already past the last step.
    ClosedWithoutSend,
    /// Send failed; retried later.
    SendFailed,
    /// Send failed and the retry budget is spent.
    Parked,
    /// The enrollment moved under the run; left as found.
    Superseded,
    /// Step was already delivered; cursor moved without a send.
    Replayed { finished: bool },
}

/// Scheduling and dispatch engine for email sequences.
pub struct SequenceProcessor {
    store: Arc<dyn SequenceStore>,
    sender: Arc<dyn EmailSender>,
    renderer: TemplateRenderer,
    retry: RetryPolicy,
    event_sink: Arc<dyn EventSink>,
    run_lock: Mutex<()>,
}

impl std::fmt::Debug for SequenceProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceProcessor")
            .field("provider", &self.sender.provider_name())
            .field("retry", &self.retry)
            .finish()
    }
}

impl SequenceProcessor {
    pub fn new(
        store: Arc<dyn SequenceStore>,
        sender: Arc<dyn EmailSender>,
        renderer: TemplateRenderer,
    ) -> Self {
        Self {
            store,
            sender,
            renderer,
            retry: RetryPolicy::default(),
            event_sink: noop_sink(),
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Attach an event sink for emitting domain events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Process every due enrollment as of now.
    pub async fn process_email_sequences(&self) -> ProcessSummary {
        self.process_at(Utc::now()).await
    }

    /// Run unless another run is in flight; `None` when skipped.
    pub async fn try_process(&self) -> Option<ProcessSummary> {
        let _guard = self.run_lock.try_lock().ok()?;
        Some(self.run(Utc::now()).await)
    }

    /// Process every enrollment due at `now`, waiting for any in-flight run.
    pub async fn process_at(&self, now: DateTime<Utc>) -> ProcessSummary {
        let _guard = self.run_lock.lock().await;
        self.run(now).await
    }

    async fn run(&self, now: DateTime<Utc>) -> ProcessSummary {
        let due = self.store.due_enrollments(now);
        let mut summary = ProcessSummary::default();

        if !due.is_empty() {
            info!(count = due.len(), "Processing due sequence enrollments");
        }

        for enrollment in due {
            summary.processed += 1;
            metrics::counter!("sequences.processed").increment(1);

            match self.process_enrollment(enrollment.clone(), now).await {
                Ok(EnrollmentOutcome::Advanced) => summary.sent += 1,
                Ok(EnrollmentOutcome::Finished) => {
                    summary.sent += 1;
                    summary.completed += 1;
                }
                Ok(EnrollmentOutcome::ClosedWithoutSend) => summary.completed += 1,
                Ok(EnrollmentOutcome::SendFailed) => summary.failed += 1,
                Ok(EnrollmentOutcome::Parked) => {
                    summary.failed += 1;
                    summary.needs_attention += 1;
                }
                Ok(EnrollmentOutcome::Superseded) => summary.skipped += 1,
                Ok(EnrollmentOutcome::Replayed { finished }) => {
                    summary.replayed += 1;
                    if finished {
                        summary.completed += 1;
                    }
                }
                Err(e) => {
                    error!(
                        enrollment_id = %enrollment.id,
                        sequence_id = %enrollment.sequence_id,
                        step = enrollment.current_step,
                        error = %e,
                        "Failed to process enrollment"
                    );
                    metrics::counter!("sequences.errors").increment(1);
                    summary.failed += 1;
                }
            }
        }

        if summary.processed > 0 {
            info!(
                processed = summary.processed,
                sent = summary.sent,
                failed = summary.failed,
                completed = summary.completed,
                needs_attention = summary.needs_attention,
                skipped = summary.skipped,
                replayed = summary.replayed,
                "Sequence run finished"
            );
        }
        summary
    }

    async fn process_enrollment(
        &self,
        snapshot: Enrollment,
        now: DateTime<Utc>,
    ) -> StudioResult<EnrollmentOutcome> {
        // The batch snapshot can be stale by the time this enrollment's turn comes.
        let current = self
            .store
            .get_enrollment(snapshot.id)
            .ok_or_else(|| StudioError::not_found("Enrollment", snapshot.id))?;
        if !current.is_due(now) || current.current_step != snapshot.current_step {
            debug!(
                enrollment_id = %current.id,
                status = ?current.status,
                step = current.current_step,
                "Enrollment no longer due, skipping"
            );
            return Ok(EnrollmentOutcome::Superseded);
        }

        let sequence = self
            .store
            .get_sequence(current.sequence_id)
            .ok_or_else(|| StudioError::not_found("Sequence", current.sequence_id))?;
        let mut enrollment = current.clone();

        let Some(step) = sequence.step_at(current.current_step).cloned() else {
            // Steps were removed after enrollment; treat as completion.
            self.complete(&mut enrollment, now)?;
            if !self.committed(self.store.advance_enrollment(&current, &enrollment), current.id)? {
                return Ok(EnrollmentOutcome::Superseded);
            }
            self.emit(EventType::SequenceCompleted, &enrollment, None);
            return Ok(EnrollmentOutcome::ClosedWithoutSend);
        };

        // A previous run may have sent this step without persisting the advance.
        if let Some(prior) = self.store.delivered_step(current.id, step.step_order) {
            let sent_at = prior.sent_at.unwrap_or(now);
            warn!(
                enrollment_id = %current.id,
                step_order = step.step_order,
                sent_at = %sent_at,
                "Step already delivered, advancing without resend"
            );
            let finished = self.advance(&mut enrollment, &sequence, sent_at)?;
            if !self.committed(self.store.advance_enrollment(&current, &enrollment), current.id)? {
                return Ok(EnrollmentOutcome::Superseded);
            }
            metrics::counter!("sequences.replayed").increment(1);
            if finished {
                self.emit(EventType::SequenceCompleted, &enrollment, None);
            }
            return Ok(EnrollmentOutcome::Replayed { finished });
        }

        let customer = self
            .store
            .get_customer(current.customer_id)
            .ok_or_else(|| StudioError::not_found("Customer", current.customer_id))?;

        // Schedule before dispatch so an unschedulable step fails without a send.
        let finished = self.advance(&mut enrollment, &sequence, now)?;

        let email = self.render(&step, &TemplateContext::new(&customer, &sequence).at(now));

        debug!(
            enrollment_id = %current.id,
            step_order = step.step_order,
            to = %email.to,
            "Dispatching sequence email"
        );
        let outcome = self.sender.send_email(&email).await;

        let mut log = EmailSequenceEmail {
            id: Uuid::new_v4(),
            enrollment_id: current.id,
            step_order: step.step_order,
            sent_at: None,
            status: DeliveryStatus::Failed,
            resend_id: outcome.message_id.clone(),
            error: outcome.error.clone(),
            created_at: now,
        };

        if outcome.success {
            log.sent_at = Some(now);
            log.status = DeliveryStatus::Sent;
            metrics::counter!("sequences.emails_sent").increment(1);
            if !self.committed(self.store.record_delivery(log, &current, &enrollment), current.id)? {
                return Ok(EnrollmentOutcome::Superseded);
            }
            return Ok(self.after_advance(&enrollment, step.step_order, finished));
        }

        warn!(
            enrollment_id = %current.id,
            step_order = step.step_order,
            attempts = current.failed_attempts + 1,
            error = outcome.error.as_deref().unwrap_or("unknown"),
            "Sequence email failed"
        );
        metrics::counter!("sequences.emails_failed").increment(1);

        let mut failed = current.clone();
        let parked = self.register_failure(&mut failed, now)?;
        if !self.committed(self.store.record_delivery(log, &current, &failed), current.id)? {
            return Ok(EnrollmentOutcome::Superseded);
        }
        self.emit(EventType::EmailFailed, &failed, Some(step.step_order));

        if parked {
            metrics::counter!("sequences.needs_attention").increment(1);
            self.emit(EventType::EnrollmentNeedsAttention, &failed, Some(step.step_order));
            Ok(EnrollmentOutcome::Parked)
        } else {
            Ok(EnrollmentOutcome::SendFailed)
        }
    }

    /// `Ok(false)` when the store refused the write because the enrollment
    /// changed underneath the run.
    fn committed(&self, result: StudioResult<()>, enrollment_id: Uuid) -> StudioResult<bool> {
        match result {
            Ok(()) => Ok(true),
            Err(StudioError::Conflict(reason)) => {
                warn!(
                    enrollment_id = %enrollment_id,
                    reason = %reason,
                    "Enrollment changed during processing, advance dropped"
                );
                metrics::counter!("sequences.superseded").increment(1);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn render(&self, step: &SequenceStep, ctx: &TemplateContext<'_>) -> OutboundEmail {
        OutboundEmail {
            to: ctx.customer.email.clone(),
            subject: self.renderer.render(&step.subject, ctx),
            html: self.renderer.render(&step.html_content, ctx),
            text: step
                .text_content
                .as_deref()
                .map(|text| self.renderer.render(text, ctx)),
        }
    }

    /// Move the cursor past the step sent at `sent_at`. Returns `true` when
    /// the sequence has no further step and the enrollment was completed.
    fn advance(
        &self,
        enrollment: &mut Enrollment,
        sequence: &Sequence,
        sent_at: DateTime<Utc>,
    ) -> StudioResult<bool> {
        let next_index = enrollment.current_step + 1;

        let finished = match sequence.step_at(next_index) {
            Some(next_step) => {
                enrollment.next_email_at = Some(next_step.due_after(sent_at)?);
                enrollment.current_step = next_index;
                false
            }
            None => {
                self.complete(enrollment, sent_at)?;
                true
            }
        };
        enrollment.emails_sent += 1;
        enrollment.failed_attempts = 0;
        Ok(finished)
    }

    fn after_advance(&self, enrollment: &Enrollment, step_order: u32, finished: bool) -> EnrollmentOutcome {
        self.emit(EventType::EmailSent, enrollment, Some(step_order));
        if finished {
            info!(enrollment_id = %enrollment.id, "Enrollment completed sequence");
            metrics::counter!("sequences.completed").increment(1);
            self.emit(EventType::SequenceCompleted, enrollment, None);
            EnrollmentOutcome::Finished
        } else {
            EnrollmentOutcome::Advanced
        }
    }

    fn complete(&self, enrollment: &mut Enrollment, now: DateTime<Utc>) -> StudioResult<()> {
        ensure_transition(enrollment.status, EnrollmentStatus::Completed)?;
        enrollment.status = EnrollmentStatus::Completed;
        enrollment.completed_at = Some(now);
        enrollment.next_email_at = None;
        Ok(())
    }

    /// Count a failed attempt. Returns `true` when the enrollment was parked.
    fn register_failure(&self, enrollment: &mut Enrollment, now: DateTime<Utc>) -> StudioResult<bool> {
        enrollment.failed_attempts += 1;

        if self.retry.exhausted(enrollment.failed_attempts) {
            ensure_transition(enrollment.status, EnrollmentStatus::NeedsAttention)?;
            enrollment.status = EnrollmentStatus::NeedsAttention;
            enrollment.next_email_at = None;
            return Ok(true);
        }

        if let Some(delay) = self.retry.delay_after(enrollment.failed_attempts) {
            let retry_at = now
                .checked_add_signed(delay)
                .ok_or_else(|| StudioError::Validation("retry backoff overflows the schedule".into()))?;
            enrollment.next_email_at = Some(retry_at);
        }
        Ok(false)
    }

    fn emit(&self, event_type: EventType, enrollment: &Enrollment, step_order: Option<u32>) {
        self.event_sink.emit(make_event(
            event_type,
            Some(enrollment.id),
            Some(enrollment.sequence_id),
            Some(enrollment.customer_id),
            step_order,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySequenceStore;
    use crate::types::TriggerType;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use studio_channels::SendOutcome;
    use studio_core::event_bus::capture_sink;
    use studio_core::Customer;

    /// Records every email and answers with a fixed outcome.
    struct StubSender {
        succeed: bool,
        sent: parking_lot::Mutex<Vec<OutboundEmail>>,
        calls: AtomicUsize,
    }

    impl StubSender {
        fn new(succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                succeed,
                sent: parking_lot::Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EmailSender for StubSender {
        async fn send_email(&self, email: &OutboundEmail) -> SendOutcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.sent.lock().push(email.clone());
            if self.succeed {
                SendOutcome::delivered(Some(format!("msg-{n}")))
            } else {
                SendOutcome::failed("mailbox unavailable")
            }
        }

        fn provider_name(&self) -> &str {
            "stub"
        }
    }

    fn step(sequence_id: Uuid, order: u32, days: u32, hours: u32) -> SequenceStep {
        SequenceStep {
            id: Uuid::new_v4(),
            sequence_id,
            step_order: order,
            delay_days: days,
            delay_hours: hours,
            subject: format!("Step {order} for {{{{customer.firstName}}}}"),
            html_content: "<p>Hi {{customer.fullName}}</p>".to_string(),
            text_content: Some("Hi {{customer.firstName}}".to_string()),
            conditions: None,
        }
    }

    struct Fixture {
        store: Arc<InMemorySequenceStore>,
        sequence: Sequence,
        customer: Customer,
    }

    fn fixture(delays: &[(u32, u32)]) -> Fixture {
        let store = Arc::new(InMemorySequenceStore::new());
        let now = Utc::now();
        let id = Uuid::new_v4();
        let sequence = Sequence {
            id,
            name: "Onboarding".to_string(),
            description: String::new(),
            trigger_type: TriggerType::Manual,
            trigger_config: serde_json::json!({}),
            is_active: true,
            steps: delays
                .iter()
                .enumerate()
                .map(|(i, (d, h))| step(id, i as u32, *d, *h))
                .collect(),
            created_at: now,
            updated_at: now,
        };
        store.insert_sequence(sequence.clone()).unwrap();
        let customer = store
            .upsert_customer(Customer::new("Eva", "Dvořáková", "eva@example.cz"))
            .unwrap();
        Fixture {
            store,
            sequence,
            customer,
        }
    }

    /// A second sequence in the same store.
    fn other_sequence(fx: &Fixture, delays: &[(u32, u32)]) -> Uuid {
        let mut sequence = fx.sequence.clone();
        sequence.id = Uuid::new_v4();
        sequence.steps = delays
            .iter()
            .enumerate()
            .map(|(i, (d, h))| step(sequence.id, i as u32, *d, *h))
            .collect();
        let id = sequence.id;
        fx.store.insert_sequence(sequence).unwrap();
        id
    }

    fn enroll(fx: &Fixture, current_step: u32, next: DateTime<Utc>) -> Uuid {
        enroll_in(fx, fx.sequence.id, current_step, next)
    }

    fn enroll_in(fx: &Fixture, sequence_id: Uuid, current_step: u32, next: DateTime<Utc>) -> Uuid {
        let enrollment = Enrollment {
            id: Uuid::new_v4(),
            sequence_id,
            customer_id: fx.customer.id,
            status: EnrollmentStatus::Active,
            current_step,
            next_email_at: Some(next),
            emails_sent: current_step,
            failed_attempts: 0,
            enrolled_at: next,
            completed_at: None,
        };
        let id = enrollment.id;
        fx.store.insert_enrollment(enrollment).unwrap();
        id
    }

    fn processor(fx: &Fixture, sender: Arc<StubSender>) -> SequenceProcessor {
        SequenceProcessor::new(fx.store.clone(), sender, TemplateRenderer::default())
    }

    #[tokio::test]
    async fn test_success_advances_to_next_step_with_delay() {
        let fx = fixture(&[(0, 0), (2, 3)]);
        let now = Utc::now();
        let id = enroll(&fx, 0, now - Duration::seconds(1));
        let sender = StubSender::new(true);

        let summary = processor(&fx, sender.clone()).process_at(now).await;

        assert_eq!(
            summary,
            ProcessSummary {
                processed: 1,
                sent: 1,
                ..Default::default()
            }
        );
        let enrollment = fx.store.get_enrollment(id).unwrap();
        assert_eq!(enrollment.current_step, 1);
        assert_eq!(enrollment.emails_sent, 1);
        assert_eq!(
            enrollment.next_email_at,
            Some(now + Duration::days(2) + Duration::hours(3))
        );

        let sent = sender.sent.lock();
        assert_eq!(sent[0].to, "eva@example.cz");
        assert_eq!(sent[0].subject, "Step 0 for Eva");
        assert_eq!(sent[0].html, "<p>Hi Eva Dvořáková</p>");
        assert_eq!(sent[0].text.as_deref(), Some("Hi Eva"));
    }

    #[tokio::test]
    async fn test_last_step_completes_enrollment() {
        let fx = fixture(&[(0, 0), (7, 0)]);
        let now = Utc::now();
        let id = enroll(&fx, 1, now - Duration::minutes(5));
        let sink = capture_sink();

        let summary = processor(&fx, StubSender::new(true))
            .with_event_sink(sink.clone())
            .process_at(now)
            .await;

        assert_eq!(summary.sent, 1);
        assert_eq!(summary.completed, 1);
        let enrollment = fx.store.get_enrollment(id).unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Completed);
        assert_eq!(enrollment.completed_at, Some(now));
        assert!(enrollment.next_email_at.is_none());
        assert_eq!(enrollment.emails_sent, 2);
        assert_eq!(sink.count_type(EventType::SequenceCompleted), 1);
        assert_eq!(sink.count_type(EventType::EmailSent), 1);
    }

    #[tokio::test]
    async fn test_cursor_past_last_step_completes_without_send() {
        let fx = fixture(&[(0, 0)]);
        let now = Utc::now();
        let id = enroll(&fx, 3, now - Duration::seconds(1));
        let sender = StubSender::new(true);

        let summary = processor(&fx, sender.clone()).process_at(now).await;

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.sent, 0);
        assert_eq!(sender.calls.load(Ordering::SeqCst), 0);
        let enrollment = fx.store.get_enrollment(id).unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Completed);
        assert!(fx.store.emails_for_enrollment(id).is_empty());
    }

    #[tokio::test]
    async fn test_failure_leaves_cursor_and_schedule_unchanged() {
        let fx = fixture(&[(0, 0), (1, 0)]);
        let now = Utc::now();
        let due_at = now - Duration::seconds(30);
        let id = enroll(&fx, 0, due_at);
        let processor =
            processor(&fx, StubSender::new(false)).with_retry_policy(RetryPolicy::unbounded());

        for tick in 1..=3 {
            let summary = processor.process_at(now + Duration::minutes(tick)).await;
            assert_eq!(summary.failed, 1);
            assert_eq!(summary.sent, 0);

            let enrollment = fx.store.get_enrollment(id).unwrap();
            assert_eq!(enrollment.current_step, 0);
            assert_eq!(enrollment.next_email_at, Some(due_at));
            assert_eq!(enrollment.status, EnrollmentStatus::Active);

            let rows = fx.store.emails_for_enrollment(id);
            assert_eq!(rows.len(), tick as usize);
            assert!(rows
                .iter()
                .all(|r| r.status == DeliveryStatus::Failed && r.sent_at.is_none()));
        }
    }

    #[tokio::test]
    async fn test_retry_budget_parks_enrollment() {
        let fx = fixture(&[(0, 0)]);
        let now = Utc::now();
        let id = enroll(&fx, 0, now - Duration::seconds(1));
        let sink = capture_sink();
        let processor = processor(&fx, StubSender::new(false))
            .with_retry_policy(RetryPolicy {
                max_attempts: 2,
                backoff: Duration::zero(),
                max_backoff: Duration::zero(),
            })
            .with_event_sink(sink.clone());

        let first = processor.process_at(now).await;
        assert_eq!(first.needs_attention, 0);

        let second = processor.process_at(now).await;
        assert_eq!(second.failed, 1);
        assert_eq!(second.needs_attention, 1);

        let enrollment = fx.store.get_enrollment(id).unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::NeedsAttention);
        assert_eq!(enrollment.failed_attempts, 2);
        assert!(enrollment.next_email_at.is_none());
        assert_eq!(sink.count_type(EventType::EnrollmentNeedsAttention), 1);

        // No longer due.
        assert_eq!(processor.process_at(now).await.processed, 0);
    }

    #[tokio::test]
    async fn test_backoff_pushes_next_attempt() {
        let fx = fixture(&[(0, 0)]);
        let now = Utc::now();
        let id = enroll(&fx, 0, now - Duration::seconds(1));
        let processor = processor(&fx, StubSender::new(false)).with_retry_policy(RetryPolicy {
            max_attempts: 0,
            backoff: Duration::minutes(10),
            max_backoff: Duration::minutes(15),
        });

        processor.process_at(now).await;
        let after_first = fx.store.get_enrollment(id).unwrap();
        assert_eq!(after_first.next_email_at, Some(now + Duration::minutes(10)));

        let later = now + Duration::minutes(10);
        processor.process_at(later).await;
        let after_second = fx.store.get_enrollment(id).unwrap();
        assert_eq!(after_second.next_email_at, Some(later + Duration::minutes(15)));
    }

    #[tokio::test]
    async fn test_error_in_one_enrollment_does_not_abort_batch() {
        let fx = fixture(&[(0, 0), (1, 0)]);
        let now = Utc::now();

        // Enrollment pointing at a sequence that no longer exists.
        let orphan = Enrollment {
            id: Uuid::new_v4(),
            sequence_id: Uuid::new_v4(),
            customer_id: fx.customer.id,
            status: EnrollmentStatus::Active,
            current_step: 0,
            next_email_at: Some(now - Duration::hours(1)),
            emails_sent: 0,
            failed_attempts: 0,
            enrolled_at: now,
            completed_at: None,
        };
        fx.store.insert_enrollment(orphan).unwrap();
        let healthy = enroll(&fx, 0, now - Duration::seconds(1));

        let summary = processor(&fx, StubSender::new(true)).process_at(now).await;

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.sent, 1);
        assert_eq!(fx.store.get_enrollment(healthy).unwrap().current_step, 1);
    }

    #[tokio::test]
    async fn test_already_delivered_step_is_not_resent() {
        let fx = fixture(&[(0, 0), (3, 0)]);
        let now = Utc::now();
        let sent_earlier = now - Duration::hours(5);
        let id = enroll(&fx, 0, sent_earlier - Duration::seconds(1));
        let enrollment = fx.store.get_enrollment(id).unwrap();

        // Simulate a crash after logging the send but before advancing.
        let row = EmailSequenceEmail {
            id: Uuid::new_v4(),
            enrollment_id: id,
            step_order: 0,
            sent_at: Some(sent_earlier),
            status: DeliveryStatus::Sent,
            resend_id: Some("msg-earlier".to_string()),
            error: None,
            created_at: sent_earlier,
        };
        fx.store.record_delivery(row, &enrollment, &enrollment).unwrap();

        let sender = StubSender::new(true);
        let summary = processor(&fx, sender.clone()).process_at(now).await;

        assert_eq!(summary.replayed, 1);
        assert_eq!(summary.sent, 0);
        assert_eq!(sender.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.store.emails_for_enrollment(id).len(), 1);
        let enrollment = fx.store.get_enrollment(id).unwrap();
        assert_eq!(enrollment.current_step, 1);
        assert_eq!(enrollment.emails_sent, 1);
        // Next delay runs from the original send, not from this run.
        assert_eq!(enrollment.next_email_at, Some(sent_earlier + Duration::days(3)));
    }

    /// Unsubscribes the recipient while the send is in flight.
    struct UnsubscribingSender {
        service: crate::service::SequenceService,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmailSender for UnsubscribingSender {
        async fn send_email(&self, email: &OutboundEmail) -> SendOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.service.unsubscribe_email(&email.to).unwrap();
            SendOutcome::delivered(Some("msg-1".to_string()))
        }

        fn provider_name(&self) -> &str {
            "unsubscribing"
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_during_send_is_not_undone() {
        let fx = fixture(&[(0, 0), (1, 0)]);
        let second_sequence = other_sequence(&fx, &[(0, 0)]);
        let now = Utc::now();
        let first = enroll(&fx, 0, now - Duration::minutes(2));
        let second = enroll_in(&fx, second_sequence, 0, now - Duration::minutes(1));

        let sender = Arc::new(UnsubscribingSender {
            service: crate::service::SequenceService::new(fx.store.clone()),
            calls: AtomicUsize::new(0),
        });
        let summary = SequenceProcessor::new(fx.store.clone(), sender.clone(), TemplateRenderer::default())
            .process_at(now)
            .await;

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.sent, 0);
        assert_eq!(summary.skipped, 2);
        // The second enrollment was unsubscribed before its turn and never sent.
        assert_eq!(sender.calls.load(Ordering::SeqCst), 1);

        let first = fx.store.get_enrollment(first).unwrap();
        assert_eq!(first.status, EnrollmentStatus::Unsubscribed);
        assert_eq!(first.current_step, 0);
        assert!(first.next_email_at.is_none());
        // The send itself is still on record.
        let rows = fx.store.emails_for_enrollment(first.id);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, DeliveryStatus::Sent);

        let second = fx.store.get_enrollment(second).unwrap();
        assert_eq!(second.status, EnrollmentStatus::Unsubscribed);
        assert!(fx.store.emails_for_enrollment(second.id).is_empty());
    }

    #[tokio::test]
    async fn test_unschedulable_delay_fails_only_its_enrollment() {
        let fx = fixture(&[(0, 0), (1, 0)]);
        // Written straight to the store, bypassing step validation.
        let broken_sequence = other_sequence(&fx, &[(0, 0), (u32::MAX, 0)]);
        let now = Utc::now();
        let broken = enroll_in(&fx, broken_sequence, 0, now - Duration::minutes(2));
        let healthy = enroll(&fx, 0, now - Duration::minutes(1));
        let sender = StubSender::new(true);

        let summary = processor(&fx, sender.clone()).process_at(now).await;

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.sent, 1);
        assert_eq!(fx.store.get_enrollment(healthy).unwrap().current_step, 1);

        // Nothing went out for the broken enrollment, so nothing is resent later.
        assert_eq!(sender.calls.load(Ordering::SeqCst), 1);
        let broken = fx.store.get_enrollment(broken).unwrap();
        assert_eq!(broken.current_step, 0);
        assert_eq!(broken.status, EnrollmentStatus::Active);
        assert!(fx.store.emails_for_enrollment(broken.id).is_empty());
    }

    #[test]
    fn test_backoff_saturates_instead_of_overflowing() {
        let policy = RetryPolicy::from_config(&SequencesConfig {
            retry_backoff_secs: u64::MAX,
            max_backoff_secs: u64::MAX,
            ..SequencesConfig::default()
        });
        let delay = policy.delay_after(u32::MAX).unwrap();
        assert_eq!(delay, Duration::seconds(MAX_RETRY_BACKOFF_SECS as i64));
    }

    #[tokio::test]
    async fn test_try_process_skips_when_run_in_flight() {
        let fx = fixture(&[(0, 0)]);
        let processor = processor(&fx, StubSender::new(true));

        let guard = processor.run_lock.lock().await;
        assert!(processor.try_process().await.is_none());
        drop(guard);
        assert!(processor.try_process().await.is_some());
    }
}
