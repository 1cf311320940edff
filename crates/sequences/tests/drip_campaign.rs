//! End-to-end drip campaign flows through the public API.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use studio_channels::{EmailSender, OutboundEmail, SendOutcome};
use studio_core::event_bus::capture_sink;
use studio_core::types::EventType;
use studio_core::Customer;
use studio_sequences::types::{
    DeliveryStatus, Enrollment, EnrollmentStatus, NewSequence, NewStep, TriggerType,
};
use studio_sequences::{
    InMemorySequenceStore, ProcessSummary, SequenceProcessor, SequenceService, SequenceStore,
    TemplateRenderer,
};
use uuid::Uuid;

#[derive(Default)]
struct Outbox {
    messages: Mutex<Vec<OutboundEmail>>,
}

#[async_trait]
impl EmailSender for Outbox {
    async fn send_email(&self, email: &OutboundEmail) -> SendOutcome {
        let mut messages = self.messages.lock();
        messages.push(email.clone());
        SendOutcome::delivered(Some(format!("re_{}", messages.len())))
    }

    fn provider_name(&self) -> &str {
        "outbox"
    }
}

fn step(days: u32, subject: &str) -> NewStep {
    NewStep {
        delay_days: days,
        delay_hours: 0,
        subject: subject.to_string(),
        html_content: "<p>Ahoj {{customer.firstName}}, <a href=\"{{unsubscribeUrl}}\">odhlásit</a></p>"
            .to_string(),
        text_content: None,
        conditions: None,
    }
}

fn two_step_sequence() -> NewSequence {
    NewSequence {
        name: "Photo shoot follow-up".to_string(),
        description: "Sent after a session is delivered".to_string(),
        trigger_type: TriggerType::SessionCompleted,
        trigger_config: serde_json::json!({}),
        is_active: true,
        steps: vec![step(0, "Děkujeme, {{customer.firstName}}"), step(7, "Jak se vám líbí fotky?")],
    }
}

#[tokio::test]
async fn due_enrollment_sends_first_step_and_schedules_second() {
    let store = Arc::new(InMemorySequenceStore::new());
    let service = SequenceService::new(store.clone());
    let sequence = service.create_sequence(two_step_sequence()).unwrap();
    let customer = service
        .upsert_customer(Customer::new("Tereza", "Králová", "tereza@example.cz"))
        .unwrap();

    let send_time = Utc::now();
    let enrollment = Enrollment {
        id: Uuid::new_v4(),
        sequence_id: sequence.id,
        customer_id: customer.id,
        status: EnrollmentStatus::Active,
        current_step: 0,
        next_email_at: Some(send_time - Duration::seconds(1)),
        emails_sent: 0,
        failed_attempts: 0,
        enrolled_at: send_time - Duration::seconds(1),
        completed_at: None,
    };
    store.insert_enrollment(enrollment.clone()).unwrap();

    let outbox = Arc::new(Outbox::default());
    let processor = SequenceProcessor::new(
        store.clone(),
        outbox.clone(),
        TemplateRenderer::new("https://foto.example.cz", "/unsubscribe"),
    );

    let summary = processor.process_at(send_time).await;

    assert_eq!(
        summary,
        ProcessSummary {
            processed: 1,
            sent: 1,
            failed: 0,
            completed: 0,
            needs_attention: 0,
            skipped: 0,
            replayed: 0,
        }
    );

    let rows = store.emails_for_enrollment(enrollment.id);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].step_order, 0);
    assert_eq!(rows[0].status, DeliveryStatus::Sent);
    assert_eq!(rows[0].sent_at, Some(send_time));
    assert_eq!(rows[0].resend_id.as_deref(), Some("re_1"));

    let updated = store.get_enrollment(enrollment.id).unwrap();
    assert_eq!(updated.current_step, 1);
    assert_eq!(updated.next_email_at, Some(send_time + Duration::days(7)));
    assert_eq!(updated.emails_sent, 1);

    let messages = outbox.messages.lock();
    assert_eq!(messages[0].subject, "Děkujeme, Tereza");
    assert!(messages[0]
        .html
        .contains("https://foto.example.cz/unsubscribe?email=tereza%40example.cz"));
}

#[tokio::test]
async fn sequence_runs_to_completion_and_reports_stats() {
    let store = Arc::new(InMemorySequenceStore::new());
    let sink = capture_sink();
    let service = SequenceService::new(store.clone()).with_event_sink(sink.clone());
    let sequence = service.create_sequence(two_step_sequence()).unwrap();
    let customer = service
        .upsert_customer(Customer::new("Tereza", "Králová", "tereza@example.cz"))
        .unwrap();
    let enrollment = service.enroll(sequence.id, customer.id).unwrap();

    let processor = SequenceProcessor::new(store.clone(), Arc::new(Outbox::default()), TemplateRenderer::default())
        .with_event_sink(sink.clone());

    let start = enrollment.next_email_at.unwrap();
    let first = processor.process_at(start).await;
    assert_eq!(first.sent, 1);

    // Nothing due before the seven-day delay elapses.
    let early = processor.process_at(start + Duration::days(6)).await;
    assert_eq!(early.processed, 0);

    let second = processor.process_at(start + Duration::days(7)).await;
    assert_eq!(second.sent, 1);
    assert_eq!(second.completed, 1);

    let done = service.get_enrollment(enrollment.id).unwrap();
    assert_eq!(done.status, EnrollmentStatus::Completed);
    assert_eq!(done.emails_sent, 2);
    assert!(done.next_email_at.is_none());

    let stats = service.stats(sequence.id).unwrap();
    assert_eq!(stats.total_enrollments, 1);
    assert_eq!(stats.completed_enrollments, 1);
    assert_eq!(stats.total_emails_sent, 2);
    assert_eq!(stats.open_rate, 0.0);

    assert_eq!(sink.count_type(EventType::Enrolled), 1);
    assert_eq!(sink.count_type(EventType::EmailSent), 2);
    assert_eq!(sink.count_type(EventType::SequenceCompleted), 1);

    // A finished customer can be enrolled again.
    assert!(service.enroll(sequence.id, customer.id).is_ok());
}

#[tokio::test]
async fn unsubscribed_enrollment_is_never_processed() {
    let store = Arc::new(InMemorySequenceStore::new());
    let service = SequenceService::new(store.clone());
    let sequence = service.create_sequence(two_step_sequence()).unwrap();
    let customer = service
        .upsert_customer(Customer::new("Tereza", "Králová", "tereza@example.cz"))
        .unwrap();
    let enrollment = service.enroll(sequence.id, customer.id).unwrap();
    service.unsubscribe_email("tereza@example.cz").unwrap();

    let outbox = Arc::new(Outbox::default());
    let processor = SequenceProcessor::new(store.clone(), outbox.clone(), TemplateRenderer::default());
    let summary = processor.process_at(Utc::now() + Duration::days(30)).await;

    assert_eq!(summary.processed, 0);
    assert!(outbox.messages.lock().is_empty());
    assert!(store.emails_for_enrollment(enrollment.id).is_empty());
}
