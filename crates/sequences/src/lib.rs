//! Email-sequence drip campaigns: ordered email steps with day/hour delays,
//! per-customer enrollments, a polling processor that dispatches due emails,
//! and read-only delivery statistics.

pub mod processor;
pub mod scheduler;
pub mod service;
pub mod state_machine;
pub mod stats;
pub mod store;
pub mod template;
pub mod types;

pub use processor::{ProcessSummary, RetryPolicy, SequenceProcessor};
pub use scheduler::SequenceScheduler;
pub use service::SequenceService;
pub use stats::{get_sequence_stats, SequenceStats};
pub use store::{InMemorySequenceStore, SequenceStore};
pub use template::{process_template, TemplateContext, TemplateRenderer};
