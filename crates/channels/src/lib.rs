//! Outbound messaging channels.
//!
//! Email is the only channel the drip-campaign engine dispatches through:
//! the Resend HTTP API in production, a log-only provider for development.

pub mod email;

pub use email::{build_sender, EmailSender, LogOnlyProvider, OutboundEmail, ResendProvider, SendOutcome};
