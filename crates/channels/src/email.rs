//! Email dispatch with Resend and log-only providers.
//!
//! The sequence processor only sees [`EmailSender`]; a send never returns an
//! `Err`, failures come back as a [`SendOutcome`] with `success == false`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use studio_core::config::EmailConfig;
use studio_core::{StudioError, StudioResult};
use tracing::{debug, info, warn};

/// A fully rendered email ready to hand to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
}

/// Result of a dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn delivered(message_id: Option<String>) -> Self {
        Self {
            success: true,
            message_id,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(error.into()),
        }
    }
}

/// Transport-agnostic email dispatch.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, email: &OutboundEmail) -> SendOutcome;

    /// Provider name for metrics/logging.
    fn provider_name(&self) -> &str;
}

/// Build the sender selected by `email.provider`.
pub fn build_sender(config: &EmailConfig) -> StudioResult<Arc<dyn EmailSender>> {
    match config.provider.as_str() {
        "resend" => Ok(Arc::new(ResendProvider::new(config.clone())?)),
        "log" => Ok(Arc::new(LogOnlyProvider::new(config.from_email.clone()))),
        other => Err(StudioError::Config(format!(
            "unknown email provider '{other}' (expected 'resend' or 'log')"
        ))),
    }
}

// ─── Resend ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ResendPayload<'a> {
    from: String,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ResendResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ResendError {
    #[serde(default)]
    message: String,
}

/// Sends email through the Resend HTTP API.
pub struct ResendProvider {
    config: EmailConfig,
    client: reqwest::Client,
}

impl ResendProvider {
    pub fn new(config: EmailConfig) -> StudioResult<Self> {
        if config.api_key.is_empty() {
            return Err(StudioError::Config(
                "email.api_key is required for the resend provider".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| StudioError::Config(format!("failed to build HTTP client: {e}")))?;

        info!(
            from = %config.from_email,
            base_url = %config.api_base_url,
            "Resend provider initialized"
        );

        Ok(Self { config, client })
    }

    fn from_header(&self) -> String {
        if self.config.from_name.is_empty() {
            self.config.from_email.clone()
        } else {
            format!("{} <{}>", self.config.from_name, self.config.from_email)
        }
    }

    async fn post(&self, email: &OutboundEmail) -> Result<String, String> {
        let payload = ResendPayload {
            from: self.from_header(),
            to: [email.to.as_str()],
            subject: &email.subject,
            html: &email.html,
            text: email.text.as_deref(),
        };
        let url = format!("{}/emails", self.config.api_base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = response.status();
        if status.is_success() {
            let body: ResendResponse = response
                .json()
                .await
                .map_err(|e| format!("invalid response body: {e}"))?;
            Ok(body.id)
        } else {
            let message = response
                .json::<ResendError>()
                .await
                .map(|e| e.message)
                .unwrap_or_default();
            Err(format!("HTTP {status}: {message}"))
        }
    }
}

#[async_trait]
impl EmailSender for ResendProvider {
    async fn send_email(&self, email: &OutboundEmail) -> SendOutcome {
        debug!(to = %email.to, subject = %email.subject, "Sending email via Resend");

        match self.post(email).await {
            Ok(id) => {
                metrics::counter!("email.sent", "provider" => "resend").increment(1);
                SendOutcome::delivered(Some(id))
            }
            Err(error) => {
                warn!(to = %email.to, error = %error, "Resend dispatch failed");
                metrics::counter!("email.failed", "provider" => "resend").increment(1);
                SendOutcome::failed(error)
            }
        }
    }

    fn provider_name(&self) -> &str {
        "resend"
    }
}

// ─── Log only ───────────────────────────────────────────────────────────────

/// Development provider: logs the message and reports success.
pub struct LogOnlyProvider {
    from_email: String,
}

impl LogOnlyProvider {
    pub fn new(from_email: String) -> Self {
        info!(from = %from_email, "Log-only email provider initialized");
        Self { from_email }
    }
}

#[async_trait]
impl EmailSender for LogOnlyProvider {
    async fn send_email(&self, email: &OutboundEmail) -> SendOutcome {
        let message_id = format!("log-{}", uuid::Uuid::new_v4());
        info!(
            from = %self.from_email,
            to = %email.to,
            subject = %email.subject,
            message_id = %message_id,
            "Email logged (not delivered)"
        );
        metrics::counter!("email.sent", "provider" => "log").increment(1);
        SendOutcome::delivered(Some(message_id))
    }

    fn provider_name(&self) -> &str {
        "log"
    }
}
