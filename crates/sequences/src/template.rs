//! Placeholder substitution for sequence email templates.
//!
//! A fixed set of `{{token}}` placeholders is replaced everywhere it occurs;
//! anything else between braces is left as written.

use chrono::{DateTime, Datelike, Utc};
use studio_core::config::PublicAppConfig;
use studio_core::Customer;

use crate::types::Sequence;

/// Values available to a template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub customer: &'a Customer,
    pub sequence: &'a Sequence,
    /// Source of `{{date}}` and `{{year}}`.
    pub now: DateTime<Utc>,
}

impl<'a> TemplateContext<'a> {
    pub fn new(customer: &'a Customer, sequence: &'a Sequence) -> Self {
        Self {
            customer,
            sequence,
            now: Utc::now(),
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

/// Renders templates with the unsubscribe link pointing at the configured app.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    base_url: String,
    unsubscribe_path: String,
}

impl TemplateRenderer {
    pub fn new(base_url: impl Into<String>, unsubscribe_path: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            unsubscribe_path: unsubscribe_path.into(),
        }
    }

    pub fn from_config(config: &PublicAppConfig) -> Self {
        Self::new(config.base_url.clone(), config.unsubscribe_path.clone())
    }

    pub fn render(&self, template: &str, ctx: &TemplateContext<'_>) -> String {
        process_template(template, ctx, &self.unsubscribe_url(&ctx.customer.email))
    }

    pub fn unsubscribe_url(&self, email: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(email.as_bytes()).collect();
        format!(
            "{}{}?email={}",
            self.base_url.trim_end_matches('/'),
            self.unsubscribe_path,
            encoded
        )
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::from_config(&PublicAppConfig::default())
    }
}

/// Replace every known placeholder in `template`.
pub fn process_template(template: &str, ctx: &TemplateContext<'_>, unsubscribe_url: &str) -> String {
    let customer = ctx.customer;
    let date = ctx.now.format("%d.%m.%Y").to_string();
    let year = ctx.now.year().to_string();
    let full_name = customer.full_name();

    let replacements: [(&str, &str); 10] = [
        ("{{customer.firstName}}", &customer.first_name),
        ("{{customer.lastName}}", &customer.last_name),
        ("{{customer.fullName}}", &full_name),
        ("{{customer.email}}", &customer.email),
        (
            "{{customer.organization}}",
            customer.organization.as_deref().unwrap_or_default(),
        ),
        ("{{customer.phone}}", customer.phone.as_deref().unwrap_or_default()),
        ("{{sequence.name}}", &ctx.sequence.name),
        ("{{date}}", &date),
        ("{{year}}", &year),
        ("{{unsubscribeUrl}}", unsubscribe_url),
    ];

    let mut result = template.to_string();
    for (token, value) in replacements {
        if result.contains(token) {
            result = result.replace(token, value);
        }
    }
    result
}
