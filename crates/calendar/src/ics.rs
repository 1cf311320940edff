//! iCalendar text rendering.
//!
//! Output uses CRLF line endings and folds content lines longer than 75
//! octets. All timestamps are written in UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MAX_LINE_OCTETS: usize = 75;
const CRLF: &str = "\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    #[default]
    Confirmed,
    Tentative,
    Cancelled,
}

impl EventStatus {
    pub fn as_ics(self) -> &'static str {
        match self {
            Self::Confirmed => "CONFIRMED",
            Self::Tentative => "TENTATIVE",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// A booked session or appointment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: Uuid,
    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IcsFeed {
    name: String,
    product_id: String,
    events: Vec<CalendarEvent>,
}

impl IcsFeed {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            product_id: "-//Studio Suite//Calendar Feed//CS".to_string(),
            events: Vec::new(),
        }
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = CalendarEvent>) -> Self {
        self.events.extend(events);
        self
    }

    pub fn push(&mut self, event: CalendarEvent) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Render the full `VCALENDAR` document stamped at `now`.
    pub fn render_at(&self, now: DateTime<Utc>) -> String {
        let mut out = String::new();
        let mut line = |content: String| {
            out.push_str(&fold_line(&content));
            out.push_str(CRLF);
        };

        line("BEGIN:VCALENDAR".to_string());
        line("VERSION:2.0".to_string());
        line(format!("PRODID:{}", self.product_id));
        line("CALSCALE:GREGORIAN".to_string());
        line("METHOD:PUBLISH".to_string());
        line(format!("X-WR-CALNAME:{}", escape_text(&self.name)));

        for event in &self.events {
            line("BEGIN:VEVENT".to_string());
            line(format!("UID:{}", event.id));
            line(format!("DTSTAMP:{}", format_utc(now)));
            line(format!("DTSTART:{}", format_utc(event.starts_at)));
            line(format!("DTEND:{}", format_utc(event.ends_at)));
            line(format!("SUMMARY:{}", escape_text(&event.summary)));
            if let Some(description) = &event.description {
                line(format!("DESCRIPTION:{}", escape_text(description)));
            }
            if let Some(location) = &event.location {
                line(format!("LOCATION:{}", escape_text(location)));
            }
            line(format!("STATUS:{}", event.status.as_ics()));
            line(format!("LAST-MODIFIED:{}", format_utc(event.updated_at)));
            line("END:VEVENT".to_string());
        }

        line("END:VCALENDAR".to_string());
        out
    }

    pub fn render(&self) -> String {
        self.render_at(Utc::now())
    }
}

pub fn format_utc(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Escape a TEXT property value.
pub fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            ',' => out.push_str("\\,"),
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str("\\n");
            }
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

/// Fold a content line at 75 octets without splitting a UTF-8 sequence.
/// Continuation lines begin with a single space.
pub fn fold_line(line: &str) -> String {
    if line.len() <= MAX_LINE_OCTETS {
        return line.to_string();
    }

    let mut out = String::with_capacity(line.len() + line.len() / MAX_LINE_OCTETS * 3);
    let mut width = 0;
    for ch in line.chars() {
        let len = ch.len_utf8();
        if width + len > MAX_LINE_OCTETS {
            out.push_str(CRLF);
            out.push(' ');
            width = 1;
        }
        out.push(ch);
        width += len;
    }
    out
}
