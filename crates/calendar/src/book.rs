use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use studio_core::{StudioError, StudioResult};
use tracing::info;
use uuid::Uuid;

use crate::ics::{CalendarEvent, EventStatus, IcsFeed};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCalendarEvent {
    pub summary: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default)]
    pub status: EventStatus,
}

/// In-memory booking calendar.
pub struct CalendarBook {
    events: DashMap<Uuid, CalendarEvent>,
}

impl CalendarBook {
    pub fn new() -> Self {
        Self {
            events: DashMap::new(),
        }
    }

    pub fn add(&self, new: NewCalendarEvent) -> StudioResult<CalendarEvent> {
        if new.summary.trim().is_empty() {
            return Err(StudioError::Validation("event summary is required".into()));
        }
        if new.ends_at <= new.starts_at {
            return Err(StudioError::Validation(
                "event must end after it starts".into(),
            ));
        }

        let now = Utc::now();
        let event = CalendarEvent {
            id: Uuid::new_v4(),
            summary: new.summary,
            description: new.description,
            location: new.location,
            starts_at: new.starts_at,
            ends_at: new.ends_at,
            status: new.status,
            created_at: now,
            updated_at: now,
        };
        info!(event_id = %event.id, starts_at = %event.starts_at, "Calendar event added");
        self.events.insert(event.id, event.clone());
        Ok(event)
    }

    pub fn get(&self, id: Uuid) -> StudioResult<CalendarEvent> {
        self.events
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StudioError::not_found("Calendar event", id))
    }

    /// Cancelled events stay in the feed so subscribers drop them.
    pub fn cancel(&self, id: Uuid) -> StudioResult<CalendarEvent> {
        let mut entry = self
            .events
            .get_mut(&id)
            .ok_or_else(|| StudioError::not_found("Calendar event", id))?;
        entry.status = EventStatus::Cancelled;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    /// All events ordered by start time.
    pub fn list(&self) -> Vec<CalendarEvent> {
        let mut events: Vec<_> = self.events.iter().map(|e| e.value().clone()).collect();
        events.sort_by_key(|e| (e.starts_at, e.id));
        events
    }

    pub fn feed(&self, name: &str) -> IcsFeed {
        IcsFeed::new(name).with_events(self.list())
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Default for CalendarBook {
    fn default() -> Self {
        Self::new()
    }
}
