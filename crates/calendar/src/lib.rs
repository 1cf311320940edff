//! Booking calendar and its iCalendar (RFC 5545) subscription feed.

pub mod book;
pub mod ics;

pub use book::{CalendarBook, NewCalendarEvent};
pub use ics::{CalendarEvent, EventStatus, IcsFeed};
