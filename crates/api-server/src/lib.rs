#![warn(clippy::unwrap_used)]

pub mod calendar_rest;
pub mod rest;
pub mod sequence_rest;
pub mod server;
pub mod tax_rest;

pub use rest::AppState;
pub use server::{router, ApiServer};
