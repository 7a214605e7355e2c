//! Reservation availability store: businesses, their opening rules, and
//! reservations that can never double-book a slot.

pub mod config;
pub mod engine;
pub mod housekeeping;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod wal;
