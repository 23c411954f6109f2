//! Persistence, one module per table.
//!
//! All queries are runtime-checked `sqlx::query` with explicit binds, and
//! every state-changing update carries a `WHERE status IN (...)` guard so a
//! concurrent writer observes zero rows affected instead of clobbering.

pub mod devices;
pub mod events;
pub mod orders;
pub mod outbound;
pub mod ports;
