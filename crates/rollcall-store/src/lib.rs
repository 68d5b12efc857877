//! rollcall-store — SQLite persistence for students and attendance.
//!
//! A synchronous [`Store`] over rusqlite carries the row-level logic
//! (and the tests, against in-memory databases); [`AsyncStore`] wraps
//! the same operations in tokio-rusqlite's connection actor for use
//! from async context.

pub mod export;
pub mod store;
pub mod types;

pub use export::to_csv;
pub use store::{AsyncStore, Store, StoreError};
pub use types::{AttendanceEntry, AttendanceRecord, AttendanceStats, AttendanceStatus, Student};
