//! pickup-store: Local record store for the pickup kiosk.
//!
//! Guardians, children, guardian→child links and the pickup audit log live in
//! one SQLite database. Every mutation that touches more than one table runs
//! in a single transaction, so deleting a guardian or child and rewriting the
//! links that reference it is all-or-nothing.

pub mod error;
pub mod links;
pub mod record;
pub mod snapshot;
pub mod store;

pub use error::StoreError;
pub use links::DanglingReference;
pub use record::Record;
pub use snapshot::{ImportSummary, Snapshot, SNAPSHOT_VERSION};
pub use store::{LinkMode, RecordStore, SCHEMA_VERSION};
