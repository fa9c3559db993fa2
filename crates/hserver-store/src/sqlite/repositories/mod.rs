//! Repository implementations for `SQLite` database operations.
//!
//! Each repository is a stateless struct whose methods take a `&Connection`
//! parameter, so the same call works on a pooled connection or inside an
//! open transaction. Status and revision writes are conditional and report
//! whether a row changed; the components decide what a `false` means.

pub mod artifact;
pub mod case;
pub mod ledger;
pub mod reclamation;
pub mod study;
pub mod upload_job;
