//! `SQLite` backend.
//!
//! - **[`connection`]**: `r2d2` pool with WAL mode, foreign keys, and busy
//!   timeout applied to every connection.
//! - **[`migrations`]**: Version-tracked schema, embedded at compile time.
//! - **[`repositories`]**: Stateless repositories, one per table.

pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{
    ConnectionConfig, ConnectionPool, PooledConnection, PragmaState, new_file, new_in_memory,
    verify_pragmas,
};
pub use migrations::{current_version, latest_version, run_migrations};
