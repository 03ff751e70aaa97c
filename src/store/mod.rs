//! Persistence layer: libSQL-backed storage for flows, rules, the trigger log
//! and conversation states.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
