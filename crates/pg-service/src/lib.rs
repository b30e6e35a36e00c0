//! # pg-service
//!
//! A thin execution layer over a pooled PostgreSQL client.
//!
//! ## Features
//!
//! - **Three operations**: [`PgService::query`], [`PgService::queries`] (concurrent, one
//!   connection) and [`PgService::transaction`] (`BEGIN` / `COMMIT` / `ROLLBACK`)
//! - **Structured errors**: every failure has a `kind()` (`E_PG_QUERIES`, `E_PG_TRANSACTION`, ...)
//!   and `params()` carrying the statement text, values and server diagnostics
//! - **Guaranteed release**: the connection goes back to the pool on every exit path
//! - **Failure channel**: [`PoolFailures`] resolves when a pooled connection dies in the
//!   background
//! - **Explicit setup**: configuration, environment and decoder policy are passed to
//!   [`PgProvider::init`]
//!
//! ```ignore
//! use pg_service::{PgProvider, PgServiceDeps, sql};
//!
//! let PgProvider { service, failures } = PgProvider::init(PgServiceDeps::default())?;
//! tokio::spawn(async move {
//!     let err = failures.wait().await;
//!     tracing::error!(error = %err, "lost a database connection");
//! });
//!
//! let users = service
//!     .query(sql!("SELECT id, name FROM users WHERE type=" {"admin"}))
//!     .await?;
//! for row in &users.rows {
//!     println!("{row:?}");
//! }
//! service.dispose().await;
//! ```

pub mod config;
pub mod connection;
pub mod decode;
pub mod error;
pub mod failure;
pub mod pool;
pub mod service;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use config::{DEFAULT_PG_URL_ENV_NAME, EnvSource, PgConfig, ProcessEnv, Recycling};
pub use connection::{Connection, ConnectionPool};
pub use decode::{DateDecoding, Decoders, Field, QueryResult, TimestampDecoding};
pub use error::{BatchFailure, DbDiagnostics, DriverError, PgError, PgResult};
pub use failure::PoolFailures;
pub use pool::{PgConnection, PgManager, PgPool};
pub use service::{PgProvider, PgService, PgServiceDeps};

// Re-export the statement builder so callers need a single dependency.
pub use pg_sql::{
    Part, Query, SqlValue, Statement, empty_part, escape_identifier, join_parts, join_values,
    sql, sql_part,
};
