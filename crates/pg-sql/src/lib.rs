//! # pg-sql
//!
//! Injection-safe SQL statements for Postgres, assembled from literal text and
//! interpolated parameters.
//!
//! ## Features
//!
//! - **Values are always bound**: every interpolated scalar becomes a `$n` placeholder
//! - **Composable**: statements and parts splice into each other, placeholders are renumbered
//! - **Trusted text only**: literal chunks must be `'static`, dynamic names go through
//!   [`escape_identifier`]
//! - **Lists**: [`join_values`] expands to `$n, $n+1, ...` for `IN (...)` clauses
//!
//! ```ignore
//! use pg_sql::{escape_identifier, join_values, sql, sql_part};
//!
//! let limit = sql_part!("LIMIT " {10});
//! let q = sql!(
//!     "SELECT * FROM " {escape_identifier("users")}
//!     " WHERE id IN (" {join_values([1, 2, 3])} ") AND type=" {"admin"} " " {limit}
//! );
//! assert_eq!(
//!     q.text(),
//!     "SELECT * FROM \"users\" WHERE id IN ($1, $2, $3) AND type=$4 LIMIT $5"
//! );
//! ```

mod fragment;
mod statement;
mod template;
mod value;

pub use fragment::{Fragment, IntoFragment, ValueList, join_values};
pub use statement::{
    Part, Query, Statement, build_part, build_statement, empty_part, escape_identifier,
    join_parts,
};
pub use template::Template;
pub use value::SqlValue;
