//! The seam between the service and whatever actually talks to Postgres.

use crate::decode::{Decoders, QueryResult};
use crate::error::{DriverError, PgResult};
use crate::failure::PoolFailures;
use pg_sql::Query;
use std::future::Future;

/// A connection checked out of a pool. Dropping it gives it back.
pub trait Connection: Send + Sync {
    /// Run one statement.
    ///
    /// Several calls may be in flight on the same connection at once; the
    /// driver pipelines them.
    fn execute(
        &self,
        query: &Query,
        decoders: &Decoders,
    ) -> impl Future<Output = Result<QueryResult, DriverError>> + Send;

    /// Run parameterless SQL such as `BEGIN` or `ROLLBACK`.
    fn batch_execute(&self, sql: &str) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Remove the connection from the pool instead of returning it, for
    /// connections left in an unknown state.
    fn detach(self)
    where
        Self: Sized,
    {
        drop(self);
    }
}

/// A source of [`Connection`]s.
pub trait ConnectionPool: Send + Sync + 'static {
    type Connection: Connection;

    /// Wait for a connection.
    fn acquire(&self) -> impl Future<Output = PgResult<Self::Connection>> + Send;

    /// Stop handing out connections and drop the idle ones.
    fn close(&self);

    /// Background failures of the pool's connections.
    fn failures(&self) -> PoolFailures;
}
