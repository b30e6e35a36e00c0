//! Query execution on pooled connections.
//!
//! Every call checks out one connection, runs its statements on it and gives
//! it back, on every exit path:
//!
//! ```ignore
//! let PgProvider { service, failures } = PgProvider::init(PgServiceDeps::default())?;
//!
//! let user = service.query(sql!("SELECT * FROM users WHERE id=" {id})).await?;
//! let [a, b] = <[_; 2]>::try_from(service.queries([q1, q2]).await?).unwrap();
//! service
//!     .transaction([
//!         sql!("UPDATE accounts SET balance = balance - " {amount} " WHERE id=" {from}),
//!         sql!("UPDATE accounts SET balance = balance + " {amount} " WHERE id=" {to}),
//!     ])
//!     .await?;
//!
//! service.dispose().await;
//! ```

use crate::config::{DEFAULT_PG_URL_ENV_NAME, EnvSource, PgConfig, ProcessEnv};
use crate::connection::{Connection, ConnectionPool};
use crate::decode::{Decoders, QueryResult};
use crate::error::{BatchFailure, DriverError, PgError, PgResult};
use crate::failure::PoolFailures;
use crate::pool::PgPool;
use futures_util::future::join_all;
use pg_sql::Query;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tokio_postgres::{NoTls, Socket};

#[cfg(test)]
mod tests;

/// Runs statements on connections from a [`ConnectionPool`].
///
/// Cloning is cheap; clones share the pool.
pub struct PgService<P: ConnectionPool> {
    inner: Arc<Inner<P>>,
}

struct Inner<P> {
    pool: P,
    decoders: Decoders,
    /// Held shared by every call, exclusively by `dispose`.
    gate: RwLock<()>,
    closed: AtomicBool,
}

impl<P: ConnectionPool> Clone for PgService<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: ConnectionPool> fmt::Debug for PgService<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgService")
            .field("decoders", &self.inner.decoders)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<P: ConnectionPool> PgService<P> {
    pub fn new(pool: P, decoders: Decoders) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                decoders,
                gate: RwLock::new(()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Background failures of the pool's connections.
    pub fn failures(&self) -> PoolFailures {
        self.inner.pool.failures()
    }

    /// Run one statement, as a batch of one.
    ///
    /// Fails like [`queries`](Self::queries) does (`E_PG_QUERIES`, index 0).
    pub async fn query(&self, query: impl Into<Query>) -> PgResult<QueryResult> {
        let mut results = self.queries(std::iter::once(query.into())).await?;
        results
            .pop()
            .ok_or_else(|| PgError::Pool("no result for a single query".into()))
    }

    /// Run statements concurrently on one connection.
    ///
    /// Results come back in input order. Every statement runs to completion; if
    /// several fail, the lowest index is reported (`E_PG_QUERIES`).
    pub async fn queries<I>(&self, queries: I) -> PgResult<Vec<QueryResult>>
    where
        I: IntoIterator,
        I::Item: Into<Query>,
    {
        let queries: Vec<Query> = queries.into_iter().map(Into::into).collect();
        let _entered = self.enter().await?;
        tracing::debug!(target: "pg_service", count = queries.len(), "running queries");

        let lease = Lease::new(self.inner.pool.acquire().await?);
        let outcome = execute_all(&*lease, &queries, &self.inner.decoders).await;
        drop(lease);

        outcome.map_err(|(index, error)| {
            tracing::debug!(target: "pg_service", index, error = %error, "queries failed");
            PgError::queries(batch_failure(queries, Some(index), error, None))
        })
    }

    /// Run statements concurrently inside `BEGIN` / `COMMIT`.
    ///
    /// If any statement fails the transaction is rolled back and the failure is
    /// reported as `E_PG_TRANSACTION`. A failed rollback is attached to that
    /// error and the connection is discarded instead of reused.
    pub async fn transaction<I>(&self, queries: I) -> PgResult<Vec<QueryResult>>
    where
        I: IntoIterator,
        I::Item: Into<Query>,
    {
        let queries: Vec<Query> = queries.into_iter().map(Into::into).collect();
        let _entered = self.enter().await?;
        tracing::debug!(target: "pg_service", count = queries.len(), "running transaction");

        let mut lease = Lease::new(self.inner.pool.acquire().await?);
        lease.in_transaction = true;

        if let Err(error) = lease.batch_execute("BEGIN").await {
            return Err(PgError::transaction(batch_failure(
                queries, None, error, None,
            )));
        }

        match execute_all(&*lease, &queries, &self.inner.decoders).await {
            Ok(results) => match lease.batch_execute("COMMIT").await {
                Ok(()) => {
                    lease.in_transaction = false;
                    Ok(results)
                }
                Err(error) => Err(PgError::transaction(batch_failure(
                    queries, None, error, None,
                ))),
            },
            Err((index, error)) => {
                let rollback_error = match lease.batch_execute("ROLLBACK").await {
                    Ok(()) => {
                        lease.in_transaction = false;
                        None
                    }
                    Err(rollback) => {
                        tracing::warn!(
                            target: "pg_service",
                            error = %rollback,
                            "rollback failed, discarding connection"
                        );
                        Some(rollback)
                    }
                };
                Err(PgError::transaction(batch_failure(
                    queries,
                    Some(index),
                    error,
                    rollback_error,
                )))
            }
        }
    }

    /// Refuse new calls, wait for the running ones, then close the pool.
    ///
    /// Calling it again is harmless.
    pub async fn dispose(&self) {
        let first = !self.inner.closed.swap(true, Ordering::SeqCst);
        if first {
            tracing::debug!(target: "pg_service", "draining");
        }
        let _drained = self.inner.gate.write().await;
        self.inner.pool.close();
        if first {
            tracing::debug!(target: "pg_service", "pool closed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> PgResult<RwLockReadGuard<'_, ()>> {
        if self.is_disposed() {
            return Err(PgError::Closed);
        }
        let entered = self.inner.gate.read().await;
        // `dispose` may have started while we waited.
        if self.is_disposed() {
            return Err(PgError::Closed);
        }
        Ok(entered)
    }
}

async fn execute_all<C: Connection>(
    conn: &C,
    queries: &[Query],
    decoders: &Decoders,
) -> Result<Vec<QueryResult>, (usize, DriverError)> {
    join_all(queries.iter().map(|query| conn.execute(query, decoders)))
        .await
        .into_iter()
        .enumerate()
        .map(|(index, outcome)| outcome.map_err(|error| (index, error)))
        .collect()
}

fn batch_failure(
    queries: Vec<Query>,
    index: Option<usize>,
    error: DriverError,
    rollback_error: Option<DriverError>,
) -> BatchFailure {
    let (texts, values) = queries.into_iter().map(|q| (q.text, q.values)).unzip();
    BatchFailure {
        texts,
        values,
        index,
        error,
        rollback_error,
    }
}

/// A checked-out connection, given back when dropped.
///
/// A connection dropped while still inside a transaction (rollback failed, or
/// the call was cancelled mid-way) is detached from the pool instead.
struct Lease<C: Connection> {
    conn: ManuallyDrop<C>,
    in_transaction: bool,
}

impl<C: Connection> Lease<C> {
    fn new(conn: C) -> Self {
        Self {
            conn: ManuallyDrop::new(conn),
            in_transaction: false,
        }
    }
}

impl<C: Connection> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C: Connection> Drop for Lease<C> {
    fn drop(&mut self) {
        // SAFETY: `conn` is taken exactly once, here, and never touched again.
        let conn = unsafe { ManuallyDrop::take(&mut self.conn) };
        if self.in_transaction {
            tracing::debug!(target: "pg_service", "detaching connection left in a transaction");
            conn.detach();
        }
    }
}

/// Everything [`PgProvider::init`] needs, passed explicitly.
#[derive(Debug, Clone)]
pub struct PgServiceDeps<E = ProcessEnv> {
    pub pg: PgConfig,
    /// Where the connection URL is looked up.
    pub env: E,
    /// Variable holding the connection URL.
    pub url_env_name: String,
    pub decoders: Decoders,
}

impl Default for PgServiceDeps<ProcessEnv> {
    fn default() -> Self {
        Self::new(PgConfig::default(), ProcessEnv)
    }
}

impl<E: EnvSource> PgServiceDeps<E> {
    pub fn new(pg: PgConfig, env: E) -> Self {
        Self {
            pg,
            env,
            url_env_name: DEFAULT_PG_URL_ENV_NAME.to_owned(),
            decoders: Decoders::default(),
        }
    }

    pub fn url_env_name(mut self, name: impl Into<String>) -> Self {
        self.url_env_name = name.into();
        self
    }

    pub fn decoders(mut self, decoders: Decoders) -> Self {
        self.decoders = decoders;
        self
    }
}

/// The service together with its pool failure channel.
#[derive(Debug)]
pub struct PgProvider<P: ConnectionPool = PgPool> {
    pub service: PgService<P>,
    /// Resolves on the first background connection failure.
    pub failures: PoolFailures,
}

impl PgProvider<PgPool> {
    /// Build the pool (without TLS) and the service on top of it.
    ///
    /// Connections are opened lazily, so this does not touch the network.
    pub fn init<E: EnvSource>(deps: PgServiceDeps<E>) -> PgResult<Self> {
        Self::init_with_tls(deps, NoTls)
    }
}

impl<T> PgProvider<PgPool<T>>
where
    T: MakeTlsConnect<Socket> + Clone + Sync + Send + 'static,
    T::Stream: Sync + Send,
    T::TlsConnect: Sync + Send,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    /// Same as [`PgProvider::init`] with a custom TLS connector.
    pub fn init_with_tls<E: EnvSource>(deps: PgServiceDeps<E>, tls: T) -> PgResult<Self> {
        let config = deps.pg.resolve(&deps.env, &deps.url_env_name)?;
        let pool = PgPool::with_tls(&config, tls)?;
        tracing::debug!(
            target: "pg_service",
            host = ?config.host,
            dbname = ?config.dbname,
            max_size = config.max_size,
            "initialized"
        );
        Ok(Self::from_pool(pool, deps.decoders))
    }
}

impl<P: ConnectionPool> PgProvider<P> {
    /// Wrap an existing pool.
    pub fn from_pool(pool: P, decoders: Decoders) -> Self {
        let failures = pool.failures();
        Self {
            service: PgService::new(pool, decoders),
            failures,
        }
    }

    /// See [`PgService::dispose`].
    pub async fn dispose(&self) {
        self.service.dispose().await;
    }
}
