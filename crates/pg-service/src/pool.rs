//! Connection pool backed by `deadpool`.

use crate::config::{PgConfig, Recycling};
use crate::connection::{Connection, ConnectionPool};
use crate::decode::{Decoders, Field, QueryResult};
use crate::error::{DriverError, PgError, PgResult};
use crate::failure::{FailureNotifier, PoolFailures};
use deadpool::Runtime;
use deadpool::managed::{self, Metrics, Object, RecycleError, RecycleResult};
use pg_sql::Query;
use std::fmt;
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Socket};

/// Opens and recycles `tokio_postgres` clients.
///
/// Each client's connection future runs on its own task; when it ends with an
/// error the failure is published on the pool's [`PoolFailures`].
pub struct PgManager<T = NoTls> {
    config: tokio_postgres::Config,
    tls: T,
    recycling: Recycling,
    failures: FailureNotifier,
}

impl<T> fmt::Debug for PgManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgManager")
            .field("hosts", &self.config.get_hosts())
            .field("dbname", &self.config.get_dbname())
            .field("recycling", &self.recycling)
            .finish()
    }
}

impl<T> managed::Manager for PgManager<T>
where
    T: MakeTlsConnect<Socket> + Clone + Sync + Send + 'static,
    T::Stream: Sync + Send,
    T::TlsConnect: Sync + Send,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    type Type = Client;
    type Error = tokio_postgres::Error;

    async fn create(&self) -> Result<Client, tokio_postgres::Error> {
        let (client, connection) = self.config.connect(self.tls.clone()).await?;
        let failures = self.failures.clone();
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!(target: "pg_service", error = %err, "connection task failed");
                failures.notify(DriverError::from(err));
            }
        });
        Ok(client)
    }

    async fn recycle(
        &self,
        client: &mut Client,
        _metrics: &Metrics,
    ) -> RecycleResult<tokio_postgres::Error> {
        if client.is_closed() {
            return Err(RecycleError::Message("connection closed".into()));
        }
        if self.recycling == Recycling::Verified {
            client.simple_query("").await.map_err(RecycleError::Backend)?;
        }
        Ok(())
    }
}

/// A pool of Postgres connections.
pub struct PgPool<T = NoTls>
where
    T: MakeTlsConnect<Socket> + Clone + Sync + Send + 'static,
    T::Stream: Sync + Send,
    T::TlsConnect: Sync + Send,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    pool: managed::Pool<PgManager<T>>,
    failures: PoolFailures,
}

impl PgPool<NoTls> {
    /// Create a pool without TLS.
    ///
    /// Connections are opened lazily, on first use.
    pub fn new(config: &PgConfig) -> PgResult<Self> {
        Self::with_tls(config, NoTls)
    }
}

impl<T> PgPool<T>
where
    T: MakeTlsConnect<Socket> + Clone + Sync + Send + 'static,
    T::Stream: Sync + Send,
    T::TlsConnect: Sync + Send,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    /// Create a pool using a custom TLS connector.
    pub fn with_tls(config: &PgConfig, tls: T) -> PgResult<Self> {
        let (notifier, failures) = FailureNotifier::channel();
        let manager = PgManager {
            config: config.connect_config()?,
            tls,
            recycling: config.recycling,
            failures: notifier,
        };

        let pool = managed::Pool::builder(manager)
            .max_size(config.max_size)
            .wait_timeout(config.wait_timeout_duration())
            .create_timeout(config.create_timeout_duration())
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| PgError::Config(e.to_string()))?;

        Ok(Self { pool, failures })
    }
}

impl<T> Clone for PgPool<T>
where
    T: MakeTlsConnect<Socket> + Clone + Sync + Send + 'static,
    T::Stream: Sync + Send,
    T::TlsConnect: Sync + Send,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            failures: self.failures.clone(),
        }
    }
}

impl<T> fmt::Debug for PgPool<T>
where
    T: MakeTlsConnect<Socket> + Clone + Sync + Send + 'static,
    T::Stream: Sync + Send,
    T::TlsConnect: Sync + Send,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgPool")
            .field("manager", self.pool.manager())
            .field("status", &self.pool.status())
            .finish()
    }
}

impl<T> ConnectionPool for PgPool<T>
where
    T: MakeTlsConnect<Socket> + Clone + Sync + Send + 'static,
    T::Stream: Sync + Send,
    T::TlsConnect: Sync + Send,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    type Connection = PgConnection<T>;

    async fn acquire(&self) -> PgResult<PgConnection<T>> {
        let object = self.pool.get().await?;
        Ok(PgConnection { object })
    }

    fn close(&self) {
        self.pool.close();
    }

    fn failures(&self) -> PoolFailures {
        self.failures.clone()
    }
}

/// A client checked out of a [`PgPool`].
pub struct PgConnection<T = NoTls>
where
    T: MakeTlsConnect<Socket> + Clone + Sync + Send + 'static,
    T::Stream: Sync + Send,
    T::TlsConnect: Sync + Send,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    object: Object<PgManager<T>>,
}

impl<T> Connection for PgConnection<T>
where
    T: MakeTlsConnect<Socket> + Clone + Sync + Send + 'static,
    T::Stream: Sync + Send,
    T::TlsConnect: Sync + Send,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    async fn execute(&self, query: &Query, decoders: &Decoders) -> Result<QueryResult, DriverError> {
        let statement = self.object.prepare(&query.text).await?;
        let params: Vec<&(dyn ToSql + Sync)> = query
            .values
            .iter()
            .map(|v| v as &(dyn ToSql + Sync))
            .collect();

        let fields = statement
            .columns()
            .iter()
            .map(|c| Field::new(c.name(), c.type_()))
            .collect::<Vec<_>>();

        if fields.is_empty() {
            let row_count = self.object.execute(&statement, &params).await?;
            return Ok(QueryResult {
                fields,
                rows: Vec::new(),
                row_count,
            });
        }

        let rows = self
            .object
            .query(&statement, &params)
            .await?
            .iter()
            .map(|row| decoders.decode_row(row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(QueryResult {
            fields,
            row_count: rows.len() as u64,
            rows,
        })
    }

    async fn batch_execute(&self, sql: &str) -> Result<(), DriverError> {
        self.object.batch_execute(sql).await?;
        Ok(())
    }

    fn detach(self) {
        // Dropping the client closes its connection.
        drop(Object::take(self.object));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{PgProvider, PgServiceDeps};
    use std::collections::HashMap;

    #[test]
    fn pool_debug_shows_target_and_status() {
        let pool = PgPool::new(&PgConfig::default().dbname("app").max_size(3)).unwrap();
        let debug = format!("{pool:?}");
        assert!(debug.starts_with("PgPool"));
        assert!(debug.contains("\"app\""));
        assert!(debug.contains("max_size: 3"));
    }

    #[test]
    fn provider_is_debug() {
        let env: HashMap<String, String> = HashMap::new();
        let provider = PgProvider::init(PgServiceDeps::new(PgConfig::default(), env)).unwrap();
        assert!(format!("{provider:?}").contains("PgService"));
    }
}
