//! Named pool registry
//!
//! # Design
//!
//! - At most one pool per logical name for the life of the registry
//! - Creation is single-flight per name: concurrent first callers share one
//!   `OnceCell` and await the same initialization
//! - The registry lock is a std mutex and is never held across an await
//! - Pool configuration is fixed at creation; only `close`/`shutdown_all`
//!   remove a pool

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use futures::TryStreamExt;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode, PgTypeInfo};
use sqlx::{Either, Executor, PgConnection, PgPool, Statement};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use scribedb_core::{ConnectSettings, TlsPolicy, DEFAULT_POOL};

use crate::error::DbError;
use crate::resolver::ConnectionResolver;
use crate::retry::RetryPolicy;
use crate::rows::{bind_as, bind_value, row_to_json, QueryResult};

/// Slack on top of the server-side statement timeout before the client gives up
const CLIENT_DEADLINE_SLACK: Duration = Duration::from_secs(2);

/// Snapshot of a pool's socket usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Open connections, idle or in use
    pub size: u32,
    pub idle: u32,
}

/// One live pool plus the settings it was built from
pub struct ManagedPool {
    name: String,
    pool: PgPool,
    settings: ConnectSettings,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for ManagedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedPool")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl ManagedPool {
    /// Build a lazy pool; no socket is opened until first acquire.
    fn new(name: &str, settings: ConnectSettings) -> Self {
        let limits = settings.limits;
        let options = PgConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .username(&settings.user)
            .password(&settings.password)
            .database(&settings.database)
            .ssl_mode(match settings.tls {
                TlsPolicy::Require => PgSslMode::Require,
                TlsPolicy::Disable => PgSslMode::Disable,
            })
            .application_name("scribedb")
            .options([(
                "statement_timeout",
                limits.statement_timeout.as_millis().to_string(),
            )]);

        let pool = PgPoolOptions::new()
            .max_connections(limits.max_connections)
            .min_connections(limits.min_idle)
            .idle_timeout(Some(limits.idle_timeout))
            .acquire_timeout(limits.connect_timeout)
            .test_before_acquire(true)
            .connect_lazy_with(options);

        Self {
            name: name.to_string(),
            pool,
            settings,
            created_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn settings(&self) -> &ConnectSettings {
        &self.settings
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle() as u32,
        }
    }

    /// Execute one statement on an exclusively held connection.
    ///
    /// The connection goes back to the pool when this returns, whatever the
    /// outcome. If the client-side deadline fires the connection is detached
    /// and dropped instead, since its protocol state is unknown.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult, DbError> {
        let mut conn = self.pool.acquire().await.map_err(DbError::classify)?;

        let deadline = self.settings.limits.statement_timeout + CLIENT_DEADLINE_SLACK;
        let outcome = tokio::time::timeout(deadline, run_statement(&mut conn, sql, params)).await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    pool = %self.name,
                    "statement exceeded client deadline, discarding connection"
                );
                drop(conn.detach());
                Err(DbError::Timeout {
                    seconds: deadline.as_secs(),
                })
            }
        }
    }

    /// `SELECT 1` bounded by the connect timeout
    pub async fn ping(&self) -> Result<(), DbError> {
        let timeout = self.settings.limits.connect_timeout + CLIENT_DEADLINE_SLACK;
        let check = async {
            let mut conn = self.pool.acquire().await.map_err(DbError::classify)?;
            sqlx::query("SELECT 1")
                .execute(&mut *conn)
                .await
                .map_err(DbError::classify)?;
            Ok::<_, DbError>(())
        };

        tokio::time::timeout(timeout, check)
            .await
            .map_err(|_| DbError::Timeout {
                seconds: timeout.as_secs(),
            })?
    }
}

async fn run_statement(
    conn: &mut PgConnection,
    sql: &str,
    params: &[Value],
) -> Result<QueryResult, DbError> {
    // The prepared statement lands in the connection's statement cache, so the
    // execution below reuses it rather than preparing twice.
    let inferred: Vec<PgTypeInfo> = if params.is_empty() {
        Vec::new()
    } else {
        let statement = (&mut *conn).prepare(sql).await.map_err(DbError::classify)?;
        match statement.parameters() {
            Some(Either::Left(types)) => types.to_vec(),
            _ => Vec::new(),
        }
    };

    let mut query = sqlx::query(sql);
    for (index, param) in params.iter().enumerate() {
        query = match inferred.get(index) {
            Some(target) => bind_as(query, index + 1, param, target)
                .map_err(|e| DbError::Query(sqlx::Error::Encode(Box::new(e))))?,
            None => bind_value(query, param),
        };
    }

    let mut result = QueryResult::default();
    let mut stream = conn.fetch_many(query);
    while let Some(step) = stream.try_next().await.map_err(DbError::classify)? {
        match step {
            Either::Left(done) => result.row_count += done.rows_affected(),
            Either::Right(row) => result.rows.push(row_to_json(&row)),
        }
    }
    Ok(result)
}

type PoolSlot = Arc<OnceCell<Arc<ManagedPool>>>;

/// Registry of named pools
pub struct PoolManager {
    resolver: Arc<dyn ConnectionResolver>,
    pools: Mutex<HashMap<String, PoolSlot>>,
    retry: RetryPolicy,
}

impl PoolManager {
    pub fn new(resolver: impl ConnectionResolver + 'static) -> Self {
        Self::from_arc(Arc::new(resolver))
    }

    pub fn from_arc(resolver: Arc<dyn ConnectionResolver>) -> Self {
        Self {
            resolver,
            pools: Mutex::new(HashMap::new()),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, PoolSlot>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the pool for `name`, creating it on first use.
    ///
    /// A failed creation leaves the slot empty so the next caller tries again.
    pub async fn get_pool(&self, name: &str) -> Result<Arc<ManagedPool>, DbError> {
        let slot = self.slots().entry(name.to_string()).or_default().clone();

        let pool = slot
            .get_or_try_init(|| async {
                let settings = self.resolver.resolve(name).map_err(|e| {
                    warn!(pool = name, missing = ?e.variables(), "cannot build pool: {}", e);
                    e
                })?;
                info!(
                    pool = name,
                    host = %settings.host,
                    port = settings.port,
                    tls = ?settings.tls,
                    max_connections = settings.limits.max_connections,
                    "creating connection pool"
                );
                Ok::<_, DbError>(Arc::new(ManagedPool::new(name, settings)))
            })
            .await?;

        Ok(Arc::clone(pool))
    }

    /// Run a statement on the default pool
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult, DbError> {
        self.query_on(DEFAULT_POOL, sql, params).await
    }

    /// Run a statement on a named pool, retrying transient connection failures
    pub async fn query_on(
        &self,
        name: &str,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryResult, DbError> {
        self.retry
            .run(name, || async move {
                let pool = self.get_pool(name).await?;
                pool.execute(sql, params).await
            })
            .await
            .map_err(|e| {
                debug!(pool = name, kind = e.kind(), "query failed: {}", e);
                e
            })
    }

    /// Run `f` inside a transaction on the default pool
    pub async fn with_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, E>>,
        E: From<DbError>,
    {
        self.with_transaction_on(DEFAULT_POOL, f).await
    }

    /// Run `f` inside a transaction on a named pool.
    ///
    /// COMMIT on `Ok`, ROLLBACK on `Err`. If `f` panics or the future is
    /// dropped, the transaction guard rolls back before the connection is
    /// reused.
    pub async fn with_transaction_on<T, E, F>(&self, name: &str, f: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, E>>,
        E: From<DbError>,
    {
        let pool = self.get_pool(name).await?;
        let mut tx = pool.pool().begin().await.map_err(DbError::classify)?;

        let outcome = f(&mut *tx).await;
        match outcome {
            Ok(value) => {
                tx.commit().await.map_err(DbError::classify)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(pool = name, error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    /// `SELECT 1` against `name`. Never fails: every error is logged and
    /// reported as `false`.
    pub async fn is_healthy(&self, name: &str) -> bool {
        let pool = match self.get_pool(name).await {
            Ok(pool) => pool,
            Err(e) => {
                warn!(pool = name, kind = e.kind(), "health check failed: {}", e);
                return false;
            }
        };

        match pool.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    pool = name,
                    host = %pool.settings().host,
                    port = pool.settings().port,
                    kind = e.kind(),
                    "health check failed: {}",
                    e
                );
                false
            }
        }
    }

    /// Names of pools that have been created
    pub fn cached_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots()
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.cached_names().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stats for a cached pool; `None` if it has not been created
    pub fn stats(&self, name: &str) -> Option<PoolStats> {
        self.slots()
            .get(name)
            .and_then(|slot| slot.get())
            .map(|pool| pool.stats())
    }

    /// The pool for `name` if it has already been created
    pub fn cached(&self, name: &str) -> Option<Arc<ManagedPool>> {
        self.slots().get(name).and_then(|slot| slot.get().cloned())
    }

    /// Close and evict one pool. The next `get_pool` builds a fresh one.
    pub async fn close(&self, name: &str) -> bool {
        let slot = self.slots().remove(name);
        match slot.and_then(|s| s.get().cloned()) {
            Some(pool) => {
                pool.pool().close().await;
                info!(pool = name, "closed connection pool");
                true
            }
            None => false,
        }
    }

    /// Close every cached pool concurrently and clear the registry
    pub async fn shutdown_all(&self) {
        let drained: Vec<(String, PoolSlot)> = self.slots().drain().collect();
        let live: Vec<Arc<ManagedPool>> = drained
            .into_iter()
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect();

        let count = live.len();
        join_all(live.iter().map(|pool| async move {
            pool.pool().close().await;
            debug!(pool = pool.name(), "pool closed");
        }))
        .await;

        info!(count, "closed all connection pools");
    }
}
