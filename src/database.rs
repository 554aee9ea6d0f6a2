//! Database lifecycle: connection ownership, collection cache and the
//! transaction combinators.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_lock::Mutex;
use futures::FutureExt;
use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::collection::Collection;
use crate::conn::Conn;
use crate::error::{map_db_err, FractalError, Result};
use crate::id::{default_id_factory, IdFactory};
use crate::retry::RetryPolicy;
use crate::schema::Schema;
use crate::table;
use crate::transaction::Txn;

/// Database-wide configuration.
#[derive(Clone)]
pub struct DatabaseOptions {
    pub id_factory: IdFactory,
    pub cache_enabled: bool,
    pub retry: RetryPolicy,
    pub max_connections: u32,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            id_factory: default_id_factory(),
            cache_enabled: true,
            retry: RetryPolicy::none(),
            max_connections: 5,
        }
    }
}

impl DatabaseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id_factory<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.id_factory = Arc::new(f);
        self
    }

    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n.max(1);
        self
    }
}

/// Per-collection overrides; unset fields inherit the database options.
#[derive(Clone, Default)]
pub struct CollectionOptions {
    pub cache_enabled: Option<bool>,
    pub retry: Option<RetryPolicy>,
}

impl CollectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = Some(enabled);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

struct DatabaseInner {
    pool: SqlitePool,
    /// Adopted pools are never closed by us.
    owned: bool,
    closed: AtomicBool,
    options: DatabaseOptions,
    collections: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

/// Owner of the backend connection and the collection cache.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Opens (creating if missing) a database file. On-disk databases run
    /// in WAL mode.
    pub async fn open(path: impl AsRef<Path>, options: DatabaseOptions) -> Result<Self> {
        let connect = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .connect_with(connect)
            .await
            .map_err(|e| FractalError::Connection {
                message: format!("could not open {}: {}", path.as_ref().display(), e),
            })?;
        Ok(Self::from_parts(pool, options, true))
    }

    /// An ephemeral database. The pool is pinned to a single connection so
    /// every handle observes the same in-memory store.
    pub async fn in_memory(options: DatabaseOptions) -> Result<Self> {
        let connect = SqliteConnectOptions::new().in_memory(true);
        // One connection, never recycled: a fresh connection would be a
        // fresh (empty) in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect)
            .await
            .map_err(|e| FractalError::Connection {
                message: format!("could not open in-memory database: {}", e),
            })?;
        Ok(Self::from_parts(pool, options, true))
    }

    /// Adopts an externally owned pool; [`close`](Self::close) will not
    /// close it.
    pub fn from_pool(pool: SqlitePool, options: DatabaseOptions) -> Self {
        Self::from_parts(pool, options, false)
    }

    fn from_parts(pool: SqlitePool, options: DatabaseOptions, owned: bool) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                pool,
                owned,
                closed: AtomicBool::new(false),
                options,
                collections: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The collection registered under `name`, materialising its table on
    /// first use. Concurrent callers observe the same handle; requesting an
    /// existing name under a different document type is an error.
    pub async fn collection<T>(&self, name: &str, schema: Schema<T>) -> Result<Collection<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.collection_with_options(name, schema, CollectionOptions::default())
            .await
    }

    pub async fn collection_with_options<T>(
        &self,
        name: &str,
        schema: Schema<T>,
        opts: CollectionOptions,
    ) -> Result<Collection<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.check_open()?;
        let mut collections = self.inner.collections.lock().await;
        if let Some(existing) = collections.get(name) {
            return existing
                .downcast_ref::<Collection<T>>()
                .cloned()
                .ok_or_else(|| {
                    FractalError::invalid(format!(
                        "collection `{}` is already open with a different document type",
                        name
                    ))
                });
        }

        // First materialisation; the schema is frozen from here on.
        let mut conn = self
            .inner
            .pool
            .acquire()
            .await
            .map_err(|e| map_db_err(e, None))?;
        table::ensure_table(&mut conn, name, &schema.fields)
            .await
            .map_err(|e| map_db_err(e, None))?;
        drop(conn);

        let cache_enabled = opts
            .cache_enabled
            .unwrap_or(self.inner.options.cache_enabled);
        let retry = crate::retry::resolve(opts.retry.as_ref(), &self.inner.options.retry).clone();
        let collection = Collection::from_schema(
            name,
            &schema,
            self.inner.options.id_factory.clone(),
            cache_enabled,
            retry,
            Conn::Pool(self.inner.pool.clone()),
        );
        collections.insert(name.to_owned(), Box::new(collection.clone()));
        Ok(collection)
    }

    async fn begin(&self) -> Result<Txn> {
        let txn = self
            .inner
            .pool
            .begin()
            .await
            .map_err(|e| FractalError::Transaction {
                step: "begin".into(),
                message: e.to_string(),
            })?;
        Ok(Txn::new(txn))
    }

    /// Runs `body` inside a transaction: commits on `Ok`, rolls back on
    /// `Err` and on panic (a panic surfaces as a `Transaction` error).
    ///
    /// The body receives a [`Txn`] handle; collection handles bound to it
    /// via [`Txn::collection`] must not outlive the body.
    pub async fn transaction<R, F, Fut>(&self, body: F) -> Result<R>
    where
        F: FnOnce(Txn) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.check_open()?;
        let txn = self.begin().await?;
        match AssertUnwindSafe(body(txn.clone())).catch_unwind().await {
            Ok(Ok(value)) => {
                txn.commit().await?;
                Ok(value)
            }
            Ok(Err(err)) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!("rollback after error failed: {}", rollback_err);
                }
                Err(err)
            }
            Err(panic) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!("rollback after panic failed: {}", rollback_err);
                }
                Err(FractalError::Transaction {
                    step: "execute".into(),
                    message: panic_message(panic),
                })
            }
        }
    }

    /// Like [`transaction`](Self::transaction) for bodies that cannot fail:
    /// commits on normal return, rolls back and re-raises on panic.
    pub async fn transaction_infallible<R, F, Fut>(&self, body: F) -> Result<R>
    where
        F: FnOnce(Txn) -> Fut,
        Fut: Future<Output = R>,
    {
        self.check_open()?;
        let txn = self.begin().await?;
        match AssertUnwindSafe(body(txn.clone())).catch_unwind().await {
            Ok(value) => {
                txn.commit().await?;
                Ok(value)
            }
            Err(panic) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!("rollback after panic failed: {}", rollback_err);
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Idempotent. Owned pools are closed; adopted pools are left alone.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.collections.lock().await.clear();
        if self.inner.owned {
            self.inner.pool.close().await;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(FractalError::invalid("database is closed"));
        }
        Ok(())
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "transaction body panicked".to_owned()
    }
}
