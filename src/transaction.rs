use std::sync::Arc;

use async_lock::Mutex;
use sqlx::sqlite::Sqlite;

use crate::collection::Collection;
use crate::error::{FractalError, Result};

/// A transaction that several handles may address; collection handles bound
/// to it funnel their statements through the lock one at a time.
pub(crate) type SharedTxn = Arc<Mutex<sqlx::Transaction<'static, Sqlite>>>;

/// Handle passed to the body of a transaction combinator.
///
/// Cloneable so the async body can own it; collection handles obtained
/// through [`Txn::collection`] execute inside the transaction and must be
/// dropped before the combinator commits.
#[derive(Clone)]
pub struct Txn {
    pub(crate) shared: SharedTxn,
}

impl Txn {
    pub(crate) fn new(txn: sqlx::Transaction<'static, Sqlite>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(txn)),
        }
    }

    /// A collection handle bound to this transaction. Reads observe the
    /// transaction's own writes; compound operations rely on the enclosing
    /// transaction for atomicity instead of opening their own.
    pub fn collection<T>(&self, collection: &Collection<T>) -> Collection<T> {
        collection.bind_to_txn(self.shared.clone())
    }

    /// Consumes the handle and commits. Fails if a clone is still alive
    /// (e.g. a transaction-bound collection outliving the body).
    pub(crate) async fn commit(self) -> Result<()> {
        let txn = Arc::try_unwrap(self.shared)
            .map_err(|_| FractalError::Transaction {
                step: "commit".into(),
                message: "transaction handles still alive at commit".into(),
            })?
            .into_inner();
        txn.commit().await.map_err(|e| FractalError::Transaction {
            step: "commit".into(),
            message: e.to_string(),
        })
    }

    pub(crate) async fn rollback(self) -> Result<()> {
        let txn = match Arc::try_unwrap(self.shared) {
            Ok(mutex) => mutex.into_inner(),
            // A leaked clone keeps the inner transaction alive; dropping it
            // later rolls back implicitly.
            Err(_) => {
                return Err(FractalError::Transaction {
                    step: "rollback".into(),
                    message: "transaction handles still alive at rollback".into(),
                })
            }
        };
        txn.rollback().await.map_err(|e| FractalError::Transaction {
            step: "rollback".into(),
            message: e.to_string(),
        })
    }
}
