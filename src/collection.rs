//! The typed read/write surface of a collection.
//!
//! A collection handle is cheap to clone and safe to share. It talks to the
//! database either through the pool or, when obtained from
//! [`Txn::collection`](crate::transaction::Txn::collection), through an
//! ambient transaction. Compound operations (batches, find-and-modify) open
//! their own transaction in the first case and join the ambient one in the
//! second.

use std::marker::PhantomData;
use std::sync::Arc;

use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::Row;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::conn::{self, Conn, ConnGuard};
use crate::document::{now_ms, Document};
use crate::error::{map_db_err, FractalError, Result};
use crate::id::IdFactory;
use crate::options::{
    FindAndModifyOptions, InsertManyOptions, QueryOptions, ReturnDocument, SortOrder,
};
use crate::query::cache::TranslationCache;
use crate::query::translate::{Translator, TranslatorResult};
use crate::query::Query;
use crate::retry::RetryPolicy;
use crate::schema::{Schema, SchemaFields, Validator};
use crate::sql::quote_ident;
use crate::value::Value;

/// Outcome of [`Collection::insert_many`].
#[derive(Debug)]
pub struct InsertManyResult<T> {
    pub documents: Vec<Document<T>>,
    pub inserted_count: u64,
    /// Per-document failures of an unordered batch, in input order.
    pub errors: Vec<InsertManyError>,
}

#[derive(Debug)]
pub struct InsertManyError {
    /// Index of the failed document in the input batch.
    pub index: usize,
    pub error: FractalError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteResult {
    pub deleted: u64,
}

/// Configuration shared by every clone of a collection handle.
pub(crate) struct CollectionCore {
    pub name: String,
    pub schema: Arc<SchemaFields>,
    pub id_factory: IdFactory,
    pub cache: TranslationCache,
    pub retry: RetryPolicy,
}

/// Handle to a named, schema-bound set of documents of one type.
pub struct Collection<T> {
    core: Arc<CollectionCore>,
    validator: Option<Validator<T>>,
    conn: Conn,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            validator: self.validator.clone(),
            conn: self.conn.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.core.name)
            .finish()
    }
}

enum Projection {
    Select(Vec<String>),
    Omit(Vec<String>),
}

impl Projection {
    fn from_options(opts: &QueryOptions) -> Option<Projection> {
        if let Some(fields) = &opts.select {
            Some(Projection::Select(fields.clone()))
        } else {
            opts.omit.as_ref().map(|fields| Projection::Omit(fields.clone()))
        }
    }

    fn apply(&self, body: &mut serde_json::Value) {
        let map = match body.as_object_mut() {
            Some(map) => map,
            None => return,
        };
        match self {
            Projection::Select(fields) => map.retain(|key, _| fields.iter().any(|f| f == key)),
            Projection::Omit(fields) => map.retain(|key, _| !fields.iter().any(|f| f == key)),
        }
    }
}

/// A transaction to run compound statements in: freshly opened on the pool,
/// or the ambient one the handle is already bound to.
enum WriteScope {
    Owned(sqlx::Transaction<'static, Sqlite>),
    Ambient(ConnGuard),
}

impl WriteScope {
    fn conn(&mut self) -> &mut sqlx::SqliteConnection {
        match self {
            Self::Owned(txn) => txn,
            Self::Ambient(guard) => guard.conn(),
        }
    }

    async fn commit(self) -> Result<()> {
        match self {
            Self::Owned(txn) => txn.commit().await.map_err(|e| FractalError::Transaction {
                step: "commit".into(),
                message: e.to_string(),
            }),
            Self::Ambient(_) => Ok(()),
        }
    }

    async fn rollback(self) {
        if let Self::Owned(txn) = self {
            if let Err(e) = txn.rollback().await {
                warn!("rollback failed: {}", e);
            }
        }
    }
}

impl<T> Collection<T> {
    pub(crate) fn new(
        core: Arc<CollectionCore>,
        validator: Option<Validator<T>>,
        conn: Conn,
    ) -> Self {
        Self {
            core,
            validator,
            conn,
            _marker: PhantomData,
        }
    }

    pub(crate) fn from_schema(
        name: impl Into<String>,
        schema: &Schema<T>,
        id_factory: IdFactory,
        cache_enabled: bool,
        retry: RetryPolicy,
        conn: Conn,
    ) -> Self {
        let core = CollectionCore {
            name: name.into(),
            schema: schema.fields.clone(),
            id_factory,
            cache: TranslationCache::new(cache_enabled),
            retry,
        };
        Self::new(Arc::new(core), schema.validator.clone(), conn)
    }

    pub(crate) fn bind_to_txn(&self, shared: crate::transaction::SharedTxn) -> Self {
        Self {
            core: self.core.clone(),
            validator: self.validator.clone(),
            conn: Conn::Txn(shared),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    fn table(&self) -> String {
        quote_ident(&self.core.name)
    }

    fn translator(&self) -> Translator<'_> {
        Translator::new(&self.core.schema)
    }

    fn translate(&self, query: &Query, opts: &QueryOptions) -> Result<TranslatorResult> {
        self.core
            .cache
            .get_or_translate(query, opts, || self.translator().translate(query, opts))
    }

    async fn begin_write(&self) -> Result<WriteScope> {
        match &self.conn {
            Conn::Pool(pool) => {
                if pool.is_closed() {
                    return Err(FractalError::invalid("database is closed"));
                }
                let txn = pool.begin().await.map_err(|e| FractalError::Transaction {
                    step: "begin".into(),
                    message: e.to_string(),
                })?;
                Ok(WriteScope::Owned(txn))
            }
            Conn::Txn(_) => Ok(WriteScope::Ambient(self.conn.acquire().await?)),
        }
    }
}

fn check_cancel(token: &Option<CancellationToken>) -> Result<()> {
    match token {
        Some(token) if token.is_cancelled() => {
            Err(FractalError::aborted("operation cancelled by caller"))
        }
        _ => Ok(()),
    }
}

fn sort_options(sort: &[(String, SortOrder)]) -> QueryOptions {
    let mut opts = QueryOptions::new().limit(1);
    for (field, order) in sort {
        opts = opts.sort(field.clone(), *order);
    }
    opts
}

/// Prepared row of a pending insert.
struct PendingInsert {
    id: String,
    body: String,
    created_at: i64,
}

impl<T: Serialize + DeserializeOwned> Collection<T> {
    /// Runs the schema validator, if one is declared.
    pub fn validate(&self, data: T) -> Result<T> {
        match &self.validator {
            Some(validator) => validator(data).map_err(FractalError::validation),
            None => Ok(data),
        }
    }

    fn row_to_document(&self, row: &SqliteRow, projection: Option<&Projection>) -> Result<Document<T>> {
        let id: String = row.try_get("_id").map_err(|e| map_db_err(e, None))?;
        let body: String = row.try_get("body").map_err(|e| map_db_err(e, None))?;
        let created_at: i64 = row.try_get("created_at").map_err(|e| map_db_err(e, None))?;
        let updated_at: i64 = row.try_get("updated_at").map_err(|e| map_db_err(e, None))?;
        let data = match projection {
            Some(projection) => {
                let mut json = codec::decode_json(&body)?;
                projection.apply(&mut json);
                codec::from_json_value(json)?
            }
            None => codec::decode(&body)?,
        };
        Ok(Document {
            id,
            data,
            created_at,
            updated_at,
        })
    }

    fn select_clause(&self) -> String {
        format!(
            "SELECT _id, json(body) AS body, created_at, updated_at FROM {}",
            self.table()
        )
    }

    // ---- reads ----

    /// Reads re-invoke cleanly, so they run under the resolved retry
    /// policy; writes are only retried when the caller wraps them.
    async fn fetch_optional_retry(
        &self,
        sql: &str,
        params: &[(String, Value)],
    ) -> Result<Option<SqliteRow>> {
        let conn = &self.conn;
        self.core
            .retry
            .run(move || async move {
                let mut guard = conn.acquire().await?;
                conn::fetch_optional(guard.conn(), sql, params).await
            })
            .await
    }

    async fn fetch_all_retry(
        &self,
        sql: &str,
        params: &[(String, Value)],
    ) -> Result<Vec<SqliteRow>> {
        let conn = &self.conn;
        self.core
            .retry
            .run(move || async move {
                let mut guard = conn.acquire().await?;
                conn::fetch_all(guard.conn(), sql, params).await
            })
            .await
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Document<T>>> {
        let sql = format!("{} WHERE _id = @id", self.select_clause());
        let params = vec![("@id".to_owned(), Value::Text(id.to_owned()))];
        let row = self.fetch_optional_retry(&sql, &params).await?;
        row.map(|row| self.row_to_document(&row, None)).transpose()
    }

    pub async fn find(&self, query: &Query, opts: &QueryOptions) -> Result<Vec<Document<T>>> {
        let translation = self.translate(query, opts)?;
        let projection = Projection::from_options(opts);
        let sql = format!("{} WHERE {}", self.select_clause(), translation.sql);
        let rows = self.fetch_all_retry(&sql, &translation.params).await?;
        rows.iter()
            .map(|row| self.row_to_document(row, projection.as_ref()))
            .collect()
    }

    /// `find` with `limit = 1`; `skip` and sort are honoured.
    pub async fn find_one(&self, query: &Query, opts: &QueryOptions) -> Result<Option<Document<T>>> {
        let mut opts = opts.clone();
        opts.limit = Some(1);
        Ok(self.find(query, &opts).await?.into_iter().next())
    }

    pub async fn count(&self, query: &Query) -> Result<u64> {
        let translation = self.translator().translate_filter(query)?;
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", self.table(), translation.sql);
        self.count_with(&sql, &translation.params).await
    }

    /// Table-wide count, no filter.
    pub async fn estimated_count(&self) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table());
        self.count_with(&sql, &[]).await
    }

    async fn count_with(&self, sql: &str, params: &[(String, Value)]) -> Result<u64> {
        let row = self.fetch_optional_retry(sql, params).await?;
        match row {
            Some(row) => {
                let count: i64 = row.try_get(0).map_err(|e| map_db_err(e, None))?;
                Ok(count.max(0) as u64)
            }
            None => Ok(0),
        }
    }

    /// Distinct values of one field over the filtered set.
    pub async fn distinct(&self, field: &str, query: &Query) -> Result<Vec<Value>> {
        let translation = self.translator().translate_filter(query)?;
        let sql = format!(
            "SELECT DISTINCT {} FROM {} WHERE {}",
            self.translator().resolve(field),
            self.table(),
            translation.sql
        );
        let rows = self.fetch_all_retry(&sql, &translation.params).await?;
        rows.iter().map(|row| conn::column_to_value(row, 0)).collect()
    }

    pub async fn exists(&self, query: &Query) -> Result<bool> {
        let translation = self.translator().translate_filter(query)?;
        let sql = format!(
            "SELECT 1 FROM {} WHERE {} LIMIT 1",
            self.table(),
            translation.sql
        );
        let row = self.fetch_optional_retry(&sql, &translation.params).await?;
        Ok(row.is_some())
    }

    // ---- single writes ----

    /// Validates, encodes and prepares one document for insertion. The id
    /// comes from a non-empty top-level `"id"` string in the encoded body
    /// when present, from the id factory otherwise.
    fn prepare_insert(&self, data: T) -> Result<(PendingInsert, T)> {
        let data = self.validate(data)?;
        let body = codec::encode(&data)?;
        let id = match codec::decode_value(&body, "id")? {
            Value::Text(supplied) => {
                if supplied.is_empty() {
                    return Err(FractalError::Validation {
                        field: Some("id".into()),
                        message: "document id must not be empty".into(),
                    });
                }
                supplied
            }
            Value::Null => {
                let generated = (self.core.id_factory)();
                if generated.is_empty() {
                    return Err(FractalError::Validation {
                        field: Some("id".into()),
                        message: "id factory produced an empty id".into(),
                    });
                }
                generated
            }
            other => {
                return Err(FractalError::Validation {
                    field: Some("id".into()),
                    message: format!("document id must be a string, got {}", other.kind_str()),
                })
            }
        };
        Ok((
            PendingInsert {
                id,
                body,
                created_at: now_ms(),
            },
            data,
        ))
    }

    async fn exec_insert(
        &self,
        conn: &mut sqlx::SqliteConnection,
        pending: &PendingInsert,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (_id, body, created_at, updated_at) \
             VALUES (@id, jsonb(@body), @created, @updated)",
            self.table()
        );
        let params = vec![
            ("@id".to_owned(), Value::Text(pending.id.clone())),
            ("@body".to_owned(), Value::Text(pending.body.clone())),
            ("@created".to_owned(), Value::Int(pending.created_at)),
            ("@updated".to_owned(), Value::Int(pending.created_at)),
        ];
        conn::execute(conn, &sql, &params)
            .await
            .map_err(|e| self.enrich_unique(e, &pending.id, &pending.body))?;
        Ok(())
    }

    /// Fills in the offending value of a unique-constraint error from the
    /// document that triggered it.
    fn enrich_unique(&self, mut err: FractalError, id: &str, body: &str) -> FractalError {
        if let FractalError::UniqueConstraint { field, value } = &mut err {
            if field == "_id" {
                *value = id.to_owned();
            } else if let Some(def) = self.core.schema.field(field) {
                let dotted = def.path.trim_start_matches("$.");
                if let Ok(v) = codec::decode_value(body, dotted) {
                    *value = display_value(&v);
                }
            }
        }
        err
    }

    pub async fn insert_one(&self, data: T) -> Result<Document<T>> {
        let (pending, data) = self.prepare_insert(data)?;
        let mut guard = self.conn.acquire().await?;
        self.exec_insert(guard.conn(), &pending).await?;
        Ok(Document::new(pending.id, data, pending.created_at))
    }

    /// Reads the document, applies `update`, refreshes `updated_at` and
    /// writes the result back. The id and `created_at` are preserved. The
    /// read and the write are separate statements; for a read-modify-write
    /// that is atomic against concurrent writers use
    /// [`find_one_and_update`](Self::find_one_and_update).
    pub async fn update_by_id<F>(&self, id: &str, update: F) -> Result<Document<T>>
    where
        F: FnOnce(T) -> T,
    {
        let doc = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| FractalError::NotFound { id: id.to_owned() })?;
        let mut guard = self.conn.acquire().await?;
        self.exec_update(guard.conn(), doc, update).await
    }

    async fn exec_update<F>(
        &self,
        conn: &mut sqlx::SqliteConnection,
        doc: Document<T>,
        update: F,
    ) -> Result<Document<T>>
    where
        F: FnOnce(T) -> T,
    {
        let data = self.validate(update(doc.data))?;
        let body = codec::encode(&data)?;
        // A structurally unchanged document still gets a fresh updated_at;
        // only the schema's timestamps flag turns that off.
        let updated_at = if self.core.schema.timestamps {
            now_ms()
        } else {
            doc.updated_at
        };
        let sql = format!(
            "UPDATE {} SET body = jsonb(@body), updated_at = @updated WHERE _id = @id",
            self.table()
        );
        let params = vec![
            ("@body".to_owned(), Value::Text(body.clone())),
            ("@updated".to_owned(), Value::Int(updated_at)),
            ("@id".to_owned(), Value::Text(doc.id.clone())),
        ];
        let affected = conn::execute(conn, &sql, &params)
            .await
            .map_err(|e| self.enrich_unique(e, &doc.id, &body))?;
        if affected == 0 {
            return Err(FractalError::NotFound { id: doc.id });
        }
        Ok(Document {
            id: doc.id,
            data,
            created_at: doc.created_at,
            updated_at,
        })
    }

    /// Updates the first document matching the filter, if any.
    pub async fn update_one<F>(&self, query: &Query, update: F) -> Result<Option<Document<T>>>
    where
        F: FnOnce(T) -> T,
    {
        self.update_one_with(query, &QueryOptions::new(), update).await
    }

    /// Like [`update_one`](Self::update_one) with an explicit victim
    /// selection (sort, skip).
    pub async fn update_one_with<F>(
        &self,
        query: &Query,
        opts: &QueryOptions,
        update: F,
    ) -> Result<Option<Document<T>>>
    where
        F: FnOnce(T) -> T,
    {
        match self.find_one(query, opts).await? {
            Some(doc) => {
                let mut guard = self.conn.acquire().await?;
                self.exec_update(guard.conn(), doc, update).await.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Replaces the data wholesale; id and `created_at` are preserved.
    pub async fn replace_by_id(&self, id: &str, data: T) -> Result<Document<T>> {
        self.update_by_id(id, |_| data).await
    }

    /// Replaces the first document matching the filter, if any.
    pub async fn replace_one(&self, query: &Query, data: T) -> Result<Option<Document<T>>> {
        self.update_one(query, |_| data).await
    }

    /// Returns the number of deleted rows (0 or 1).
    pub async fn delete_by_id(&self, id: &str) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE _id = @id", self.table());
        let params = vec![("@id".to_owned(), Value::Text(id.to_owned()))];
        let mut guard = self.conn.acquire().await?;
        conn::execute(guard.conn(), &sql, &params).await
    }

    /// Deletes the first document matching the filter.
    pub async fn delete_one(&self, query: &Query) -> Result<u64> {
        self.delete_one_with(query, &QueryOptions::new()).await
    }

    /// Like [`delete_one`](Self::delete_one) with an explicit victim
    /// selection (sort, skip).
    pub async fn delete_one_with(&self, query: &Query, opts: &QueryOptions) -> Result<u64> {
        match self.find_one(query, opts).await? {
            Some(doc) => self.delete_by_id(&doc.id).await,
            None => Ok(0),
        }
    }

    // ---- batch writes ----

    /// Inserts a batch inside one transaction. Ordered batches abort and
    /// roll back on the first failure; unordered batches accumulate
    /// unique-constraint failures and commit the successful inserts.
    /// Errors that cannot succeed on retry (validation, encoding) are fatal
    /// in both modes.
    pub async fn insert_many(
        &self,
        docs: Vec<T>,
        opts: InsertManyOptions,
    ) -> Result<InsertManyResult<T>> {
        check_cancel(&opts.cancel)?;

        // Prepare everything up front so deterministic failures surface
        // before any row is written.
        let mut pending = Vec::with_capacity(docs.len());
        for data in docs {
            pending.push(self.prepare_insert(data)?);
        }

        let mut scope = self.begin_write().await?;
        let mut documents = Vec::with_capacity(pending.len());
        let mut errors = Vec::new();

        for (index, (insert, data)) in pending.into_iter().enumerate() {
            if let Err(err) = check_cancel(&opts.cancel) {
                scope.rollback().await;
                return Err(err);
            }
            match self.exec_insert(scope.conn(), &insert).await {
                Ok(()) => documents.push(Document::new(insert.id, data, insert.created_at)),
                Err(err) => {
                    if opts.ordered {
                        scope.rollback().await;
                        return Err(err);
                    }
                    if !matches!(err, FractalError::UniqueConstraint { .. }) {
                        scope.rollback().await;
                        return Err(err);
                    }
                    errors.push(InsertManyError { index, error: err });
                }
            }
        }

        scope.commit().await?;
        Ok(InsertManyResult {
            inserted_count: documents.len() as u64,
            documents,
            errors,
        })
    }

    /// Applies `update` to every document matching the filter, inside one
    /// transaction.
    pub async fn update_many<F>(&self, query: &Query, update: F) -> Result<UpdateResult>
    where
        F: Fn(T) -> T,
    {
        self.update_many_with(query, update, None).await
    }

    pub async fn update_many_with<F>(
        &self,
        query: &Query,
        update: F,
        cancel: Option<CancellationToken>,
    ) -> Result<UpdateResult>
    where
        F: Fn(T) -> T,
    {
        check_cancel(&cancel)?;
        let translation = self.translate(query, &QueryOptions::new())?;
        let sql = format!("{} WHERE {}", self.select_clause(), translation.sql);

        let mut scope = self.begin_write().await?;
        let rows = match conn::fetch_all(scope.conn(), &sql, &translation.params).await {
            Ok(rows) => rows,
            Err(err) => {
                scope.rollback().await;
                return Err(err);
            }
        };
        let matched = rows.len() as u64;
        let mut modified = 0;
        for row in &rows {
            if let Err(err) = check_cancel(&cancel) {
                scope.rollback().await;
                return Err(err);
            }
            let doc = match self.row_to_document(row, None) {
                Ok(doc) => doc,
                Err(err) => {
                    scope.rollback().await;
                    return Err(err);
                }
            };
            match self.exec_update(scope.conn(), doc, &update).await {
                Ok(_) => modified += 1,
                Err(err) => {
                    scope.rollback().await;
                    return Err(err);
                }
            }
        }
        scope.commit().await?;
        Ok(UpdateResult { matched, modified })
    }

    /// Deletes every document matching the filter with a single statement.
    pub async fn delete_many(&self, query: &Query) -> Result<DeleteResult> {
        let translation = self.translator().translate_filter(query)?;
        let sql = format!("DELETE FROM {} WHERE {}", self.table(), translation.sql);
        let mut guard = self.conn.acquire().await?;
        let deleted = conn::execute(guard.conn(), &sql, &translation.params).await?;
        Ok(DeleteResult { deleted })
    }

    // ---- atomic find-and-modify ----

    /// Atomically removes the best match and returns it as it was.
    pub async fn find_one_and_delete(
        &self,
        query: &Query,
        sort: &[(String, SortOrder)],
    ) -> Result<Option<Document<T>>> {
        let opts = sort_options(sort);
        let translation = self.translate(query, &opts)?;
        let select = format!("{} WHERE {}", self.select_clause(), translation.sql);

        let mut scope = self.begin_write().await?;
        let outcome = async {
            let row = conn::fetch_optional(scope.conn(), &select, &translation.params).await?;
            let doc = match row {
                Some(row) => self.row_to_document(&row, None)?,
                None => return Ok(None),
            };
            let delete = format!("DELETE FROM {} WHERE _id = @id", self.table());
            let params = vec![("@id".to_owned(), Value::Text(doc.id.clone()))];
            conn::execute(scope.conn(), &delete, &params).await?;
            Ok(Some(doc))
        }
        .await;
        match outcome {
            Ok(result) => {
                scope.commit().await?;
                Ok(result)
            }
            Err(err) => {
                scope.rollback().await;
                Err(err)
            }
        }
    }

    /// Atomically updates the best match in a single transaction. With
    /// `upsert`, a missing match is created by applying the update to a
    /// defaulted value; `ReturnDocument::Before` then yields `None`.
    pub async fn find_one_and_update<F>(
        &self,
        query: &Query,
        update: F,
        opts: FindAndModifyOptions,
    ) -> Result<Option<Document<T>>>
    where
        F: FnOnce(T) -> T,
        T: Default,
    {
        check_cancel(&opts.cancel)?;
        let select_opts = sort_options(&opts.sort);
        let translation = self.translate(query, &select_opts)?;
        let select = format!("{} WHERE {}", self.select_clause(), translation.sql);

        let mut scope = self.begin_write().await?;
        let outcome = async {
            let row = conn::fetch_optional(scope.conn(), &select, &translation.params).await?;
            check_cancel(&opts.cancel)?;
            match row {
                Some(row) => {
                    let before = self.row_to_document(&row, None)?;
                    match opts.return_document {
                        ReturnDocument::Before => {
                            // The pre-image is decoded a second time because
                            // the update consumes the first copy.
                            let pre_image = self.row_to_document(&row, None)?;
                            self.exec_update(scope.conn(), before, update).await?;
                            Ok(Some(pre_image))
                        }
                        ReturnDocument::After => {
                            Ok(Some(self.exec_update(scope.conn(), before, update).await?))
                        }
                    }
                }
                None if opts.upsert => {
                    let (pending, data) = self.prepare_insert(update(T::default()))?;
                    self.exec_insert(scope.conn(), &pending).await?;
                    match opts.return_document {
                        ReturnDocument::Before => Ok(None),
                        ReturnDocument::After => {
                            Ok(Some(Document::new(pending.id, data, pending.created_at)))
                        }
                    }
                }
                None => Ok(None),
            }
        }
        .await;
        match outcome {
            Ok(result) => {
                scope.commit().await?;
                Ok(result)
            }
            Err(err) => {
                scope.rollback().await;
                Err(err)
            }
        }
    }

    /// Atomically replaces the best match wholesale. Analogous to
    /// [`find_one_and_update`](Self::find_one_and_update) with a constant
    /// function; `upsert` inserts the provided data when nothing matches.
    pub async fn find_one_and_replace(
        &self,
        query: &Query,
        data: T,
        opts: FindAndModifyOptions,
    ) -> Result<Option<Document<T>>> {
        check_cancel(&opts.cancel)?;
        let select_opts = sort_options(&opts.sort);
        let translation = self.translate(query, &select_opts)?;
        let select = format!("{} WHERE {}", self.select_clause(), translation.sql);

        let mut scope = self.begin_write().await?;
        let outcome = async {
            let row = conn::fetch_optional(scope.conn(), &select, &translation.params).await?;
            check_cancel(&opts.cancel)?;
            match row {
                Some(row) => {
                    let before = self.row_to_document(&row, None)?;
                    let pre_image = match opts.return_document {
                        ReturnDocument::Before => Some(self.row_to_document(&row, None)?),
                        ReturnDocument::After => None,
                    };
                    let after = self.exec_update(scope.conn(), before, |_| data).await?;
                    match pre_image {
                        Some(doc) => Ok(Some(doc)),
                        None => Ok(Some(after)),
                    }
                }
                None if opts.upsert => {
                    let (pending, data) = self.prepare_insert(data)?;
                    self.exec_insert(scope.conn(), &pending).await?;
                    match opts.return_document {
                        ReturnDocument::Before => Ok(None),
                        ReturnDocument::After => {
                            Ok(Some(Document::new(pending.id, data, pending.created_at)))
                        }
                    }
                }
                None => Ok(None),
            }
        }
        .await;
        match outcome {
            Ok(result) => {
                scope.commit().await?;
                Ok(result)
            }
            Err(err) => {
                scope.rollback().await;
                Err(err)
            }
        }
    }

    // ---- utility ----

    /// Drops the backing table and clears the translation cache. The handle
    /// stays usable once the table is re-materialised.
    pub async fn drop(&self) -> Result<()> {
        let sql = crate::table::drop_table_sql(&self.core.name);
        let mut guard = self.conn.acquire().await?;
        conn::execute(guard.conn(), &sql, &[]).await?;
        self.core.cache.clear();
        Ok(())
    }

    /// Re-materialises the backing table and its indexes. Idempotent;
    /// after [`drop`](Self::drop) this restores the collection to its
    /// freshly constructed, empty state.
    pub async fn ensure_table(&self) -> Result<()> {
        let mut guard = self.conn.acquire().await?;
        crate::table::ensure_table(guard.conn(), &self.core.name, &self.core.schema)
            .await
            .map_err(|e| map_db_err(e, None))
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Text(s) => s.clone(),
        other => other.to_json().to_string(),
    }
}
