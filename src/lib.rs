//! # FractalDB
//!
//! A typed, embedded, document-oriented database engine layered over
//! SQLite. Documents are user-defined records stored as binary JSON,
//! addressed by a time-sortable identifier and queried through a structured
//! algebra that compiles to parameterised SQL.
//!
//! ```no_run
//! use fractaldb::{Database, DatabaseOptions, FieldDef, Schema, SqlType};
//! use fractaldb::query::gt;
//! use fractaldb::QueryOptions;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct User {
//!     name: String,
//!     age: i64,
//! }
//!
//! # async fn example() -> Result<(), fractaldb::FractalError> {
//! let db = Database::in_memory(DatabaseOptions::default()).await?;
//! let schema = Schema::builder()
//!     .field(FieldDef::new("age", SqlType::Integer).indexed())
//!     .build()?;
//! let users = db.collection::<User>("users", schema).await?;
//!
//! users.insert_one(User { name: "Alice".into(), age: 30 }).await?;
//! let adults = users
//!     .find(&gt("age", 17), &QueryOptions::new())
//!     .await?;
//! # let _ = adults;
//! # Ok(())
//! # }
//! ```

mod codec;
mod collection;
mod conn;
mod database;
mod document;
mod error;
mod id;
mod options;
pub mod query;
mod retry;
mod schema;
mod sql;
mod table;
mod transaction;
mod value;

pub use collection::{
    Collection, DeleteResult, InsertManyError, InsertManyResult, UpdateResult,
};
pub use database::{CollectionOptions, Database, DatabaseOptions};
pub use document::Document;
pub use error::{ErrorCategory, FractalError, Result};
pub use id::IdFactory;
pub use options::{
    Cursor, FindAndModifyOptions, InsertManyOptions, QueryOptions, ReturnDocument, SearchOptions,
    SortOrder,
};
pub use query::translate::TranslatorResult;
pub use query::Query;
pub use retry::{RetryPolicy, RetryPredicate};
pub use schema::{CompoundIndex, FieldDef, Schema, SchemaBuilder, SqlType, Validator};
pub use transaction::Txn;
pub use value::Value;
