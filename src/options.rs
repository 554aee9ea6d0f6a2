use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{FractalError, Result};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub(crate) fn keyword(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    pub(crate) fn reversed(&self) -> SortOrder {
        match self {
            Self::Asc => Self::Desc,
            Self::Desc => Self::Asc,
        }
    }
}

/// Substring search over a set of fields, folded into the WHERE clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub text: String,
    pub fields: Vec<String>,
    pub case_sensitive: bool,
}

/// Offset-free pagination keyed on the last-seen value of the first sort
/// key. Strict correctness requires the final sort key to be unique
/// (typically `id`); with a non-unique key, rows that tie with the cursor
/// value may be skipped or repeated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub after: Option<Value>,
    pub before: Option<Value>,
}

/// Shape of a result set: sort, pagination, projection and search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub sort: Vec<(String, SortOrder)>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
    pub select: Option<Vec<String>>,
    pub omit: Option<Vec<String>>,
    pub search: Option<SearchOptions>,
    pub cursor: Option<Cursor>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn select(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.select = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn omit(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.omit = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn search(
        mut self,
        text: impl Into<String>,
        fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.search = Some(SearchOptions {
            text: text.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            case_sensitive: false,
        });
        self
    }

    pub fn search_case_sensitive(mut self, case_sensitive: bool) -> Self {
        if let Some(search) = self.search.as_mut() {
            search.case_sensitive = case_sensitive;
        }
        self
    }

    pub fn after(mut self, value: impl Into<Value>) -> Self {
        self.cursor.get_or_insert_with(Cursor::default).after = Some(value.into());
        self
    }

    pub fn before(mut self, value: impl Into<Value>) -> Self {
        self.cursor.get_or_insert_with(Cursor::default).before = Some(value.into());
        self
    }

    /// Enforces the mutual-exclusion constraints. Called by the translator
    /// before any SQL is produced.
    pub fn validate(&self) -> Result<()> {
        if self.select.is_some() && self.omit.is_some() {
            return Err(FractalError::invalid(
                "`select` and `omit` are mutually exclusive",
            ));
        }
        if let Some(cursor) = &self.cursor {
            if self.skip.is_some() {
                return Err(FractalError::invalid(
                    "`skip` and `cursor` are mutually exclusive",
                ));
            }
            if cursor.after.is_some() && cursor.before.is_some() {
                return Err(FractalError::invalid(
                    "`cursor.after` and `cursor.before` are mutually exclusive",
                ));
            }
            if cursor.after.is_none() && cursor.before.is_none() {
                return Err(FractalError::invalid("cursor has no position"));
            }
            if self.sort.is_empty() {
                return Err(FractalError::invalid(
                    "cursor pagination requires a non-empty sort",
                ));
            }
        }
        Ok(())
    }
}

/// Whether find-and-modify returns the document as it was before the write
/// or as it is after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnDocument {
    Before,
    #[default]
    After,
}

/// Options shared by the atomic find-and-modify operations.
#[derive(Debug, Clone, Default)]
pub struct FindAndModifyOptions {
    pub sort: Vec<(String, SortOrder)>,
    pub return_document: ReturnDocument,
    /// When no document matches, build one by applying the update to a
    /// defaulted value and insert it.
    pub upsert: bool,
    pub cancel: Option<CancellationToken>,
}

impl FindAndModifyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((field.into(), order));
        self
    }

    pub fn return_document(mut self, ret: ReturnDocument) -> Self {
        self.return_document = ret;
        self
    }

    pub fn upsert(mut self, upsert: bool) -> Self {
        self.upsert = upsert;
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[derive(Debug, Clone)]
pub struct InsertManyOptions {
    /// Ordered batches abort and roll back on the first error; unordered
    /// batches accumulate per-document constraint failures and commit the
    /// rest. Defaults to ordered.
    pub ordered: bool,
    pub cancel: Option<CancellationToken>,
}

impl Default for InsertManyOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            cancel: None,
        }
    }
}

impl InsertManyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}
