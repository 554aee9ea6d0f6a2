use thiserror::Error;

pub type Result<T, E = FractalError> = std::result::Result<T, E>;

/// Error surface of the whole engine.
///
/// Every variant carries enough context to be handled programmatically;
/// [`FractalError::category`] gives the coarse routing tag used for metrics
/// and log filtering.
#[derive(Debug, Error)]
pub enum FractalError {
    /// Input violates the schema or an invariant of the operation.
    #[error("validation failed{}: {message}", fmt_field(.field))]
    Validation {
        field: Option<String>,
        message: String,
    },

    /// A unique index rejected an insert or update.
    #[error("unique constraint violated on field `{field}` (value `{value}`)")]
    UniqueConstraint { field: String, value: String },

    /// An operation that required a document by id did not find one.
    #[error("document with id `{id}` not found")]
    NotFound { id: String },

    /// Translator or backend query failure.
    #[error("query failed: {message}")]
    Query {
        sql: Option<String>,
        message: String,
    },

    /// The backend is unreachable or the database has been closed.
    #[error("connection error: {message}")]
    Connection { message: String },

    /// Failure while setting up, committing or rolling back a transaction.
    #[error("transaction failed during {step}: {message}")]
    Transaction { step: String, message: String },

    /// The codec failed in either direction.
    #[error("serialization failed{}: {message}", fmt_field(.field))]
    Serialization {
        field: Option<String>,
        message: String,
    },

    /// API misuse: use after close, mutually exclusive options, wrong type.
    #[error("invalid operation: {message}")]
    InvalidOperation { message: String },

    /// The operation observed a cancellation request.
    #[error("operation aborted: {reason}")]
    Aborted { reason: String },
}

/// Coarse tag for metrics and log routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Validation,
    Database,
    Query,
    Transaction,
    Serialization,
    Operation,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Database => "database",
            Self::Query => "query",
            Self::Transaction => "transaction",
            Self::Serialization => "serialization",
            Self::Operation => "operation",
        }
    }
}

impl FractalError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::UniqueConstraint { .. } | Self::Connection { .. } => ErrorCategory::Database,
            Self::Query { .. } | Self::NotFound { .. } => ErrorCategory::Query,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Serialization { .. } => ErrorCategory::Serialization,
            Self::InvalidOperation { .. } | Self::Aborted { .. } => ErrorCategory::Operation,
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            field: None,
            message: message.into(),
        }
    }

    pub(crate) fn query(message: impl Into<String>) -> Self {
        Self::Query {
            sql: None,
            message: message.into(),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    pub(crate) fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }
}

fn fmt_field(field: &Option<String>) -> String {
    match field {
        Some(f) => format!(" on field `{}`", f),
        None => String::new(),
    }
}

/// Maps a driver error into the engine taxonomy. Unique violations are
/// recognised here; the violated column is recovered from the driver
/// message (`UNIQUE constraint failed: <table>.<column>`).
pub(crate) fn map_db_err(err: sqlx::Error, sql: Option<&str>) -> FractalError {
    match &err {
        sqlx::Error::Database(db_err) => {
            if matches!(db_err.kind(), sqlx::error::ErrorKind::UniqueViolation) {
                let column = parse_unique_column(db_err.message()).unwrap_or_default();
                let field = logical_field_name(&column);
                return FractalError::UniqueConstraint {
                    field,
                    value: String::new(),
                };
            }
            FractalError::Query {
                sql: sql.map(str::to_owned),
                message: db_err.message().to_owned(),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            FractalError::Connection {
                message: err.to_string(),
            }
        }
        sqlx::Error::RowNotFound => FractalError::Query {
            sql: sql.map(str::to_owned),
            message: "no rows returned".into(),
        },
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => FractalError::Serialization {
            field: None,
            message: err.to_string(),
        },
        _ => FractalError::Query {
            sql: sql.map(str::to_owned),
            message: err.to_string(),
        },
    }
}

/// `UNIQUE constraint failed: users._email` -> `_email`
fn parse_unique_column(message: &str) -> Option<String> {
    let tail = message.rsplit(':').next()?.trim();
    let column = tail.split(',').next()?.trim();
    Some(column.rsplit('.').next()?.trim().to_owned())
}

/// Generated columns shadow logical fields with a leading underscore; the
/// metadata id column is reported verbatim.
pub(crate) fn logical_field_name(column: &str) -> String {
    if column == "_id" {
        return column.to_owned();
    }
    column.strip_prefix('_').unwrap_or(column).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_column_is_parsed_from_driver_message() {
        assert_eq!(
            parse_unique_column("UNIQUE constraint failed: users._email").as_deref(),
            Some("_email")
        );
        assert_eq!(
            parse_unique_column("UNIQUE constraint failed: users._id").as_deref(),
            Some("_id")
        );
    }

    #[test]
    fn generated_column_maps_back_to_logical_field() {
        assert_eq!(logical_field_name("_email"), "email");
        assert_eq!(logical_field_name("_id"), "_id");
        assert_eq!(logical_field_name("created_at"), "created_at");
    }

    #[test]
    fn categories_route_as_documented() {
        let err = FractalError::UniqueConstraint {
            field: "email".into(),
            value: "a@b".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Database);
        assert_eq!(err.category().as_str(), "database");

        let err = FractalError::NotFound { id: "x".into() };
        assert_eq!(err.category(), ErrorCategory::Query);

        let err = FractalError::aborted("cancelled");
        assert_eq!(err.category(), ErrorCategory::Operation);
    }
}
