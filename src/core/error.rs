use thiserror::Error;

/// Error kinds surfaced by the data access core.
///
/// Every variant maps to a stable identifier through [`DacError::code`], so
/// callers on the far side of an endpoint can match on the kind without
/// depending on the Rust type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DacError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("invalid entity metadata for '{entity}': {reason}")]
    MetadataInvalid { entity: String, reason: String },

    #[error("unknown field '{field}' on '{entity}'")]
    UnknownField { entity: String, field: String },

    #[error("unsupported argument: {0}")]
    UnsupportedArgument(String),

    #[error("invalid operands for {operator}: {reason}")]
    InvalidOperands { operator: String, reason: String },

    #[error("invalid scan arity: {columns} columns, {targets} targets")]
    InvalidScanArity { columns: usize, targets: usize },

    #[error("missing audit principal for column '{0}'")]
    MissingAuditPrincipal(String),

    #[error("transaction absent")]
    TransactionAbsent,

    #[error("transaction '{0}' is closed")]
    TransactionClosed(String),

    #[error("transaction '{0}' timed out")]
    TransactionTimeout(String),

    #[error("optimistic lock failed on '{entity}'")]
    OptimisticLockFailed { entity: String },

    #[error("{operation} failed: {cause}{}", describe_location(.sql, .endpoint, .transaction))]
    DatabaseError {
        operation: String,
        cause: String,
        sql: Option<String>,
        endpoint: Option<String>,
        transaction: Option<String>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, DacError>;

fn describe_location(
    sql: &Option<String>,
    endpoint: &Option<String>,
    transaction: &Option<String>,
) -> String {
    let mut out = String::new();
    if let Some(endpoint) = endpoint {
        out.push_str(&format!(" [endpoint={}]", endpoint));
    }
    if let Some(transaction) = transaction {
        out.push_str(&format!(" [transaction={}]", transaction));
    }
    if let Some(sql) = sql {
        out.push_str(&format!(" [sql={}]", sql));
    }
    out
}

impl DacError {
    /// Stable identifier of the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "ConfigInvalid",
            Self::MetadataInvalid { .. } => "MetadataInvalid",
            Self::UnknownField { .. } => "UnknownField",
            Self::UnsupportedArgument(_) => "UnsupportedArgument",
            Self::InvalidOperands { .. } => "InvalidOperands",
            Self::InvalidScanArity { .. } => "InvalidScanArity",
            Self::MissingAuditPrincipal(_) => "MissingAuditPrincipal",
            Self::TransactionAbsent => "TransactionAbsent",
            Self::TransactionClosed(_) => "TransactionClosed",
            Self::TransactionTimeout(_) => "TransactionTimeout",
            Self::OptimisticLockFailed { .. } => "OptimisticLockFailed",
            Self::DatabaseError { .. } => "DatabaseError",
            Self::Cancelled => "Cancelled",
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::LockError(_) => "LockError",
        }
    }

    pub fn metadata(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MetadataInvalid {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    pub fn unknown_field(entity: impl Into<String>, field: impl Into<String>) -> Self {
        Self::UnknownField {
            entity: entity.into(),
            field: field.into(),
        }
    }

    pub fn invalid_operands(operator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOperands {
            operator: operator.into(),
            reason: reason.into(),
        }
    }

    /// Wraps a driver failure with the operation tag of the current layer.
    pub fn database(operation: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::DatabaseError {
            operation: operation.into(),
            cause: cause.to_string(),
            sql: None,
            endpoint: None,
            transaction: None,
        }
    }

    pub fn with_sql(mut self, statement: &str) -> Self {
        if let Self::DatabaseError { sql, .. } = &mut self {
            if sql.is_none() {
                *sql = Some(statement.to_string());
            }
        }
        self
    }

    pub fn with_endpoint(mut self, name: &str) -> Self {
        if let Self::DatabaseError { endpoint, .. } = &mut self {
            if endpoint.is_none() {
                *endpoint = Some(name.to_string());
            }
        }
        self
    }

    pub fn with_transaction(mut self, id: &str) -> Self {
        if let Self::DatabaseError { transaction, .. } = &mut self {
            if transaction.is_none() {
                *transaction = Some(id.to_string());
            }
        }
        self
    }

    /// Re-tags an error raised below the current layer. Database errors keep
    /// their original cause and gain the outer operation as a prefix; other
    /// kinds pass through untouched.
    pub fn wrap(self, operation: &str) -> Self {
        match self {
            Self::DatabaseError {
                operation: inner,
                cause,
                sql,
                endpoint,
                transaction,
            } => Self::DatabaseError {
                operation: format!("{}: {}", operation, inner),
                cause,
                sql,
                endpoint,
                transaction,
            },
            other => other,
        }
    }

    pub fn is_transaction_terminal(&self) -> bool {
        matches!(
            self,
            Self::TransactionClosed(_) | Self::TransactionTimeout(_) | Self::TransactionAbsent
        )
    }
}

impl From<serde_json::Error> for DacError {
    fn from(err: serde_json::Error) -> Self {
        Self::UnsupportedArgument(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for DacError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(DacError::TransactionAbsent.code(), "TransactionAbsent");
        assert_eq!(
            DacError::metadata("User", "bad tag").code(),
            "MetadataInvalid"
        );
        assert_eq!(
            DacError::database("query", "boom").code(),
            "DatabaseError"
        );
    }

    #[test]
    fn test_wrap_preserves_cause() {
        let err = DacError::database("execute", "duplicate key")
            .with_sql("INSERT INTO t VALUES (?)")
            .with_transaction("tx-1")
            .wrap("insert");

        match &err {
            DacError::DatabaseError {
                operation,
                cause,
                sql,
                transaction,
                ..
            } => {
                assert_eq!(operation, "insert: execute");
                assert_eq!(cause, "duplicate key");
                assert_eq!(sql.as_deref(), Some("INSERT INTO t VALUES (?)"));
                assert_eq!(transaction.as_deref(), Some("tx-1"));
            }
            other => panic!("unexpected error {other:?}"),
        }

        let text = err.to_string();
        assert!(text.contains("duplicate key"));
        assert!(text.contains("transaction=tx-1"));
    }

    #[test]
    fn test_wrap_passes_other_kinds() {
        let err = DacError::TransactionClosed("t".into()).wrap("commit");
        assert_eq!(err, DacError::TransactionClosed("t".into()));
    }
}
