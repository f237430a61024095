//! Error types for the pooled execution engine.
//!
//! This module defines all error types using `thiserror`. The variants follow
//! the failure classes the engine distinguishes: transient disconnects that
//! are retried once, statement failures that are propagated, and misuse of a
//! context (reuse, use after release) that indicates a caller bug.

use thiserror::Error;

/// Message fragments that identify a lost connection.
///
/// Matched case-insensitively against the full error text.
const DISCONNECT_SIGNATURES: &[&str] = &[
    "server has gone away",
    "no connection to the server",
    "lost connection",
    "is dead or not enabled",
    "error while sending",
    "decryption failed or bad record mac",
    "server closed the connection unexpectedly",
    "ssl connection has been closed unexpectedly",
    "error writing data to the connection",
    "resource deadlock avoided",
    "broken pipe",
    "connection reset",
    "reset by peer",
    "physical connection is not usable",
    "packets out of order",
    "communication link failure",
    "connection timed out",
    "ssl: connection timed out",
    "unexpected eof",
    "bad record mac",
    "tls handshake eof",
];

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Connection lost: {message}")]
    Disconnected { message: String },

    #[error("Statement error: {message}")]
    Statement {
        message: String,
        /// e.g., "42S02" for unknown table
        sql_state: Option<String>,
        sql: Option<String>,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Connection context already executed: {sql}")]
    Reuse { sql: String },

    #[error("Connection context has released its driver: {operation}")]
    Released { operation: String },

    #[error("Transaction error: {message} (scope: {scope})")]
    Transaction { message: String, scope: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a lost-connection error.
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::Disconnected {
            message: message.into(),
        }
    }

    /// Create a statement error with optional SQL state.
    pub fn statement(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Statement {
            message: message.into(),
            sql_state,
            sql: None,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    pub fn reuse(sql: impl Into<String>) -> Self {
        Self::Reuse { sql: sql.into() }
    }

    pub fn released(operation: impl Into<String>) -> Self {
        Self::Released {
            operation: operation.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, scope: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            scope: scope.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Attach the failing SQL text to a statement error.
    pub fn with_sql(mut self, text: &str) -> Self {
        if let Self::Statement { sql, .. } = &mut self {
            *sql = Some(text.to_string());
        }
        self
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check whether this error means the underlying connection was lost.
    ///
    /// Statement errors count too: MySQL reports some disconnects (2006, 2013)
    /// as ordinary server errors.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Disconnected { .. } => true,
            Self::Statement { message, .. } | Self::Connection { message, .. } => {
                is_disconnect_message(message)
            }
            _ => false,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Disconnected { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }
}

/// Check a raw driver message against the known disconnect signatures.
pub fn is_disconnect_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    DISCONNECT_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let message = db_err.message().to_string();
                if is_disconnect_message(&message) {
                    DbError::disconnected(message)
                } else {
                    DbError::statement(message, code)
                }
            }
            sqlx::Error::RowNotFound => DbError::statement("No rows returned", None),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection acquire", 0),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::disconnected(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => {
                let message = format!("TLS error: {}", tls_err);
                if is_disconnect_message(&message) {
                    DbError::disconnected(message)
                } else {
                    DbError::connection(message, "Verify TLS configuration and certificates")
                }
            }
            sqlx::Error::Protocol(msg) => {
                let message = format!("Protocol error: {}", msg);
                if is_disconnect_message(&message) {
                    DbError::disconnected(message)
                } else {
                    DbError::statement(message, None)
                }
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::statement(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::disconnected("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::internal(format!("JSON error: {}", err))
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("pool borrow", 3).is_retryable());
        assert!(DbError::disconnected("gone").is_retryable());
        assert!(!DbError::reuse("SELECT 1").is_retryable());
    }

    #[test]
    fn test_disconnect_signatures() {
        assert!(DbError::disconnected("anything").is_disconnect());
        assert!(DbError::statement("MySQL server has gone away", Some("HY000".into())).is_disconnect());
        assert!(DbError::statement("Broken pipe (os error 32)", None).is_disconnect());
        assert!(!DbError::statement("Duplicate entry '1' for key 'PRIMARY'", None).is_disconnect());
        assert!(!DbError::timeout("pool borrow", 3).is_disconnect());
    }

    #[test]
    fn test_with_sql_only_touches_statement_errors() {
        let err = DbError::statement("syntax", None).with_sql("SELEC 1");
        assert!(matches!(err, DbError::Statement { sql: Some(ref s), .. } if s == "SELEC 1"));

        let err = DbError::timeout("op", 1).with_sql("SELECT 1");
        assert!(matches!(err, DbError::Timeout { .. }));
    }

    #[test]
    fn test_connection_suggestion() {
        let err = DbError::connection("refused", "Check that the server is running");
        assert_eq!(err.suggestion(), Some("Check that the server is running"));
        assert_eq!(DbError::internal("x").suggestion(), None);
    }
}
