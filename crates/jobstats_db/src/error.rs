//! Error types for the persistence layer.

use thiserror::Error;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors from decoding a stats blob. Never retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Structurally invalid input (wrong prefix, bad characters, corrupt stream).
    #[error("Malformed stats blob: {0}")]
    Malformed(String),

    /// Input ends before the encoded document does.
    #[error("Truncated stats blob: {0}")]
    Truncated(String),
}

impl DecodeError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn truncated(msg: impl Into<String>) -> Self {
        Self::Truncated(msg.into())
    }

    /// Machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::Truncated(_) => "truncated",
        }
    }
}

/// Errors from encoding a stats blob.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Io(#[from] std::io::Error),
}

/// Backend store errors.
///
/// `Unavailable` is transient and may be retried by the caller; the other kinds are
/// configuration or data faults.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolated(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::ConstraintViolated(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "connection_failed",
            Self::PermissionDenied(_) => "permission_denied",
            Self::ConstraintViolated(_) => "constraint_violated",
            Self::Unavailable(_) => "unavailable",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Classify an error raised while establishing a connection.
    ///
    /// Anything that is not an explicit permission fault counts as a failed
    /// connection, since no statement has run yet.
    pub(crate) fn from_connect(err: sqlx::Error) -> Self {
        match Self::from(err) {
            Self::PermissionDenied(msg) => Self::PermissionDenied(msg),
            Self::ConnectionFailed(msg)
            | Self::ConstraintViolated(msg)
            | Self::Unavailable(msg) => Self::ConnectionFailed(msg),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => classify_database_error(db.as_ref()),
            sqlx::Error::PoolTimedOut => Self::unavailable("timed out acquiring a connection"),
            sqlx::Error::PoolClosed => Self::unavailable("connection pool is closed"),
            sqlx::Error::WorkerCrashed => Self::unavailable("database worker crashed"),
            sqlx::Error::Io(e) => Self::unavailable(format!("I/O error: {}", e)),
            sqlx::Error::Protocol(msg) => Self::unavailable(format!("protocol error: {}", msg)),
            sqlx::Error::Tls(e) => Self::connection_failed(format!("TLS error: {}", e)),
            sqlx::Error::Configuration(e) => {
                Self::connection_failed(format!("invalid connection settings: {}", e))
            }
            other => Self::constraint(other.to_string()),
        }
    }
}

fn classify_database_error(db: &(dyn sqlx::error::DatabaseError + 'static)) -> StoreError {
    use sqlx::error::ErrorKind;

    let message = db.message().to_string();
    match db.kind() {
        ErrorKind::UniqueViolation
        | ErrorKind::ForeignKeyViolation
        | ErrorKind::NotNullViolation
        | ErrorKind::CheckViolation => return StoreError::ConstraintViolated(message),
        _ => {}
    }

    #[cfg(feature = "mysql")]
    if let Some(mysql) = db.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
        return match mysql.number() {
            // access denied for user / database / table / column / privilege
            1044 | 1045 | 1142 | 1143 | 1227 => StoreError::PermissionDenied(message),
            // lock wait timeout, deadlock
            1205 | 1213 => StoreError::Unavailable(message),
            _ => StoreError::ConstraintViolated(message),
        };
    }

    #[cfg(feature = "sqlite")]
    if let Some(code) = db.code().and_then(|c| c.parse::<i32>().ok()) {
        // Extended result codes carry the primary code in the low byte.
        return match code & 0xff {
            SQLITE_PERM | SQLITE_READONLY | SQLITE_AUTH => StoreError::PermissionDenied(message),
            SQLITE_BUSY | SQLITE_LOCKED => StoreError::Unavailable(message),
            _ => StoreError::ConstraintViolated(message),
        };
    }

    StoreError::ConstraintViolated(message)
}

#[cfg(feature = "sqlite")]
const SQLITE_PERM: i32 = 3;
#[cfg(feature = "sqlite")]
const SQLITE_BUSY: i32 = 5;
#[cfg(feature = "sqlite")]
const SQLITE_LOCKED: i32 = 6;
#[cfg(feature = "sqlite")]
const SQLITE_READONLY: i32 = 8;
#[cfg(feature = "sqlite")]
const SQLITE_AUTH: i32 = 23;

/// Any failure surfaced by the coordinator's entry points.
#[derive(Error, Debug)]
pub enum StatsError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StatsError {
    /// Machine-readable kind for the invoking hook to log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(e) => e.kind(),
            Self::Encode(_) => "encode_failed",
            Self::Store(e) => e.kind(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_retryable())
    }
}
