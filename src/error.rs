// Error types for the donation ledger
// Every core operation returns LedgerResult; binaries wrap it in anyhow

use std::fmt;
use thiserror::Error;

pub type LedgerResult<T> = Result<T, LedgerError>;

/// An invariant the store refused to break.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// The target cow group already holds its full complement of shares
    GroupFull { group_id: i64 },

    /// The donation already belongs to a cow group
    DuplicateShare { donation_id: i64 },

    /// Any other constraint reported by SQLite (check, foreign key, unique)
    Other(String),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::GroupFull { group_id } => write!(f, "cow group {} is full", group_id),
            Violation::DuplicateShare { donation_id } => {
                write!(f, "donation {} already belongs to a cow group", donation_id)
            }
            Violation::Other(msg) => write!(f, "{}", msg),
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(Violation),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("store temporarily unavailable: {0}")]
    TransientStore(String),

    #[error("store error: {0}")]
    Store(rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        LedgerError::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: i64) -> Self {
        LedgerError::NotFound { entity, id }
    }

    /// HTTP status equivalent, kept numeric so the core stays free of web types
    pub fn status_code(&self) -> u16 {
        match self {
            LedgerError::Validation(_) => 400,
            LedgerError::NotFound { .. } => 404,
            LedgerError::ConstraintViolation(_) => 409,
            LedgerError::TransientStore(_) => 503,
            LedgerError::Store(_) | LedgerError::Serialization(_) => 500,
        }
    }

    pub fn is_group_full(&self) -> bool {
        matches!(
            self,
            LedgerError::ConstraintViolation(Violation::GroupFull { .. })
        )
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, msg) => match failure.code {
                rusqlite::ErrorCode::ConstraintViolation => {
                    let detail = msg.clone().unwrap_or_else(|| failure.to_string());
                    LedgerError::ConstraintViolation(Violation::Other(detail))
                }
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    LedgerError::TransientStore(err.to_string())
                }
                _ => LedgerError::Store(err),
            },
            _ => LedgerError::Store(err),
        }
    }
}

/// True when SQLite refused a row for breaking a constraint (key, check,
/// foreign key, or a RAISE() from a trigger)
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
