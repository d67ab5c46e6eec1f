//! Error and issue types shared by every component.
//!
//! Two layers:
//! - [`HealthIssue`]: a recoverable problem the kernel already healed (or could
//!   not heal) on its own. Returned next to values instead of raised.
//! - [`AppError`]: a surfaced failure with a stable code, user-facing message
//!   and retry hint, produced only by user-triggered actions (login, manual
//!   migration, tooling).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::kv::KvError;
use crate::remote::RemoteError;
use crate::session::SessionError;

/// Kind of recoverable problem found while reading or writing storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Stored text is not JSON, or not the expected collection shape
    Parse,
    /// Legacy `{ data: ... }` envelope found and rewritten raw
    Envelope,
    /// Duplicate item ids dropped
    Duplicate,
    /// Key absent or empty where data was expected
    Missing,
    /// Write appeared to succeed but the read-back disagrees
    WriteVerification,
    /// Storage backend refused a read or write
    Storage,
    /// Canonical store call failed
    Remote,
    /// Mode flag holds an unknown value
    InvalidMode,
    UnknownCategory,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Parse => "parse",
            Self::Envelope => "envelope",
            Self::Duplicate => "duplicate",
            Self::Missing => "missing",
            Self::WriteVerification => "write_verification",
            Self::Storage => "storage",
            Self::Remote => "remote",
            Self::InvalidMode => "invalid_mode",
            Self::UnknownCategory => "unknown_category",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthIssue {
    pub kind: IssueKind,
    pub key: String,
    pub message: String,
}

impl HealthIssue {
    pub fn new(kind: IssueKind, key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for HealthIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.key, self.message)
    }
}

/// A value produced after self-healing, with the issues that were healed.
#[derive(Debug, Clone, PartialEq)]
pub struct Healed<T> {
    pub value: T,
    pub issues: Vec<HealthIssue>,
}

impl<T> Healed<T> {
    pub fn new(value: T, issues: Vec<HealthIssue>) -> Self {
        Self { value, issues }
    }

    pub fn clean(value: T) -> Self {
        Self {
            value,
            issues: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

/// Error categories for grouping and UI display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Validation,
    Storage,
    Remote,
    Session,
    Migration,
    Config,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Storage => write!(f, "storage"),
            Self::Remote => write!(f, "remote"),
            Self::Session => write!(f, "session"),
            Self::Migration => write!(f, "migration"),
            Self::Config => write!(f, "config"),
        }
    }
}

/// Stable error codes. Format: CATEGORY_SPECIFIC_ERROR
pub struct ErrorCode;

impl ErrorCode {
    pub const VALIDATION_UNKNOWN_CATEGORY: &'static str = "VALIDATION_UNKNOWN_CATEGORY";
    pub const VALIDATION_INVALID_CREDENTIALS: &'static str = "VALIDATION_INVALID_CREDENTIALS";

    pub const STORAGE_IO_FAILED: &'static str = "STORAGE_IO_FAILED";
    pub const STORAGE_CORRUPT: &'static str = "STORAGE_CORRUPT";

    pub const REMOTE_NETWORK: &'static str = "REMOTE_NETWORK";
    pub const REMOTE_UNAUTHORIZED: &'static str = "REMOTE_UNAUTHORIZED";
    pub const REMOTE_NOT_FOUND: &'static str = "REMOTE_NOT_FOUND";
    pub const REMOTE_REJECTED: &'static str = "REMOTE_REJECTED";

    pub const SESSION_AUTH_FAILED: &'static str = "SESSION_AUTH_FAILED";
    pub const SESSION_LOGIN_IN_PROGRESS: &'static str = "SESSION_LOGIN_IN_PROGRESS";
    pub const SESSION_EXPIRED: &'static str = "SESSION_EXPIRED";

    pub const MIGRATION_FAILED: &'static str = "MIGRATION_FAILED";
    pub const MIGRATION_IN_PROGRESS: &'static str = "MIGRATION_IN_PROGRESS";

    pub const CONFIG_INVALID: &'static str = "CONFIG_INVALID";
}

/// Surfaced error for user-triggered actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Stable error code for frontend handling
    pub code: String,
    /// User-friendly error message
    pub message: String,
    /// Internal details for logging (not shown to user)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub retryable: bool,
    pub category: ErrorCategory,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
            retryable: false,
            category,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn unknown_category(name: &str) -> Self {
        Self::new(
            ErrorCode::VALIDATION_UNKNOWN_CATEGORY,
            format!("Unknown master-data category: {name}"),
            ErrorCategory::Validation,
        )
    }

    pub fn migration_failed(detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::MIGRATION_FAILED,
            "Master data could not be migrated",
            ErrorCategory::Migration,
        )
        .with_detail(detail)
        .retryable()
    }

    pub fn migration_in_progress() -> Self {
        Self::new(
            ErrorCode::MIGRATION_IN_PROGRESS,
            "A migration is already running",
            ErrorCategory::Migration,
        )
        .retryable()
    }

    pub fn session_expired() -> Self {
        Self::new(
            ErrorCode::SESSION_EXPIRED,
            "Your session has expired, please log in again",
            ErrorCategory::Session,
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl From<KvError> for AppError {
    fn from(e: KvError) -> Self {
        match e {
            KvError::Corrupt(_) => Self::new(
                ErrorCode::STORAGE_CORRUPT,
                "Local storage is corrupt",
                ErrorCategory::Storage,
            )
            .with_detail(e.to_string()),
            KvError::Io(_) | KvError::Serialization(_) => Self::new(
                ErrorCode::STORAGE_IO_FAILED,
                "Local storage operation failed",
                ErrorCategory::Storage,
            )
            .with_detail(e.to_string()),
        }
    }
}

impl From<RemoteError> for AppError {
    fn from(e: RemoteError) -> Self {
        match &e {
            RemoteError::Network(_) => Self::new(
                ErrorCode::REMOTE_NETWORK,
                "Could not reach the data service",
                ErrorCategory::Remote,
            )
            .with_detail(e.to_string())
            .retryable(),
            RemoteError::Unauthorized(_) => Self::new(
                ErrorCode::REMOTE_UNAUTHORIZED,
                "Not authorized by the data service",
                ErrorCategory::Remote,
            )
            .with_detail(e.to_string()),
            RemoteError::UnknownTable(_) | RemoteError::RowNotFound { .. } => Self::new(
                ErrorCode::REMOTE_NOT_FOUND,
                "Requested data was not found",
                ErrorCategory::Remote,
            )
            .with_detail(e.to_string()),
            RemoteError::Rejected(_) | RemoteError::Backend(_) => Self::new(
                ErrorCode::REMOTE_REJECTED,
                "The data service rejected the request",
                ErrorCategory::Remote,
            )
            .with_detail(e.to_string()),
        }
    }
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::InvalidCredentials(msg) => Self::new(
                ErrorCode::VALIDATION_INVALID_CREDENTIALS,
                msg,
                ErrorCategory::Validation,
            ),
            SessionError::LoginInProgress => Self::new(
                ErrorCode::SESSION_LOGIN_IN_PROGRESS,
                "A login is already in progress",
                ErrorCategory::Session,
            )
            .retryable(),
            SessionError::AuthFailed(remote) => Self::new(
                ErrorCode::SESSION_AUTH_FAILED,
                "Login failed, check your email and password",
                ErrorCategory::Session,
            )
            .with_detail(remote.to_string())
            .retryable(),
            SessionError::Storage(kv) => kv.into(),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        Self::new(
            ErrorCode::CONFIG_INVALID,
            "Configuration is invalid",
            ErrorCategory::Config,
        )
        .with_detail(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serialization() -> Result<(), serde_json::Error> {
        let err = AppError::unknown_category("planets");
        let json = serde_json::to_string(&err)?;
        assert!(json.contains("VALIDATION_UNKNOWN_CATEGORY"));
        assert!(json.contains("validation"));
        assert!(!json.contains("detail"));
        Ok(())
    }

    #[test]
    fn test_remote_network_is_retryable() {
        let err: AppError = RemoteError::Network("timeout".into()).into();
        assert_eq!(err.code, ErrorCode::REMOTE_NETWORK);
        assert!(err.retryable);

        let err: AppError = RemoteError::Unauthorized("jwt expired".into()).into();
        assert!(!err.retryable);
    }

    #[test]
    fn test_session_error_mapping() {
        let err: AppError = SessionError::AuthFailed(RemoteError::Unauthorized("bad".into())).into();
        assert_eq!(err.code, ErrorCode::SESSION_AUTH_FAILED);
        assert_eq!(err.category, ErrorCategory::Session);
        assert!(err.detail.is_some());
    }

    #[test]
    fn test_issue_display() {
        let issue = HealthIssue::new(IssueKind::Parse, "master_data_countries", "not JSON");
        assert_eq!(
            issue.to_string(),
            "[parse] master_data_countries: not JSON"
        );
    }
}
