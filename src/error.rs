//! The closed business-error taxonomy shared by every component.

use thiserror::Error;

/// Stable machine-readable error code, e.g. for mapping onto HTTP status codes
/// at a layer outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    InvalidState,
    BudgetExhausted,
    PlanParse,
    CycleDetected,
    Conflict,
    AccountLink,
    Database,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::InvalidState => "INVALID_STATE",
            Self::BudgetExhausted => "BUDGET_EXHAUSTED",
            Self::PlanParse => "PLAN_PARSE",
            Self::CycleDetected => "CYCLE_DETECTED",
            Self::Conflict => "CONFLICT",
            Self::AccountLink => "ACCOUNT_LINK",
            Self::Database => "DATABASE",
        }
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct OrchError {
    pub code: ErrorCode,
    pub message: String,
}

impl OrchError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(kind: &str, reference: &str) -> Self {
        Self::new(ErrorCode::NotFound, format!("{kind} not found: {reference}"))
    }

    pub fn invalid_state(entity: &str, from: &str, to: &str) -> Self {
        Self::new(
            ErrorCode::InvalidState,
            format!("invalid transition for {entity}: {from} -> {to}"),
        )
    }

    pub fn budget_exhausted(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::BudgetExhausted, detail)
    }

    pub fn plan_parse(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::PlanParse, detail)
    }

    pub fn cycle_detected(a: &str, b: &str) -> Self {
        Self::new(
            ErrorCode::CycleDetected,
            format!("dependency cycle detected between '{a}' and '{b}'"),
        )
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, detail)
    }

    pub fn account_link(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::AccountLink, detail)
    }

    pub fn database(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::Database, detail)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.code, ErrorCode::NotFound)
    }
}

impl From<rusqlite::Error> for OrchError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => Self::not_found("row", "<query>"),
            rusqlite::Error::SqliteFailure(ref inner, _)
                if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::conflict(e.to_string())
            }
            other => Self::database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for OrchError {
    fn from(e: serde_json::Error) -> Self {
        Self::database(format!("json: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, OrchError>;
