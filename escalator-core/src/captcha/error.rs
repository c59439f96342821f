use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::session::SessionError;

use super::task::CaptchaStatus;

pub type CaptchaResult<T> = Result<T, CaptchaError>;

#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("failed to open captcha database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on captcha database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("captcha store path not configured")]
    MissingStore,
    #[error("captcha task not found: {0}")]
    NotFound(Uuid),
    #[error("captcha task {uuid} is locked by {assigned_to}")]
    Conflict { uuid: Uuid, assigned_to: String },
    #[error("captcha task {uuid} cannot move from {from} to {to}")]
    InvalidTransition {
        uuid: Uuid,
        from: CaptchaStatus,
        to: CaptchaStatus,
    },
    #[error("invalid captcha status: {0}")]
    InvalidStatus(String),
    #[error("invalid task uuid: {0}")]
    InvalidUuid(String),
    #[error("invalid solution: {0}")]
    InvalidSolution(String),
    #[error("failed to encode captcha payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("session cache error: {0}")]
    Session(#[from] SessionError),
    #[error("captcha task join error: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for CaptchaError {
    fn from(err: tokio::task::JoinError) -> Self {
        CaptchaError::Join(err.to_string())
    }
}

impl CaptchaError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, CaptchaError::Conflict { .. })
    }
}
