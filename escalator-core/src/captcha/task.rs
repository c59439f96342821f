use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::Cookie;

use super::error::CaptchaError;

/// `pending -> in_progress -> solving -> {solved, unsolvable, expired}`.
/// `failed` hands the task back to the pool; it is not terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaStatus {
    Pending,
    InProgress,
    Solving,
    Solved,
    Failed,
    Expired,
    Unsolvable,
}

impl CaptchaStatus {
    pub const OPEN: [CaptchaStatus; 4] = [
        CaptchaStatus::Pending,
        CaptchaStatus::InProgress,
        CaptchaStatus::Solving,
        CaptchaStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CaptchaStatus::Pending => "pending",
            CaptchaStatus::InProgress => "in_progress",
            CaptchaStatus::Solving => "solving",
            CaptchaStatus::Solved => "solved",
            CaptchaStatus::Failed => "failed",
            CaptchaStatus::Expired => "expired",
            CaptchaStatus::Unsolvable => "unsolvable",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CaptchaStatus::Solved | CaptchaStatus::Expired | CaptchaStatus::Unsolvable
        )
    }

    /// States in which an operator holds the assignment lock.
    pub fn is_locked(&self) -> bool {
        matches!(self, CaptchaStatus::InProgress | CaptchaStatus::Solving)
    }
}

impl fmt::Display for CaptchaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaptchaStatus {
    type Err = CaptchaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "solving" => Ok(Self::Solving),
            "solved" => Ok(Self::Solved),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            "unsolvable" => Ok(Self::Unsolvable),
            other => Err(CaptchaError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolutionType {
    Cookie,
    Token,
    Session,
}

impl SolutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SolutionType::Cookie => "cookie",
            SolutionType::Token => "token",
            SolutionType::Session => "session",
        }
    }
}

impl FromStr for SolutionType {
    type Err = CaptchaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cookie" => Ok(Self::Cookie),
            "token" => Ok(Self::Token),
            "session" => Ok(Self::Session),
            other => Err(CaptchaError::InvalidSolution(format!(
                "unknown solution type {other}"
            ))),
        }
    }
}

/// What an operator hands back after passing the challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Solution {
    pub solution_type: SolutionType,
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Solution {
    pub fn cookies(cookies: Vec<Cookie>) -> Self {
        Self {
            solution_type: SolutionType::Cookie,
            cookies,
            token: None,
            user_agent: None,
        }
    }

    pub fn token(token: impl Into<String>) -> Self {
        Self {
            solution_type: SolutionType::Token,
            cookies: Vec::new(),
            token: Some(token.into()),
            user_agent: None,
        }
    }

    pub fn validate(&self) -> Result<(), CaptchaError> {
        match self.solution_type {
            SolutionType::Cookie if self.cookies.is_empty() => Err(CaptchaError::InvalidSolution(
                "cookie solution without cookies".into(),
            )),
            SolutionType::Token if self.token.as_deref().unwrap_or_default().is_empty() => Err(
                CaptchaError::InvalidSolution("token solution without token".into()),
            ),
            SolutionType::Session if self.cookies.is_empty() && self.user_agent.is_none() => {
                Err(CaptchaError::InvalidSolution(
                    "session solution needs cookies or a user agent".into(),
                ))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewCaptchaTask {
    pub url: String,
    pub domain: String,
    pub challenge_type: String,
    pub priority: Option<u8>,
    pub error_message: Option<String>,
    pub proxy_url: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptchaTask {
    pub id: i64,
    pub uuid: Uuid,
    pub url: String,
    pub domain: String,
    pub challenge_type: String,
    pub status: CaptchaStatus,
    pub priority: u8,
    pub assigned_to: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub error_message: Option<String>,
    pub proxy_url: Option<String>,
    pub user_agent: Option<String>,
    pub solution: Option<Solution>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub solved_at: Option<DateTime<Utc>>,
}

impl CaptchaTask {
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_locked()
            && self.assigned_to.is_some()
            && self.lock_expires_at.map(|expiry| expiry > now).unwrap_or(false)
    }
}
