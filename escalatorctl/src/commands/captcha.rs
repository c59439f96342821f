use std::time::Duration;

use chrono::Utc;
use clap::{Args, Subcommand};
use escalator_core::{
    CaptchaEvent, CaptchaStatus, CaptchaTask, Cookie, Session, Solution, TaskFilter,
};
use serde::Serialize;

use crate::{render, AppContext, AppError, DisplayFallback, OutputFormat, Result};

#[derive(Subcommand, Debug)]
pub enum CaptchaCommands {
    /// List tasks, highest priority first
    List(CaptchaListArgs),
    /// Show one task
    Show(CaptchaTaskArgs),
    /// Lock a task for an operator
    Assign(CaptchaAssignArgs),
    /// Mark an assigned task as being solved
    Solving(CaptchaOperatorArgs),
    /// Submit the cookies or token that passed the challenge
    Solve(CaptchaSolveArgs),
    /// Record a failed try; the task stays open
    Fail(CaptchaReasonArgs),
    /// Close a task that cannot be solved
    Unsolvable(CaptchaReasonArgs),
    /// Expire tasks past their deadline or lock
    Expire,
    /// Recent task and session events
    Events(CaptchaEventsArgs),
    /// Block until a session for the domain is cached
    Wait(CaptchaWaitArgs),
}

#[derive(Args, Debug)]
pub struct CaptchaListArgs {
    /// Filter by status (pending, in_progress, solving, solved, failed, unsolvable, expired)
    #[arg(long)]
    pub status: Option<String>,
    /// Filter by domain
    #[arg(long)]
    pub domain: Option<String>,
    /// Only unassigned pending tasks
    #[arg(long, default_value_t = false)]
    pub pending: bool,
    /// Maximum rows returned
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

impl CaptchaListArgs {
    fn filter(&self) -> Result<TaskFilter> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<CaptchaStatus>)
            .transpose()?;
        Ok(TaskFilter {
            status,
            domain: self.domain.clone(),
            limit: Some(self.limit),
        })
    }
}

#[derive(Args, Debug)]
pub struct CaptchaTaskArgs {
    pub uuid: uuid::Uuid,
}

#[derive(Args, Debug)]
pub struct CaptchaAssignArgs {
    pub uuid: uuid::Uuid,
    /// Operator taking the task
    #[arg(long)]
    pub operator: String,
    /// Lock duration; defaults to captcha.lock_ttl_seconds
    #[arg(long)]
    pub lock_seconds: Option<u64>,
}

#[derive(Args, Debug)]
pub struct CaptchaOperatorArgs {
    pub uuid: uuid::Uuid,
    /// Operator holding the lock
    #[arg(long)]
    pub operator: String,
}

#[derive(Args, Debug)]
pub struct CaptchaSolveArgs {
    pub uuid: uuid::Uuid,
    /// Cookie as NAME=VALUE; repeat for several
    #[arg(long = "cookie", value_name = "NAME=VALUE")]
    pub cookies: Vec<String>,
    /// Cookie domain; defaults to the task domain
    #[arg(long)]
    pub cookie_domain: Option<String>,
    /// Token solution
    #[arg(long)]
    pub token: Option<String>,
    /// User agent the challenge was passed with
    #[arg(long)]
    pub user_agent: Option<String>,
    /// Session lifetime; defaults to session.ttl_seconds
    #[arg(long)]
    pub ttl_seconds: Option<i64>,
}

impl CaptchaSolveArgs {
    pub fn solution(&self) -> Result<Solution> {
        let domain = self.cookie_domain.clone().unwrap_or_default();
        let cookies = self
            .cookies
            .iter()
            .map(|raw| parse_cookie(raw, &domain))
            .collect::<Result<Vec<_>>>()?;
        let mut solution = match &self.token {
            Some(token) if cookies.is_empty() => Solution::token(token.clone()),
            token => {
                let mut solution = Solution::cookies(cookies);
                solution.token = token.clone();
                solution
            }
        };
        solution.user_agent = self.user_agent.clone();
        solution.validate()?;
        Ok(solution)
    }
}

fn parse_cookie(raw: &str, domain: &str) -> Result<Cookie> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| AppError::InvalidArgument(format!("cookie without '=': {raw}")))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::InvalidArgument(format!("empty cookie name: {raw}")));
    }
    Ok(Cookie::new(name, value.trim(), domain))
}

#[derive(Args, Debug)]
pub struct CaptchaReasonArgs {
    pub uuid: uuid::Uuid,
    #[arg(long)]
    pub reason: String,
}

#[derive(Args, Debug)]
pub struct CaptchaEventsArgs {
    #[arg(long)]
    pub domain: Option<String>,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct CaptchaWaitArgs {
    pub domain: String,
    /// Seconds to wait; defaults to captcha.wait_timeout_seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct TaskList {
    pub rows: Vec<CaptchaTask>,
}

#[derive(Debug, Serialize)]
pub struct EventList {
    pub rows: Vec<CaptchaEvent>,
}

#[derive(Debug, Serialize)]
pub struct WaitOutcome {
    pub domain: String,
    pub session: Option<Session>,
}

pub(crate) async fn run(
    context: &AppContext,
    command: &CaptchaCommands,
    format: OutputFormat,
) -> Result<()> {
    let coordinator = context.coordinator()?;
    match command {
        CaptchaCommands::List(args) => {
            let rows = if args.pending {
                coordinator.list_pending(args.limit).await?
            } else {
                coordinator.list(args.filter()?).await?
            };
            render(&TaskList { rows }, format)
        }
        CaptchaCommands::Show(args) => {
            let task = coordinator
                .get(args.uuid)
                .await?
                .ok_or_else(|| AppError::MissingResource(format!("captcha task {}", args.uuid)))?;
            render(&task, format)
        }
        CaptchaCommands::Assign(args) => {
            let lock = args.lock_seconds.map(Duration::from_secs);
            let task = coordinator.assign(args.uuid, &args.operator, lock).await?;
            render(&task, format)
        }
        CaptchaCommands::Solving(args) => {
            let task = coordinator.start_solving(args.uuid, &args.operator).await?;
            render(&task, format)
        }
        CaptchaCommands::Solve(args) => {
            let expiry = args
                .ttl_seconds
                .map(|seconds| Utc::now() + chrono::Duration::seconds(seconds));
            let task = coordinator
                .submit_solution(args.uuid, args.solution()?, expiry)
                .await?;
            render(&task, format)
        }
        CaptchaCommands::Fail(args) => {
            let task = coordinator.mark_failed(args.uuid, &args.reason).await?;
            render(&task, format)
        }
        CaptchaCommands::Unsolvable(args) => {
            let task = coordinator.mark_unsolvable(args.uuid, &args.reason).await?;
            render(&task, format)
        }
        CaptchaCommands::Expire => {
            let rows = coordinator.expire_stale().await?;
            render(&TaskList { rows }, format)
        }
        CaptchaCommands::Events(args) => {
            let feed = context.event_feed(coordinator.store().clone());
            let rows = feed.recent(args.domain.as_deref(), args.limit)?;
            render(&EventList { rows }, format)
        }
        CaptchaCommands::Wait(args) => {
            let timeout = args
                .timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| context.config.captcha.wait_timeout());
            let session = coordinator
                .wait_for_solution(&args.domain, timeout)
                .await?;
            render(
                &WaitOutcome {
                    domain: args.domain.clone(),
                    session,
                },
                format,
            )
        }
    }
}

impl DisplayFallback for CaptchaTask {
    fn display(&self) -> String {
        let mut line = format!(
            "{uuid} [{status}] {domain} p={priority} tries={attempts} {challenge}",
            uuid = self.uuid,
            status = self.status,
            domain = self.domain,
            priority = self.priority,
            attempts = self.attempts,
            challenge = self.challenge_type,
        );
        if let Some(operator) = &self.assigned_to {
            line.push_str(&format!(" assigned={operator}"));
        }
        if let Some(reason) = &self.error_message {
            line.push_str(&format!(" error={reason:?}"));
        }
        line
    }
}

impl DisplayFallback for TaskList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No captcha tasks".to_string();
        }
        self.rows
            .iter()
            .map(DisplayFallback::display)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for EventList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No events".to_string();
        }
        self.rows
            .iter()
            .map(|event| {
                format!(
                    "{ts} {kind:<16} {domain} {uuid}",
                    ts = event.timestamp.to_rfc3339(),
                    kind = event.event_type.as_str(),
                    domain = event.domain,
                    uuid = event
                        .uuid
                        .map(|uuid| uuid.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for WaitOutcome {
    fn display(&self) -> String {
        match &self.session {
            Some(session) => format!(
                "session ready for {} ({} cookies, expires {})",
                session.domain,
                session.cookies.len(),
                session.expires_at.to_rfc3339()
            ),
            None => format!("no session for {} before the timeout", self.domain),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use escalator_core::SolutionType;

    fn solve_args(cookies: &[&str], token: Option<&str>) -> CaptchaSolveArgs {
        CaptchaSolveArgs {
            uuid: uuid::Uuid::new_v4(),
            cookies: cookies.iter().map(|cookie| cookie.to_string()).collect(),
            cookie_domain: None,
            token: token.map(str::to_string),
            user_agent: None,
            ttl_seconds: None,
        }
    }

    #[test]
    fn token_only_builds_a_token_solution() {
        let solution = solve_args(&[], Some("abc")).solution().unwrap();
        assert_eq!(solution.solution_type, SolutionType::Token);
        assert_eq!(solution.token.as_deref(), Some("abc"));
    }

    #[test]
    fn cookies_leave_domain_for_the_task() {
        let solution = solve_args(&["cf_clearance=X"], None).solution().unwrap();
        assert_eq!(solution.solution_type, SolutionType::Cookie);
        assert_eq!(solution.cookies[0].domain, "");
    }

    #[test]
    fn empty_solution_is_rejected() {
        assert!(solve_args(&[], None).solution().is_err());
        assert!(solve_args(&["broken"], None).solution().is_err());
    }

    #[test]
    fn list_filter_parses_status() {
        let args = CaptchaListArgs {
            status: Some("in_progress".into()),
            domain: None,
            pending: false,
            limit: 5,
        };
        let filter = args.filter().unwrap();
        assert_eq!(filter.status, Some(CaptchaStatus::InProgress));
        assert_eq!(filter.limit, Some(5));
    }
}
