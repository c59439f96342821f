use chrono::Utc;
use clap::{Args, Subcommand};
use escalator_core::{normalize_domain, Session, SessionCache};
use serde::Serialize;

use crate::{render, AppContext, AppError, DisplayFallback, OutputFormat, Result};

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// Show the cached session for a domain, expired or not
    Show(SessionDomainArgs),
    /// List every stored session
    List,
    /// Drop the session for a domain
    Clear(SessionDomainArgs),
    /// Delete expired sessions
    Purge,
}

#[derive(Args, Debug)]
pub struct SessionDomainArgs {
    pub domain: String,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub valid: bool,
    pub remaining_s: u64,
    #[serde(flatten)]
    pub session: Session,
}

impl SessionView {
    fn new(session: Session) -> Self {
        let now = Utc::now();
        Self {
            valid: session.is_valid_at(now),
            remaining_s: session.remaining(now).as_secs(),
            session,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub rows: Vec<SessionView>,
}

#[derive(Debug, Serialize)]
pub struct SessionChange {
    pub action: &'static str,
    pub domain: Option<String>,
    pub affected: usize,
}

pub(crate) async fn run(
    context: &AppContext,
    command: &SessionCommands,
    format: OutputFormat,
) -> Result<()> {
    let store = context.session_store()?;
    match command {
        SessionCommands::Show(args) => {
            let session = store.load(&args.domain)?.ok_or_else(|| {
                AppError::MissingResource(format!("no session for {}", args.domain))
            })?;
            render(&SessionView::new(session), format)
        }
        SessionCommands::List => {
            let rows = store.list()?.into_iter().map(SessionView::new).collect();
            render(&SessionList { rows }, format)
        }
        SessionCommands::Clear(args) => {
            let removed = store.invalidate(&args.domain).await?;
            render(
                &SessionChange {
                    action: "clear",
                    domain: Some(normalize_domain(&args.domain)),
                    affected: usize::from(removed),
                },
                format,
            )
        }
        SessionCommands::Purge => {
            let purged = store.purge_expired(Utc::now()).await?;
            render(
                &SessionChange {
                    action: "purge",
                    domain: None,
                    affected: purged,
                },
                format,
            )
        }
    }
}

impl DisplayFallback for SessionView {
    fn display(&self) -> String {
        let cookies = self
            .session
            .cookies
            .iter()
            .map(|cookie| cookie.name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{domain} [{state}] source={source} ttl={remaining}s cookies={cookies}{token}",
            domain = self.session.domain,
            state = if self.valid { "valid" } else { "expired" },
            source = self.session.source.as_str(),
            remaining = self.remaining_s,
            cookies = if cookies.is_empty() { "-" } else { cookies.as_str() },
            token = if self.session.token.is_some() { " token" } else { "" },
        )
    }
}

impl DisplayFallback for SessionList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No cached sessions".to_string();
        }
        self.rows
            .iter()
            .map(DisplayFallback::display)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for SessionChange {
    fn display(&self) -> String {
        match &self.domain {
            Some(domain) => format!("{}: {} ({} removed)", self.action, domain, self.affected),
            None => format!("{}: {} removed", self.action, self.affected),
        }
    }
}
