mod commands;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use escalator_core::{
    load_escalator_config, AttemptTelemetry, EscalatorConfig, ResolutionCoordinator,
    SqliteCaptchaStore, SqliteEventFeed, SqliteSessionStore,
};
use serde::Serialize;
use thiserror::Error;

pub use commands::captcha::{
    CaptchaAssignArgs, CaptchaCommands, CaptchaEventsArgs, CaptchaListArgs, CaptchaOperatorArgs,
    CaptchaReasonArgs, CaptchaSolveArgs, CaptchaTaskArgs, CaptchaWaitArgs,
};
pub use commands::fetch::{FetchArgs, FetchReport};
pub use commands::session::{SessionCommands, SessionDomainArgs};
pub use commands::tunnel::{TunnelArgs, TunnelReport};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] escalator_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("session error: {0}")]
    Session(#[from] escalator_core::SessionError),
    #[error("captcha error: {0}")]
    Captcha(#[from] escalator_core::CaptchaError),
    #[error("{0}")]
    Orchestrator(#[from] escalator_core::OrchestratorError),
    #[error("tunnel error: {0}")]
    Tunnel(#[from] escalator_core::TunnelError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] escalator_core::TelemetryError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("fetch failed: {0}")]
    FetchFailed(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Escalating fetch and captcha operator console", long_about = None)]
pub struct Cli {
    /// Path to escalator.toml
    #[arg(long, default_value = "configs/escalator.toml")]
    pub config: PathBuf,
    /// Override for storage.database
    #[arg(long)]
    pub database: Option<PathBuf>,
    /// Disable the failure log and attempt metrics
    #[arg(long, default_value_t = false)]
    pub no_telemetry: bool,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch a URL through the escalation ladder
    Fetch(FetchArgs),
    /// Operator actions on captcha tasks
    #[command(subcommand)]
    Captcha(CaptchaCommands),
    /// Inspect or clear cached sessions
    #[command(subcommand)]
    Session(SessionCommands),
    /// Fetch a URL through the proxy tunnel and capture credential cookies
    Tunnel(TunnelArgs),
    /// Tier failure counts by category
    Failures,
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match &cli.command {
        Commands::Fetch(args) => {
            let report = runtime.block_on(commands::fetch::fetch(&context, args))?;
            render(&report, cli.format)?;
            if !report.is_success() {
                return Err(AppError::FetchFailed(report.message));
            }
        }
        Commands::Captcha(command) => {
            runtime.block_on(commands::captcha::run(&context, command, cli.format))?;
        }
        Commands::Session(command) => {
            runtime.block_on(commands::session::run(&context, command, cli.format))?;
        }
        Commands::Tunnel(args) => {
            let report = runtime.block_on(commands::tunnel::tunnel(&context, args))?;
            render(&report, cli.format)?;
        }
        Commands::Failures => {
            let summary = commands::fetch::failure_summary(&context)?;
            render(&summary, cli.format)?;
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: EscalatorConfig,
    database: PathBuf,
    failure_log: PathBuf,
    metrics_db: PathBuf,
    telemetry: bool,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_escalator_config(&cli.config)?;

        // Relative storage paths follow the config file, not the shell.
        if Path::new(&config.storage.base_dir).is_relative() {
            let config_dir = cli
                .config
                .parent()
                .and_then(Path::parent)
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            config.storage.base_dir = config_dir
                .join(&config.storage.base_dir)
                .to_string_lossy()
                .into_owned();
        }

        let database = cli
            .database
            .clone()
            .unwrap_or_else(|| config.resolve_path(&config.storage.database));
        let failure_log = config.resolve_path(&config.observability.failure_log);
        let metrics_db = config.resolve_path(&config.observability.metrics_db);
        let telemetry = config.observability.enabled && !cli.no_telemetry;

        Ok(Self {
            config,
            database,
            failure_log,
            metrics_db,
            telemetry,
        })
    }

    fn ensure_database_dir(&self) -> Result<()> {
        if let Some(parent) = self.database.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn session_store(&self) -> Result<SqliteSessionStore> {
        self.ensure_database_dir()?;
        let store = SqliteSessionStore::builder()
            .path(&self.database)
            .create_if_missing(true)
            .build()?;
        store.initialize()?;
        Ok(store)
    }

    fn captcha_store(&self) -> Result<SqliteCaptchaStore> {
        self.ensure_database_dir()?;
        let store = SqliteCaptchaStore::builder()
            .path(&self.database)
            .create_if_missing(true)
            .build()?;
        store.initialize()?;
        Ok(store)
    }

    fn event_feed(&self, store: SqliteCaptchaStore) -> SqliteEventFeed {
        SqliteEventFeed::new(store, self.config.captcha.poll_interval())
    }

    /// Coordinator over the shared database, so tasks and sessions created
    /// here are visible to every other process using the same file.
    fn coordinator(&self) -> Result<ResolutionCoordinator> {
        let sessions = Arc::new(self.session_store()?);
        let store = self.captcha_store()?;
        let events = Arc::new(self.event_feed(store.clone()));
        Ok(ResolutionCoordinator::new(
            store,
            sessions,
            events,
            self.config.captcha.clone(),
            self.config.session.clone(),
        ))
    }

    fn attempt_telemetry(&self) -> Result<Option<AttemptTelemetry>> {
        if !self.telemetry {
            return Ok(None);
        }
        Ok(Some(AttemptTelemetry::new(
            &self.failure_log,
            &self.metrics_db,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use escalator_core::{Strategy, TierKind};
    use tempfile::TempDir;

    fn prepare_test_context(command: Commands) -> (TempDir, Cli) {
        let temp = TempDir::new().unwrap();
        let configs_dir = temp.path().join("configs");
        fs::create_dir_all(&configs_dir).unwrap();
        fs::copy(
            "../configs/escalator.toml",
            configs_dir.join("escalator.toml"),
        )
        .unwrap();
        let cli = Cli {
            config: configs_dir.join("escalator.toml"),
            database: None,
            no_telemetry: false,
            format: OutputFormat::Json,
            command,
        };
        (temp, cli)
    }

    #[test]
    fn parses_fetch_with_strategy_and_bounds() {
        let cli = Cli::try_parse_from([
            "escalatorctl",
            "--format",
            "json",
            "fetch",
            "https://example.com/",
            "--strategy",
            "forced:b",
            "--max-tier",
            "c",
            "--timeout",
            "30",
        ])
        .unwrap();
        assert!(matches!(cli.format, OutputFormat::Json));
        match cli.command {
            Commands::Fetch(args) => {
                assert_eq!(args.url, "https://example.com/");
                assert_eq!(
                    args.strategy().unwrap(),
                    Strategy::Forced(TierKind::BrowserHybrid)
                );
                assert_eq!(args.max_tier().unwrap(), Some(TierKind::FullBrowser));
                assert_eq!(args.timeout, Some(30));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_captcha_solve_cookies() {
        let cli = Cli::try_parse_from([
            "escalatorctl",
            "captcha",
            "solve",
            "7d5c0a4e-0d57-4b4e-9a8e-3a1bbf0c2f10",
            "--cookie",
            "cf_clearance=X",
            "--cookie",
            "__cf_bm=Y",
        ])
        .unwrap();
        match cli.command {
            Commands::Captcha(CaptchaCommands::Solve(args)) => {
                let solution = args.solution().unwrap();
                assert_eq!(solution.cookies.len(), 2);
                assert_eq!(solution.cookies[0].name, "cf_clearance");
                assert_eq!(solution.cookies[0].value, "X");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_strategy() {
        let cli = Cli::try_parse_from([
            "escalatorctl",
            "fetch",
            "https://example.com/",
            "--strategy",
            "teleport",
        ])
        .unwrap();
        match cli.command {
            Commands::Fetch(args) => assert!(args.strategy().is_err()),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn storage_paths_follow_the_config_file() {
        let (temp, cli) = prepare_test_context(Commands::Failures);
        let context = AppContext::new(&cli).unwrap();
        assert!(context.database.starts_with(temp.path()));
        assert!(context.database.ends_with("data/escalator.sqlite"));
        assert!(context.failure_log.starts_with(temp.path()));
    }

    #[test]
    fn database_override_wins() {
        let (temp, mut cli) = prepare_test_context(Commands::Failures);
        let custom = temp.path().join("elsewhere/custom.sqlite");
        cli.database = Some(custom.clone());
        let context = AppContext::new(&cli).unwrap();
        assert_eq!(context.database, custom);
    }

    #[test]
    fn captcha_and_session_commands_share_one_database() {
        let (temp, cli) = prepare_test_context(Commands::Failures);
        let context = AppContext::new(&cli).unwrap();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let coordinator = context.coordinator().unwrap();
            let task = coordinator
                .create_task(escalator_core::NewCaptchaTask {
                    url: "https://example.com/".into(),
                    domain: "example.com".into(),
                    challenge_type: "turnstile".into(),
                    ..Default::default()
                })
                .await
                .unwrap();
            coordinator.assign(task.uuid, "operator-1", None).await.unwrap();
            coordinator
                .submit_solution(
                    task.uuid,
                    escalator_core::Solution::cookies(vec![escalator_core::Cookie::new(
                        "cf_clearance",
                        "X",
                        "",
                    )]),
                    None,
                )
                .await
                .unwrap();
        });
        let sessions = context.session_store().unwrap();
        let session = sessions.load("example.com").unwrap().unwrap();
        assert_eq!(session.cookie("cf_clearance").unwrap().value, "X");
        assert!(temp.path().join("data/escalator.sqlite").exists());
    }
}
