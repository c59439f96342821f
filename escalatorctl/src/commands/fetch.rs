use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use escalator_core::{
    EscalationOrchestrator, FetchAttempt, FetchOptions, FinalResult, OrchestratorMetrics,
    Strategy, TierKind, TierRegistry,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::{AppContext, AppError, DisplayFallback, Result};

use super::parse_headers;

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Target URL (http or https)
    pub url: String,
    /// auto, browser, or forced:<tier>
    #[arg(long, default_value = "auto")]
    pub strategy: String,
    /// First tier to try (a, b, c or its name)
    #[arg(long)]
    pub start_tier: Option<String>,
    /// Highest tier the attempt may reach
    #[arg(long)]
    pub max_tier: Option<String>,
    /// Per-tier timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,
    /// Proxy URL handed to every tier
    #[arg(long)]
    pub proxy: Option<String>,
    /// Extra request header, `Name: value`
    #[arg(long = "header", value_name = "NAME:VALUE")]
    pub headers: Vec<String>,
    /// How long to wait for an operator when a captcha is handed off
    #[arg(long)]
    pub wait_seconds: Option<u64>,
    /// Include the response body in the report
    #[arg(long, default_value_t = false)]
    pub body: bool,
}

impl FetchArgs {
    pub fn strategy(&self) -> Result<Strategy> {
        Ok(self.strategy.parse::<Strategy>()?)
    }

    pub fn start_tier(&self) -> Result<Option<TierKind>> {
        parse_tier(self.start_tier.as_deref())
    }

    pub fn max_tier(&self) -> Result<Option<TierKind>> {
        parse_tier(self.max_tier.as_deref())
    }

    pub fn options(&self) -> Result<FetchOptions> {
        Ok(FetchOptions {
            timeout: self.timeout.map(Duration::from_secs),
            proxy: self.proxy.clone(),
            headers: parse_headers(&self.headers)?,
            ..Default::default()
        })
    }
}

fn parse_tier(raw: Option<&str>) -> Result<Option<TierKind>> {
    raw.map(|value| value.parse::<TierKind>().map_err(AppError::InvalidArgument))
        .transpose()
}

#[derive(Debug, Serialize)]
pub struct FetchReport {
    pub url: String,
    pub state: String,
    pub tier: Option<TierKind>,
    pub category: Option<String>,
    pub message: String,
    pub status: Option<u16>,
    pub escalations: usize,
    pub tiers_tried: Vec<TierKind>,
    pub captcha_task: Option<Uuid>,
    pub elapsed_ms: u64,
    pub metrics: OrchestratorMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl FetchReport {
    fn from_result(
        url: &str,
        result: &FinalResult,
        metrics: OrchestratorMetrics,
        body: bool,
    ) -> Self {
        Self {
            url: url.to_string(),
            state: result.state.as_str().to_string(),
            tier: result.tier,
            category: result.category.map(|category| category.as_str().to_string()),
            message: result.message.clone(),
            status: result.status,
            escalations: result.escalations,
            tiers_tried: result.tiers_tried(),
            captcha_task: result.captcha_task,
            elapsed_ms: result.elapsed.as_millis() as u64,
            metrics,
            body: if body {
                result.body().map(str::to_string)
            } else {
                None
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == "success"
    }
}

impl DisplayFallback for FetchReport {
    fn display(&self) -> String {
        let tiers = self
            .tiers_tried
            .iter()
            .map(|tier| tier.label())
            .collect::<Vec<_>>()
            .join(" -> ");
        let mut lines = vec![format!(
            "{state}: {message} ({elapsed} ms)",
            state = self.state,
            message = self.message,
            elapsed = self.elapsed_ms
        )];
        lines.push(format!(
            "  tiers: {} | escalations: {} | status: {}",
            if tiers.is_empty() { "-" } else { tiers.as_str() },
            self.escalations,
            self.status
                .map(|status| status.to_string())
                .unwrap_or_else(|| "-".to_string())
        ));
        if let Some(uuid) = self.captcha_task {
            lines.push(format!("  captcha task: {uuid}"));
        }
        if let Some(body) = &self.body {
            lines.push(String::new());
            lines.push(body.clone());
        }
        lines.join("\n")
    }
}

pub(crate) async fn fetch(context: &AppContext, args: &FetchArgs) -> Result<FetchReport> {
    let attempt = FetchAttempt::new(&args.url)?
        .with_strategy(args.strategy()?)
        .with_options(args.options()?)
        .with_tier_bounds(args.start_tier()?, args.max_tier()?);

    let config = &context.config;
    let sessions = Arc::new(context.session_store()?);
    let mut orchestrator =
        EscalationOrchestrator::new(config, TierRegistry::from_config(config), sessions)
            .with_coordinator(context.coordinator()?);
    if let Some(telemetry) = context.attempt_telemetry()? {
        orchestrator = orchestrator.with_telemetry(Arc::new(telemetry));
    }
    if let Some(wait) = args.wait_seconds {
        orchestrator = orchestrator.with_resolution_timeout(Duration::from_secs(wait));
    }

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling fetch");
                cancel.cancel();
            }
        })
    };
    let outcome = orchestrator.execute_with_cancel(attempt, &cancel).await;
    interrupt.abort();
    orchestrator.shutdown().await;

    let result = outcome?;
    Ok(FetchReport::from_result(
        &args.url,
        &result,
        orchestrator.metrics(),
        args.body,
    ))
}

#[derive(Debug, Serialize)]
pub struct FailureSummary {
    pub rows: Vec<FailureCount>,
}

#[derive(Debug, Serialize)]
pub struct FailureCount {
    pub category: String,
    pub count: i64,
}

impl DisplayFallback for FailureSummary {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No tier failures recorded".to_string();
        }
        self.rows
            .iter()
            .map(|row| format!("{:<20} {}", row.category, row.count))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub(crate) fn failure_summary(context: &AppContext) -> Result<FailureSummary> {
    let telemetry = context.attempt_telemetry()?.ok_or_else(|| {
        AppError::MissingResource("observability is disabled in the config".to_string())
    })?;
    let rows = telemetry
        .failure_summary()?
        .into_iter()
        .map(|(category, count)| FailureCount { category, count })
        .collect();
    Ok(FailureSummary { rows })
}
