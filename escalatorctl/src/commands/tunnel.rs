use std::sync::Arc;

use clap::Args;
use escalator_core::{ProxyTunnel, Session};
use serde::Serialize;

use crate::{AppContext, DisplayFallback, Result};

use super::parse_headers;

#[derive(Args, Debug)]
pub struct TunnelArgs {
    pub url: String,
    /// Extra request header, `Name: value`
    #[arg(long = "header", value_name = "NAME:VALUE")]
    pub headers: Vec<String>,
    /// Include the response body in the report
    #[arg(long, default_value_t = false)]
    pub body: bool,
}

#[derive(Debug, Serialize)]
pub struct TunnelReport {
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub bytes: usize,
    pub captured: Option<Session>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl DisplayFallback for TunnelReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("{} {} ({} bytes)", self.status, self.url, self.bytes)];
        match &self.captured {
            Some(session) => lines.push(format!(
                "  captured {} credential cookie(s) for {}",
                session.cookies.len(),
                session.domain
            )),
            None => lines.push("  no credential cookies".to_string()),
        }
        if let Some(body) = &self.body {
            lines.push(String::new());
            lines.push(body.clone());
        }
        lines.join("\n")
    }
}

pub(crate) async fn tunnel(context: &AppContext, args: &TunnelArgs) -> Result<TunnelReport> {
    let sessions = Arc::new(context.session_store()?);
    let events = Arc::new(context.event_feed(context.captcha_store()?));
    let tunnel = ProxyTunnel::new(
        context.config.tunnel.clone(),
        context.config.session.clone(),
        sessions,
        events,
    )?;
    let response = tunnel.fetch(&args.url, &parse_headers(&args.headers)?).await?;
    Ok(TunnelReport {
        url: args.url.clone(),
        status: response.status,
        bytes: response.body.len(),
        body: args
            .body
            .then(|| String::from_utf8_lossy(&response.body).into_owned()),
        headers: response.headers,
        captured: response.captured,
    })
}
