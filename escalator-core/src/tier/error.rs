use thiserror::Error;

use crate::classifier::{RawOutcome, TransportFailure};

pub type BackendResult<T> = Result<T, TierError>;

/// Backend failures raised while driving a tier. They never leave the tier
/// as-is: [`TierError::into_raw`] turns them into a classifiable outcome.
#[derive(Debug, Error)]
pub enum TierError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid target url: {0}")]
    InvalidUrl(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<tokio::task::JoinError> for TierError {
    fn from(err: tokio::task::JoinError) -> Self {
        TierError::Unexpected(err.to_string())
    }
}

impl TierError {
    pub fn into_raw(self) -> RawOutcome {
        let failure = match self {
            TierError::Timeout(_) => TransportFailure::Timeout,
            TierError::Http(err) if err.is_timeout() => TransportFailure::Timeout,
            TierError::Http(err) => TransportFailure::from_message(&error_chain(&err)),
            TierError::Cdp(err) => TransportFailure::from_message(&err.to_string()),
            other => TransportFailure::Other(other.to_string()),
        };
        RawOutcome::transport(failure)
    }
}

/// Flattens an error and its sources into one line so resolver and socket
/// failures buried in the chain are visible to the classifier.
pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_launch_failures_map_to_transport_failures() {
        assert_eq!(
            TierError::Timeout("navigation".into()).into_raw().transport,
            Some(TransportFailure::Timeout)
        );
        assert!(matches!(
            TierError::Launch("no chrome".into()).into_raw().transport,
            Some(TransportFailure::Other(_))
        ));
    }
}
