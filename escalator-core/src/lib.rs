pub mod captcha;
pub mod classifier;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod sqlite;
pub mod tier;
pub mod tunnel;

pub use captcha::{
    BroadcastEventFeed, CaptchaError, CaptchaEvent, CaptchaResult, CaptchaStatus, CaptchaTask,
    CreatedTask, EventFeed, EventSubscription, EventType, NewCaptchaTask, ResolutionCoordinator, Solution,
    SolutionType, SqliteCaptchaStore, SqliteCaptchaStoreBuilder, SqliteEventFeed, TaskFilter,
};
pub use classifier::{
    classify, detect_challenge, ChallengeKind, ErrorCategory, ErrorClassifier, RawOutcome,
    TransportFailure, MARKER_LIST_VERSION,
};
pub use config::{
    load_escalator_config, CaptchaSection, ChromiumSection, ClassifierSection, EscalatorConfig,
    OrchestratorSection, RetrySection, SessionSection, TunnelSection,
};
pub use error::{ConfigError, Result};
pub use orchestrator::{
    describe_outcome, AttemptState, AttemptTelemetry, EscalationOrchestrator, FetchAttempt,
    FinalResult, FinalState, OrchestratorError, OrchestratorMetrics, OrchestratorResult,
    RetryPolicy, Strategy, TelemetryError, TierAction,
};
pub use session::{
    domain_of, harvest_session, normalize_domain, Cookie, MemorySessionCache, Session,
    SessionCache, SessionError, SessionResult, SessionSource, SqliteSessionStore,
    SqliteSessionStoreBuilder,
};
pub use tier::{
    CaptchaContext, FetchOptions, TierError, TierExecutor, TierKind, TierOutcome, TierPayload,
    TierRegistry, TierResult,
};
pub use tunnel::{ProxyTunnel, TunnelError, TunnelResponse, TunnelResult};
