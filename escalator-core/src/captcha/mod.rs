//! Human resolution: durable captcha tasks, their lifecycle events and the
//! coordinator that turns a solution into a cached session.

mod coordinator;
mod error;
mod events;
mod store;
mod task;

pub use coordinator::ResolutionCoordinator;
pub use error::{CaptchaError, CaptchaResult};
pub use events::{
    BroadcastEventFeed, CaptchaEvent, EventFeed, EventSubscription, EventType, SqliteEventFeed,
};
pub use store::{CreatedTask, SqliteCaptchaStore, SqliteCaptchaStoreBuilder, TaskFilter};
pub use task::{CaptchaStatus, CaptchaTask, NewCaptchaTask, Solution, SolutionType};
