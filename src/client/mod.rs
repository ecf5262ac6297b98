//! Editor-side client: request orchestration, typed backend calls, chat
//! sessions and the reindex trigger.

pub mod api;
pub mod cache;
pub mod inflight;
pub mod orchestrator;
pub mod outcome;
pub mod reindex;
pub mod session;
pub mod watcher;

pub use api::{BackendClient, ChatOptions, HealthProbe};
pub use orchestrator::{CachePolicy, ConnectivityProbe, RequestOrchestrator};
pub use outcome::{RequestOutcome, ResponseEnvelope};
pub use reindex::{ManualTrigger, ReindexTrigger, TriggerConfig, TriggerState, WatchFilter};
pub use session::ChatSession;
