pub mod database;
pub mod guard;
pub mod history_log;
pub mod metrics;
pub mod pipeline;
pub mod providers;
pub mod quota;
pub mod session_store;

pub use database::ChatDb;
pub use guard::{GuardConfig, IntentGuard, BLOCK_MESSAGE};
pub use history_log::{HistoryLog, HistoryLogError, InMemoryHistoryLog};
pub use pipeline::{ChatPipeline, PipelineSettings, TurnError, TurnOutcome, TurnRequest};
pub use session_store::SessionStore;
