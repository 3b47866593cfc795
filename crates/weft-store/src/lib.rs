pub mod dead_letter;
pub mod event_log;
pub mod handoffs;
pub mod jsonl;
mod sqlite;
pub mod state;

pub use dead_letter::DeadLetterQueue;
pub use event_log::{fold_events, EventLog, EventQuery, ReplaySummary, StepReplay};
pub use handoffs::HandoffRegistry;
pub use jsonl::JsonlMirror;
pub use state::{SaveOptions, StateRepository};
