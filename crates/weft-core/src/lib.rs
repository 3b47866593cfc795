pub mod audit;
pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::WeftConfig;
pub use definition::*;
pub use error::{Result, WeftError};
pub use event::EventBus;
pub use types::*;
