// Direktiv engine
//
// Drives workflow instances through their states. Instances are advanced by
// a leased worker pool; a suspended instance is just a stored cursor, woken by
// timers, correlated events, function results or finished subflows.

pub mod cursor;
pub mod engine;
pub mod error;
pub mod invoke;
pub mod jq;
mod run;
pub mod scheduler;
mod states;
pub mod status;
mod triggers;

pub use engine::{Engine, EngineConfig, StartRequest, SIGNAL_TOPIC};
pub use error::EngineError;
pub use invoke::{FunctionCall, FunctionInvoker, HttpInvoker, NoRuntime, UrlResolver};
pub use scheduler::{Clock, SchedulerConfig};
pub use status::{StatusUpdate, STATUS_TOPIC};
