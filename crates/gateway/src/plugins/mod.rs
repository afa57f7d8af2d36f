//! Built-in plugins, grouped by the phase they run in

pub mod auth;
pub mod inbound;
pub mod outbound;
pub(crate) mod script;
pub mod target;
