// Direktiv server
//
// Assembles a flow node from the workspace crates and exposes it over HTTP:
// - api: the /api/v2 REST surface, with the gateway mounted beside it
// - node: component wiring, leader tasks and derived state refresh
// - auth: optional API key on /api/*

pub mod api;
pub mod auth;
pub mod error;
pub mod node;

pub use api::router;
pub use auth::{ApiKey, API_KEY_HEADER};
pub use error::{ApiError, ApiResult};
pub use node::{Node, FILES_TOPIC};
