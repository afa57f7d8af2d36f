// Direktiv gateway
//
// Serves user-defined HTTP endpoints. Each endpoint file names a path, the
// allowed methods and a plugin chain (auth, inbound, target, outbound); the
// gateway compiles them per namespace into an immutable table that is swapped
// atomically whenever the files change.

pub mod backend;
pub mod context;
pub mod error;
pub mod gateway;
pub mod http;
pub mod plugin;
pub mod plugins;
pub mod table;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{EngineBackend, GatewayBackend};
pub use context::{Consumer, GatewayRequest, GatewayResponse};
pub use error::{GatewayError, PluginError};
pub use gateway::{Gateway, GatewayConfig};
pub use http::router;
pub use plugin::{AuthPlugin, InboundPlugin, OutboundPlugin, PluginEnv, PluginRegistry, TargetPlugin};
pub use table::{ConsumerInfo, RouteInfo};
