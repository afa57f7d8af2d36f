//! Direktiv command executor
//!
//! Runs inside action containers as `DIREKTIV_APP=sidecar`, executing the
//! command lists that workflow actions send to it.

pub mod command;
pub mod error;
pub mod executor;
pub mod init;
pub mod log;
pub mod parse;
pub mod server;

use std::net::SocketAddr;
use std::sync::Arc;

pub use command::{CommandRequest, CommandResult, CommandSpec};
pub use error::ExecError;
pub use executor::{ActionContext, Execution, Executor, SidecarConfig};
pub use init::install;
pub use server::{router, ACTION_ID_HEADER, TEMP_DIR_HEADER};

/// Bind and serve until the future resolves
pub async fn serve<F>(config: SidecarConfig, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = router(Arc::new(Executor::new(config)));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "command executor listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}
