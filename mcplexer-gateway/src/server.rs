//! Gateway listeners
//!
//! Either a single session over the process's own stdio, or an accept loop
//! on a Unix-domain socket with one session task per client. A panic inside
//! a session task is absorbed at the task boundary; other sessions keep
//! running.

use std::path::Path;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::context::GatewayContext;
use crate::error::GatewayResult;
use crate::session::run_session;

/// Serve exactly one session over this process's stdin/stdout
pub async fn run_stdio(ctx: Arc<GatewayContext>) -> GatewayResult<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    run_session(ctx, stdin, stdout).await
}

/// Accept clients on a Unix-domain socket until `shutdown` fires
pub async fn run_socket(
    ctx: Arc<GatewayContext>,
    socket_path: &str,
    mut shutdown: watch::Receiver<bool>,
) -> GatewayResult<()> {
    // A stale socket file from a previous run would fail the bind
    if Path::new(socket_path).exists() {
        let _ = std::fs::remove_file(socket_path);
    }
    let listener = UnixListener::bind(socket_path)?;
    info!(socket_path, "gateway listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, _addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let (reader, writer) = stream.into_split();
                    // The task boundary confines panics to this session.
                    if let Err(e) = run_session(ctx, reader, writer).await {
                        error!(error = %e, "session ended with error");
                    }
                });
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    info!("gateway listener stopped");
    Ok(())
}
