//! Stdio↔socket bridge
//!
//! MCP clients that can only spawn a stdio server run `mcplexer bridge`;
//! it tunnels their stdio to the local daemon socket. The bridge examines
//! only the first client line: when that line is an `initialize` request
//! without roots, it injects `params.roots` from the configured root (or
//! the bridge's own working directory) so the daemon can anchor the
//! session in a workspace. Any parse failure passes the bytes through
//! untouched.

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, warn};

use mcplexer_mcp::protocol::{read_frame, MAX_CLIENT_FRAME};

use crate::error::GatewayResult;

/// Connect to the daemon socket and pump this process's stdio both ways
pub async fn run_bridge(socket_path: &str, root_override: Option<String>) -> GatewayResult<()> {
    let root = root_override.unwrap_or_else(|| {
        std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "/".to_string())
    });
    bridge_streams(tokio::io::stdin(), tokio::io::stdout(), socket_path, root).await
}

/// Tunnel an arbitrary client byte stream to the daemon socket
pub async fn bridge_streams<R, W>(client_reader: R, client_writer: W, socket_path: &str, root: String) -> GatewayResult<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let stream = UnixStream::connect(socket_path).await?;
    let (socket_read, socket_write) = stream.into_split();

    let up = tokio::spawn(pump_client_to_daemon(client_reader, socket_write, root));
    let down = tokio::spawn(pump_daemon_to_client(socket_read, client_writer));

    // Either direction closing ends the bridge.
    tokio::select! {
        result = up => {
            if let Ok(Err(e)) = result {
                warn!(error = %e, "client-to-daemon pump failed");
            }
        }
        result = down => {
            if let Ok(Err(e)) = result {
                warn!(error = %e, "daemon-to-client pump failed");
            }
        }
    }
    Ok(())
}

async fn pump_client_to_daemon<R, W>(reader: R, mut writer: W, root: String) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);

    // Only the first line is inspected; everything after flows verbatim.
    match read_frame(&mut reader, MAX_CLIENT_FRAME).await {
        Ok(Some(first_line)) => {
            let rewritten = inject_roots(&first_line, &root);
            writer.write_all(rewritten.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok(None) => return Ok(()),
        Err(e) => {
            warn!(error = %e, "failed reading first client frame");
            return Ok(());
        }
    }

    tokio::io::copy(&mut reader, &mut writer).await?;
    Ok(())
}

async fn pump_daemon_to_client<R, W>(mut reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
    }
}

/// Rewrite the first frame iff it is an `initialize` request with no roots.
/// Anything unexpected passes through byte-for-byte.
fn inject_roots(line: &str, root: &str) -> String {
    let Ok(mut value) = serde_json::from_str::<Value>(line) else {
        return line.to_string();
    };
    if value.get("method").and_then(Value::as_str) != Some("initialize") {
        return line.to_string();
    }
    let Some(params) = value.get_mut("params").and_then(Value::as_object_mut) else {
        return line.to_string();
    };
    if params.contains_key("roots") {
        return line.to_string();
    }

    params.insert("roots".to_string(), json!([{"uri": format!("file://{root}")}]));
    debug!(root, "injected workspace root into initialize");
    serde_json::to_string(&value).unwrap_or_else(|_| line.to_string())
}
