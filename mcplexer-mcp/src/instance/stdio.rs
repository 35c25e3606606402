//! Stdio instance: one child process speaking line-delimited JSON-RPC
//!
//! The serialization contract is exactly one in-flight request per
//! instance: requests enter an unbounded FIFO queue and a single pump task
//! writes each frame, reads exactly one response, and delivers it through a
//! oneshot channel. The idle timer only runs while the queue is empty.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{McpError, McpResult};
use crate::protocol::{
    messages::methods, read_frame, write_frame, InitializeParams, JsonRpcRequest, JsonRpcResponse, MAX_STDIO_FRAME,
};

use super::{DownstreamInstance, HeaderOverlay, InstanceKey, InstanceState, StateCell};

/// Deadline for the downstream `initialize` handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

struct QueuedRequest {
    request: JsonRpcRequest,
    reply: oneshot::Sender<McpResult<Value>>,
}

struct Running {
    tx: mpsc::UnboundedSender<QueuedRequest>,
    stop_tx: oneshot::Sender<()>,
    pump: JoinHandle<()>,
}

/// A downstream reached through a spawned child process
pub struct StdioInstance {
    key: InstanceKey,
    command: String,
    args: Vec<String>,
    /// Fully merged environment (OS < server-declared < auth-derived)
    env: HashMap<String, String>,
    idle_timeout: Duration,
    state: Arc<StateCell>,
    running: Mutex<Option<Running>>,
    next_id: Arc<AtomicI64>,
}

impl StdioInstance {
    pub fn new(
        key: InstanceKey,
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            key,
            command: command.into(),
            args,
            env,
            idle_timeout,
            state: Arc::new(StateCell::new(InstanceState::Stopped)),
            running: Mutex::new(None),
            next_id: Arc::new(AtomicI64::new(1)),
        }
    }

    fn spawn_child(&self) -> McpResult<(Child, BufWriter<ChildStdin>, BufReader<ChildStdout>)> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| McpError::connection_failed(format!("spawn '{}': {e}", self.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::transport("child has no stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::transport("child has no stdout handle"))?;

        // Drain stderr so the child never blocks on a full pipe
        if let Some(stderr) = child.stderr.take() {
            let key = self.key.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(instance = %key, "stderr: {line}");
                }
            });
        }

        Ok((child, BufWriter::new(stdin), BufReader::new(stdout)))
    }

    /// Run the MCP handshake against a fresh child
    async fn handshake(
        &self,
        writer: &mut BufWriter<ChildStdin>,
        reader: &mut BufReader<ChildStdout>,
    ) -> McpResult<()> {
        let init_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let init = JsonRpcRequest::with_id(
            methods::INITIALIZE,
            Some(serde_json::to_value(InitializeParams::for_downstream())?),
            init_id,
        );
        write_frame(writer, &init).await?;

        // Skip anything that is not a response (servers may emit log
        // notifications while starting up); the initialize request is the
        // only one in flight, so the first real response is ours.
        loop {
            let line = read_frame(reader, MAX_STDIO_FRAME)
                .await?
                .ok_or_else(|| McpError::connection_failed("child closed stdout during handshake"))?;
            if let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&line) {
                if response.id.is_some() && (response.result.is_some() || response.error.is_some()) {
                    response.into_result()?;
                    break;
                }
            }
        }

        let initialized = JsonRpcRequest::notification(methods::INITIALIZED, None);
        write_frame(writer, &initialized).await?;
        Ok(())
    }
}

#[async_trait]
impl DownstreamInstance for StdioInstance {
    async fn start(&self) -> McpResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() && self.state.get() != InstanceState::Stopped {
            return Ok(());
        }
        self.state.set(InstanceState::Starting);

        let (mut child, mut writer, mut reader) = match self.spawn_child() {
            Ok(io) => io,
            Err(e) => {
                self.state.set(InstanceState::Stopped);
                return Err(e);
            }
        };

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake(&mut writer, &mut reader)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = child.kill().await;
                self.state.set(InstanceState::Stopped);
                return Err(e);
            }
            Err(_) => {
                let _ = child.kill().await;
                self.state.set(InstanceState::Stopped);
                return Err(McpError::timeout("initialize handshake", HANDSHAKE_TIMEOUT));
            }
        }

        self.state.set(InstanceState::Ready);

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let pump = tokio::spawn(pump_loop(
            self.key.clone(),
            child,
            writer,
            reader,
            rx,
            stop_rx,
            self.idle_timeout,
            self.state.clone(),
        ));

        *running = Some(Running { tx, stop_tx, pump });
        debug!(instance = %self.key, command = %self.command, "stdio instance started");
        Ok(())
    }

    async fn stop(&self) -> McpResult<()> {
        let Some(running) = self.running.lock().await.take() else {
            self.state.set(InstanceState::Stopped);
            return Ok(());
        };
        self.state.set(InstanceState::Stopping);
        let _ = running.stop_tx.send(());
        if tokio::time::timeout(Duration::from_secs(5), running.pump).await.is_err() {
            warn!(instance = %self.key, "pump did not exit in time");
        }
        self.state.set(InstanceState::Stopped);
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>, _headers: Option<&HeaderOverlay>) -> McpResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::with_id(method, params, id);
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let running = self.running.lock().await;
            let Some(running) = running.as_ref() else {
                return Err(McpError::transport("instance is not running"));
            };
            running
                .tx
                .send(QueuedRequest {
                    request,
                    reply: reply_tx,
                })
                .map_err(|_| McpError::transport("instance pump has exited"))?;
        }

        reply_rx
            .await
            .map_err(|_| McpError::transport("instance stopped before responding"))?
    }

    fn state(&self) -> InstanceState {
        self.state.get()
    }

    fn key(&self) -> &InstanceKey {
        &self.key
    }
}

enum PumpExit {
    Stopped,
    IdleTimeout,
    TransportFailed(String),
}

/// Single writer-reader task enforcing the strict FIFO contract
#[allow(clippy::too_many_arguments)]
async fn pump_loop(
    key: InstanceKey,
    mut child: Child,
    mut writer: BufWriter<ChildStdin>,
    mut reader: BufReader<ChildStdout>,
    mut rx: mpsc::UnboundedReceiver<QueuedRequest>,
    mut stop_rx: oneshot::Receiver<()>,
    idle_timeout: Duration,
    state: Arc<StateCell>,
) {
    let exit = loop {
        let queued = tokio::select! {
            _ = &mut stop_rx => break PumpExit::Stopped,
            _ = tokio::time::sleep(idle_timeout) => break PumpExit::IdleTimeout,
            queued = rx.recv() => match queued {
                Some(queued) => queued,
                None => break PumpExit::Stopped,
            },
        };

        state.set(InstanceState::Busy);
        let outcome = exchange(&mut writer, &mut reader, &queued.request).await;
        // A JSON-RPC error object is a normal reply; anything else means the
        // stream is broken or desynced and the child must go.
        let fatal = matches!(outcome, Err(ref e) if !matches!(e, McpError::Downstream { .. }));
        if fatal {
            let _ = queued.reply.send(outcome);
            break PumpExit::TransportFailed("write or read failed".to_string());
        }
        state.set(InstanceState::Idle);
        let _ = queued.reply.send(outcome);
    };

    match &exit {
        PumpExit::Stopped => debug!(instance = %key, "pump stopping"),
        PumpExit::IdleTimeout => debug!(instance = %key, idle = ?idle_timeout, "idle timeout, stopping child"),
        PumpExit::TransportFailed(reason) => warn!(instance = %key, reason, "transport failed, killing child"),
    }

    let _ = child.kill().await;
    let _ = child.wait().await;

    // Fail everything still queued
    rx.close();
    while let Ok(queued) = rx.try_recv() {
        let _ = queued
            .reply
            .send(Err(McpError::transport("instance stopped with request queued")));
    }

    state.set(InstanceState::Stopped);
}

/// Write one frame and read exactly one matching response
async fn exchange(
    writer: &mut BufWriter<ChildStdin>,
    reader: &mut BufReader<ChildStdout>,
    request: &JsonRpcRequest,
) -> McpResult<Value> {
    write_frame(writer, request).await?;

    loop {
        let line = read_frame(reader, MAX_STDIO_FRAME)
            .await?
            .ok_or_else(|| McpError::connection_failed("child closed stdout"))?;
        match serde_json::from_str::<JsonRpcResponse>(&line) {
            // Exactly one request is in flight, so the first frame that is a
            // real response (id plus result or error) belongs to it.
            // Notifications and server-initiated requests are skipped.
            Ok(response) if response.id.is_some() && (response.result.is_some() || response.error.is_some()) => {
                return response.into_result()
            }
            Ok(_) | Err(_) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_instance(command: &str, args: &[&str]) -> StdioInstance {
        StdioInstance::new(
            InstanceKey::anonymous("test"),
            command,
            args.iter().map(|s| s.to_string()).collect(),
            std::env::vars().collect(),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_and_leaves_stopped() {
        let instance = echo_instance("definitely-not-a-real-binary-9f2c", &[]);
        let err = instance.start().await.unwrap_err();
        assert!(matches!(err, McpError::ConnectionFailed { .. }));
        assert_eq!(instance.state(), InstanceState::Stopped);
    }

    #[tokio::test]
    async fn request_without_start_is_a_transport_error() {
        let instance = echo_instance("cat", &[]);
        let err = instance.request("ping", None, None).await.unwrap_err();
        assert!(matches!(err, McpError::Transport { .. }));
    }

    #[tokio::test]
    async fn handshake_completes_against_scripted_server() {
        // A tiny MCP "server": answer the initialize request, then echo a
        // canned pong for the next request.
        let script = r#"
read line
printf '{"jsonrpc":"2.0","result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0"}},"id":1}\n'
read notif
read line
printf '{"jsonrpc":"2.0","result":{"ok":true},"id":2}\n'
read line
"#;
        let instance = echo_instance("sh", &["-c", script]);
        instance.start().await.unwrap();
        assert_eq!(instance.state(), InstanceState::Ready);

        let result = instance.request("ping", None, None).await.unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
        assert_eq!(instance.state(), InstanceState::Idle);

        instance.stop().await.unwrap();
        assert_eq!(instance.state(), InstanceState::Stopped);
    }

    #[tokio::test]
    async fn idle_timeout_stops_the_child() {
        let script = r#"
read line
printf '{"jsonrpc":"2.0","result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0"}},"id":1}\n'
read notif
sleep 60
"#;
        let mut instance = echo_instance("sh", &["-c", script]);
        instance.idle_timeout = Duration::from_millis(50);
        instance.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(instance.state(), InstanceState::Stopped);
    }
}
