use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::TransportError;

use super::{EVENT_CHANNEL_CAPACITY, Transport, TransportEvent, enforce_jsonrpc};

const KILL_GRACE: Duration = Duration::from_secs(1);

/// Child-process transport: line-delimited JSON-RPC on stdin/stdout, stderr
/// mirrored into the log stream under the server's name. The command is
/// spawned from an argument vector; no shell is ever involved.
pub struct StdioTransport {
    server_name: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl StdioTransport {
    pub fn new(
        server_name: &str,
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            server_name: server_name.to_string(),
            command,
            args,
            env,
            stdin: Arc::new(Mutex::new(None)),
            shutdown: None,
        }
    }
}

fn map_spawn_error(err: std::io::Error) -> TransportError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::NotFound => TransportError::ConnectionFailed("command not found".into()),
        ErrorKind::PermissionDenied => TransportError::ConnectionFailed("permission denied".into()),
        ErrorKind::TimedOut => TransportError::ConnectionTimeout,
        _ => match err.raw_os_error() {
            #[cfg(unix)]
            Some(code) if code == libc::EMFILE || code == libc::ENFILE => {
                TransportError::ServiceUnavailable
            }
            _ => TransportError::ConnectionFailed(err.to_string()),
        },
    }
}

#[cfg(unix)]
fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&mut self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        if self.command.is_empty() {
            return Err(TransportError::ConnectionFailed("missing command".into()));
        }

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(map_spawn_error)?;
        debug!(target = "transport", server = %self.server_name, command = %self.command, "child spawned");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed("no child stdout".into()))?;
        let stderr = child.stderr.take();
        *self.stdin.lock().await = child.stdin.take();

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let reader_tx = tx.clone();
        let reader_name = self.server_name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(message) => match enforce_jsonrpc(&message) {
                        Ok(()) => {
                            if reader_tx.send(TransportEvent::Message(message)).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(target = "transport", server = %reader_name, error = %err,
                                  "dropping non-jsonrpc message");
                        }
                    },
                    Err(_) => {
                        // not a protocol frame; surface it like stderr chatter
                        info!(target = "server-stderr", server = %reader_name, "{line}");
                    }
                }
            }
        });

        if let Some(stderr) = stderr {
            let stderr_name = self.server_name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target = "server-stderr", server = %stderr_name, "{line}");
                }
            });
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        self.shutdown = Some(shutdown_tx);
        let monitor_name = self.server_name.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) if status.success() => {
                            debug!(target = "transport", server = %monitor_name, "child exited cleanly");
                        }
                        Ok(status) => {
                            warn!(target = "transport", server = %monitor_name, code = ?status.code(),
                                  "child exited with failure");
                            let _ = tx.send(TransportEvent::Error(TransportError::ConnectionReset)).await;
                        }
                        Err(err) => {
                            warn!(target = "transport", server = %monitor_name, error = %err,
                                  "waiting on child failed");
                            let _ = tx.send(TransportEvent::Error(TransportError::ConnectionReset)).await;
                        }
                    }
                    let _ = tx.send(TransportEvent::Closed).await;
                }
                _ = &mut shutdown_rx => {
                    terminate(&child);
                    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                    debug!(target = "transport", server = %monitor_name, "child terminated");
                    let _ = tx.send(TransportEvent::Closed).await;
                }
            }
        });

        Ok(rx)
    }

    async fn send(&self, message: serde_json::Value) -> Result<(), TransportError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::TransportClosed)?;
        let mut line = serde_json::to_string(&message)
            .map_err(|err| TransportError::ProtocolError(err.to_string()))?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|_| TransportError::TransportClosed)?;
        stdin
            .flush()
            .await
            .map_err(|_| TransportError::TransportClosed)?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // dropping stdin gives the child its EOF before any signal arrives
        self.stdin.lock().await.take();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(command: &str, args: &[&str]) -> StdioTransport {
        StdioTransport::new(
            "test",
            command.to_string(),
            args.iter().map(|s| s.to_string()).collect(),
            HashMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]),
        )
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let mut t = transport("", &[]);
        let err = t.start().await.unwrap_err();
        assert!(err.to_string().contains("missing command"));
    }

    #[tokio::test]
    async fn missing_binary_maps_to_command_not_found() {
        let mut t = transport("definitely-not-a-real-binary-xyz", &[]);
        let err = t.start().await.unwrap_err();
        assert_eq!(
            err,
            TransportError::ConnectionFailed("command not found".into())
        );
    }

    #[tokio::test]
    async fn echo_child_round_trips_messages() {
        let mut t = transport("cat", &[]);
        let mut rx = t.start().await.unwrap();
        let msg = serde_json::json!({"jsonrpc": "2.0", "id": "1", "result": {}});
        t.send(msg.clone()).await.unwrap();
        match tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
        {
            Some(TransportEvent::Message(received)) => assert_eq!(received, msg),
            other => panic!("expected message, got {other:?}"),
        }
        t.close().await.unwrap();
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
            {
                Some(TransportEvent::Closed) => break,
                Some(TransportEvent::Error(err)) => panic!("unexpected error: {err}"),
                Some(TransportEvent::Message(_)) => continue,
                None => panic!("stream ended without Closed"),
            }
        }
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_connection_reset_then_close() {
        let mut t = transport("false", &[]);
        let mut rx = t.start().await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert!(
            matches!(
                first,
                Some(TransportEvent::Error(TransportError::ConnectionReset))
            ),
            "{first:?}"
        );
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert!(matches!(second, Some(TransportEvent::Closed)), "{second:?}");
    }

    #[tokio::test]
    async fn non_jsonrpc_output_is_not_delivered() {
        let mut t = transport("echo", &["not json at all"]);
        let mut rx = t.start().await.unwrap();
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
            {
                Some(TransportEvent::Message(m)) => panic!("unexpected message {m}"),
                Some(TransportEvent::Closed) | None => break,
                Some(TransportEvent::Error(_)) => continue,
            }
        }
    }
}
