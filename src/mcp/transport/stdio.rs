//! Stdio transport for MCP child-process servers
//!
//! [`StdioTransport`] spawns a child process and talks to it over its
//! stdin/stdout pipes using newline-delimited JSON:
//!
//! - Outbound messages are written to the child's stdin followed by `\n`.
//! - Inbound messages are read from the child's stdout, one JSON object per
//!   line. Blank lines are skipped.
//! - The child's stderr is forwarded to the diagnostic stream and logged at
//!   `DEBUG`. It is never treated as an error.
//!
//! Dropping the transport sends a best-effort SIGTERM (Unix) or `start_kill`
//! (elsewhere) to the child.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use crate::error::{AggregatorError, Result};
use crate::mcp::transport::Transport;

/// How to launch a stdio MCP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioCommand {
    /// Executable name or path.
    pub executable: PathBuf,
    /// Command-line arguments.
    pub args: Vec<String>,
    /// Extra environment variables for the child.
    pub env: HashMap<String, String>,
    /// Working directory for the child.
    pub working_dir: Option<PathBuf>,
    /// Start from the gateway's own environment instead of an empty one.
    pub inherit_env: bool,
}

/// Stdio-based MCP transport that drives a child process.
///
/// # Examples
///
/// ```no_run
/// use std::collections::HashMap;
/// use toolmesh::mcp::transport::stdio::{StdioCommand, StdioTransport};
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let transport = StdioTransport::spawn(StdioCommand {
///     executable: "npx".into(),
///     args: vec!["-y".into(), "@modelcontextprotocol/server-filesystem".into(), "/tmp".into()],
///     env: HashMap::new(),
///     working_dir: None,
///     inherit_env: true,
/// })?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct StdioTransport {
    stdin_tx: mpsc::UnboundedSender<String>,
    stdout_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    stderr_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    child: Arc<Mutex<Child>>,
}

impl StdioTransport {
    /// Spawn the child process and wire up its stdio pipes.
    ///
    /// Three background Tokio tasks start immediately: a stdin writer, a
    /// stdout line reader, and a stderr line reader.
    ///
    /// # Errors
    ///
    /// Returns [`AggregatorError::McpTransport`] if the process cannot be
    /// spawned or if the stdio pipes are unavailable.
    pub fn spawn(command: StdioCommand) -> Result<Self> {
        let mut cmd = Command::new(&command.executable);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !command.inherit_env {
            cmd.env_clear();
        }
        cmd.envs(&command.env);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            AggregatorError::McpTransport(format!(
                "failed to spawn MCP server `{}`: {}",
                command.executable.display(),
                e
            ))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            AggregatorError::McpTransport("child stdin unavailable after spawn".into())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            AggregatorError::McpTransport("child stdout unavailable after spawn".into())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            AggregatorError::McpTransport("child stderr unavailable after spawn".into())
        })?;

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel::<String>();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(msg) = stdin_rx.recv().await {
                let line = format!("{}\n", msg);
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if stdout_tx.send(line.to_string()).is_err() {
                    break;
                }
            }
        });

        let program = command.executable.display().to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(
                    target: "toolmesh::mcp::transport::stdio",
                    program = %program,
                    "mcp server stderr: {}",
                    line
                );
                if stderr_tx.send(line).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            stdin_tx,
            stdout_rx: Arc::new(Mutex::new(stdout_rx)),
            stderr_rx: Arc::new(Mutex::new(stderr_rx)),
            child: Arc::new(Mutex::new(child)),
        })
    }
}

fn line_stream(
    rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
) -> Pin<Box<dyn Stream<Item = String> + Send + 'static>> {
    Box::pin(futures::stream::unfold(rx, |rx| async move {
        let item = rx.lock().await.recv().await?;
        Some((item, rx))
    }))
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: String) -> Result<()> {
        self.stdin_tx
            .send(message)
            .map_err(|e| AggregatorError::McpTransport(format!("stdin channel closed: {}", e)))?;
        Ok(())
    }

    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        line_stream(Arc::clone(&self.stdout_rx))
    }

    fn receive_err(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        line_stream(Arc::clone(&self.stderr_rx))
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // If another task holds the lock, `kill_on_drop` still reaps the child.
        #[cfg(unix)]
        {
            if let Ok(child) = self.child.try_lock() {
                if let Some(pid) = child.id() {
                    // SAFETY: pid is a valid process ID obtained from tokio::process::Child.
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            if let Ok(mut child) = self.child.try_lock() {
                let _ = child.start_kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    fn command(executable: &str, args: &[&str]) -> StdioCommand {
        StdioCommand {
            executable: PathBuf::from(executable),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            working_dir: None,
            inherit_env: true,
        }
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_executable_returns_error() {
        let err = StdioTransport::spawn(command("/nonexistent/binary/that/does/not/exist", &[]))
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"), "unexpected: {err}");
    }

    #[tokio::test]
    async fn test_cat_echoes_sent_line() {
        let Ok(transport) = StdioTransport::spawn(command("cat", &[])) else {
            return;
        };

        let msg = r#"{"jsonrpc":"2.0","id":1,"method":"ping","params":{}}"#.to_string();
        transport.send(msg.clone()).await.unwrap();

        let mut stream = transport.receive();
        let received = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended unexpectedly");
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn test_stderr_lines_arrive_on_diagnostic_stream() {
        let Ok(transport) = StdioTransport::spawn(command("sh", &["-c", "echo warming up >&2"]))
        else {
            return;
        };

        let mut err_stream = transport.receive_err();
        let line = tokio::time::timeout(Duration::from_secs(5), err_stream.next())
            .await
            .expect("timed out")
            .expect("stream ended");
        assert_eq!(line, "warming up");
    }

    #[tokio::test]
    async fn test_stdout_stream_ends_when_child_exits() {
        let Ok(transport) = StdioTransport::spawn(command("true", &[])) else {
            return;
        };

        let mut stream = transport.receive();
        let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("stream should end once the child exits");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_env_is_cleared_unless_inherited() {
        let mut cmd = command("sh", &["-c", "echo \"${TOOLMESH_STDIO_PROBE:-unset}\""]);
        cmd.inherit_env = false;
        cmd.env
            .insert("TOOLMESH_STDIO_PROBE".to_string(), "visible".to_string());
        // An absolute path keeps the lookup independent of the cleared PATH.
        cmd.executable = PathBuf::from("/bin/sh");
        let Ok(transport) = StdioTransport::spawn(cmd) else {
            return;
        };

        let mut stream = transport.receive();
        let line = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out")
            .expect("stream ended");
        assert_eq!(line, "visible");
    }
}
