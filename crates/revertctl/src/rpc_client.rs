//! RPC Client - Unix socket client for communicating with the daemon

use anyhow::{Context, Result};
use revertit_common::ipc::{Method, Request, Response, ResponseData};
use revertit_common::paths;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::sleep;

static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// RPC Client for communicating with the daemon
pub struct RpcClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl RpcClient {
    /// Connect to the daemon with retry logic and errno-specific hints.
    pub async fn connect(socket_path: Option<&str>) -> Result<Self> {
        let path = paths::discover_socket_path(socket_path);
        let max_retries = 5;
        let mut retry_delay = Duration::from_millis(50);

        for attempt in 0..max_retries {
            match tokio::time::timeout(Duration::from_millis(500), UnixStream::connect(&path)).await
            {
                Ok(Ok(stream)) => {
                    let (reader, writer) = stream.into_split();
                    return Ok(Self {
                        reader: BufReader::new(reader),
                        writer,
                    });
                }
                Ok(Err(e)) if attempt == max_retries - 1 => {
                    return Err(Self::socket_error_with_hint(&path.display().to_string(), e));
                }
                _ => {
                    sleep(retry_delay).await;
                    retry_delay = (retry_delay * 2).min(Duration::from_millis(500));
                }
            }
        }

        anyhow::bail!(
            "Failed to connect to daemon at {}. Is revertd running?",
            path.display()
        )
    }

    fn socket_error_with_hint(path: &str, error: std::io::Error) -> anyhow::Error {
        use std::io::ErrorKind;

        let hint = match error.kind() {
            ErrorKind::NotFound => format!(
                "Socket not found at {}. Is revertd running?\n\
                 Try: sudo systemctl status revertd",
                path
            ),
            ErrorKind::PermissionDenied => format!(
                "Permission denied on {}. revertctl needs access to the \
                 daemon socket (run as root or join its group).",
                path
            ),
            ErrorKind::ConnectionRefused | ErrorKind::TimedOut => format!(
                "Daemon not responding on {}.\n\
                 Socket exists but revertd is not accepting connections.\n\
                 Try: sudo systemctl restart revertd",
                path
            ),
            _ => format!("Failed to connect to daemon at {}: {}", path, error),
        };

        anyhow::Error::new(error).context(hint)
    }

    /// Send a request and get a response.
    pub async fn call(&mut self, method: Method) -> Result<ResponseData> {
        let timeout = Duration::from_secs(30);
        tokio::time::timeout(timeout, self.call_inner(method))
            .await
            .map_err(|_| anyhow::anyhow!("RPC call timed out after {:?}", timeout))?
    }

    async fn call_inner(&mut self, method: Method) -> Result<ResponseData> {
        let id = REQUEST_ID.fetch_add(1, Ordering::SeqCst);
        let request = Request { id, method };

        let request_json = serde_json::to_string(&request)? + "\n";
        self.writer
            .write_all(request_json.as_bytes())
            .await
            .context("Failed to send request")?;

        let mut line = String::new();
        self.reader
            .read_line(&mut line)
            .await
            .context("Failed to read response")?;

        let response: Response = serde_json::from_str(&line).context("Failed to parse response")?;

        if response.id != id {
            anyhow::bail!("Response ID mismatch");
        }

        response
            .result
            .map_err(|e| anyhow::anyhow!("Daemon error: {}", e))
    }
}
