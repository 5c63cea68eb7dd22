//! Unix socket client for a running Conduit server.
//!
//! Used by foreground tools, by `conduit --quit`, and by the tests. Each call
//! writes one frame and waits for one frame back.

use super::protocol::{read_frame, write_frame};
use crate::config::IpcConfig;
use crate::error::{ConduitError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::debug;

/// A single client connection.
#[derive(Debug)]
pub struct IpcClient {
    stream: UnixStream,
    path: PathBuf,
}

impl IpcClient {
    /// Connect to the server listening at `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stream = tokio::time::timeout(IpcConfig::CLIENT_CONNECT_TIMEOUT, UnixStream::connect(&path))
            .await
            .map_err(|_| ConduitError::Timeout(IpcConfig::CLIENT_CONNECT_TIMEOUT))?
            .map_err(|e| ConduitError::io_with_path(e, &path))?;

        debug!("IPC client connected to {}", path.display());
        Ok(Self { stream, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send one framed message.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        write_frame(&mut self.stream, payload).await
    }

    /// Write bytes as-is, without framing.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Wait for the next message. `None` means the server closed the connection.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        read_frame(&mut self.stream).await
    }

    /// Like [`recv`](Self::recv), but gives up after `limit`.
    ///
    /// A timeout in the middle of a frame leaves the stream unusable.
    pub async fn recv_timeout(&mut self, limit: Duration) -> Result<Option<Vec<u8>>> {
        tokio::time::timeout(limit, self.recv())
            .await
            .map_err(|_| ConduitError::Timeout(limit))?
    }

    /// Send a message and wait for its reply.
    pub async fn call(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.send(payload).await?;
        self.recv_timeout(IpcConfig::CLIENT_CALL_TIMEOUT)
            .await?
            .ok_or(ConduitError::ConnectionClosed)
    }

    /// Ask the server at `path` to shut down.
    ///
    /// Waits briefly for the server to drop the connection. The server sends no
    /// reply to `quit`, so a timeout here is not an error.
    pub async fn request_quit(path: impl AsRef<Path>) -> Result<()> {
        let mut client = Self::connect(path).await?;
        client.send(IpcConfig::QUIT_TOKEN).await?;
        match client.recv_timeout(IpcConfig::QUIT_WAIT_TIMEOUT).await {
            Ok(None) => debug!("Server at {} closed the connection", client.path.display()),
            Ok(Some(_)) => debug!("Unexpected reply to quit from {}", client.path.display()),
            Err(e) if e.is_connection_fatal() => {}
            Err(ConduitError::Timeout(_)) => {
                debug!("Server at {} still connected after quit", client.path.display())
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}
