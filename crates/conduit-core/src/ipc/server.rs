//! Unix socket IPC server.
//!
//! Binds the per-user endpoint, then runs the [`Dispatcher`] over a
//! [`UnixDriver`] in one background task. All routing happens in that task; the
//! driver's accept/read/write tasks only move bytes and report back.

use super::completion::Completion;
use super::dispatcher::{Dispatcher, ExitReason};
use super::driver::{UnixConnection, UnixDriver};
use super::endpoint::{ChannelFactory, EndpointAddress};
use crate::backend::BackendRegistry;
use crate::config::{IpcConfig, ServerOptions};
use crate::error::{ConduitError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Handle to a running server. Dropping it requests a graceful shutdown.
pub struct IpcServerHandle {
    path: PathBuf,
    control_tx: mpsc::UnboundedSender<Completion<UnixConnection>>,
    task_handle: Option<JoinHandle<ExitReason>>,
}

impl IpcServerHandle {
    /// Socket path the server is listening on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ask the dispatcher to close every session and stop.
    pub fn shutdown(&self) {
        if self.control_tx.send(Completion::Shutdown).is_err() {
            debug!("IPC server already stopped");
        }
    }

    /// Returns true once the dispatcher has exited.
    pub fn is_finished(&self) -> bool {
        self.task_handle.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for the dispatcher to exit.
    ///
    /// Cancel-safe: dropping the returned future leaves the server running and
    /// the handle usable.
    pub async fn wait(&mut self) -> Result<ExitReason> {
        let task = self
            .task_handle
            .as_mut()
            .ok_or_else(|| ConduitError::Other("IPC server already joined".to_string()))?;
        let result = task.await;
        self.task_handle = None;
        result.map_err(|e| ConduitError::Other(format!("IPC server task failed: {}", e)))
    }
}

impl Drop for IpcServerHandle {
    fn drop(&mut self) {
        if self.task_handle.is_some() {
            self.shutdown();
        }
    }
}

/// IPC server that listens for client connections.
pub struct IpcServer;

impl IpcServer {
    /// Bind the endpoint described by `options` and start serving.
    ///
    /// Endpoint and authorization failures are returned here; once this
    /// succeeds, no connection error can stop the server.
    pub async fn start(
        options: ServerOptions,
        registry: Arc<dyn BackendRegistry>,
    ) -> Result<IpcServerHandle> {
        let address = EndpointAddress::from_options(&options)?;
        let factory = ChannelFactory::new(address, options.policy.clone());
        let endpoint = factory.bind(options.replace_existing).await?;
        let path = endpoint.path().to_path_buf();

        let (tx, rx) = mpsc::unbounded_channel();
        let driver = UnixDriver::new(endpoint, tx.clone(), IpcConfig::READ_CHUNK_SIZE);
        let dispatcher = Dispatcher::new(driver, registry, &options);

        info!("IPC server listening on {}", path.display());
        let task_handle = tokio::spawn(dispatcher.run(rx));

        Ok(IpcServerHandle {
            path,
            control_tx: tx,
            task_handle: Some(task_handle),
        })
    }
}
