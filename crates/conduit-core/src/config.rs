//! Centralized configuration for Conduit.
//!
//! Compile-time constants live in [`IpcConfig`]; per-run settings are carried by
//! [`ServerOptions`], which the binary fills in from its command line.

use crate::ipc::policy::{ConnectionPolicy, PermissionPolicy};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// IPC limits, names and timeouts.
pub struct IpcConfig;

impl IpcConfig {
    /// Bytes requested by each READ operation.
    pub const READ_CHUNK_SIZE: usize = 1024;
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

    pub const DEFAULT_NAMESPACE: &'static str = "Conduit";
    pub const DEFAULT_ENDPOINT: &'static str = "Launcher";

    /// Raw payload that shuts the whole server down.
    pub const QUIT_TOKEN: &'static [u8] = b"quit";
    /// Method that binds a connection to a backend.
    pub const INIT_METHOD: &'static str = "init";

    pub const BACKEND_TIMEOUT: Duration = Duration::from_secs(10);
    pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

    pub const CLIENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const CLIENT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
    /// How long `request_quit` waits for the old server to go away.
    pub const QUIT_WAIT_TIMEOUT: Duration = Duration::from_secs(1);
}

/// Runtime options for one server run.
///
/// # Example
///
/// ```rust,ignore
/// use conduit_core::ServerOptions;
///
/// let options = ServerOptions::default()
///     .socket_dir("/tmp/conduit-test")
///     .endpoint("Launcher")
///     .replace_existing(true);
/// ```
#[derive(Clone)]
pub struct ServerOptions {
    /// Base directory for the socket; `None` uses the user's runtime dir.
    pub socket_dir: Option<PathBuf>,
    pub namespace: String,
    pub endpoint: String,
    /// Ask a running server on the same address to quit instead of failing.
    pub replace_existing: bool,
    pub policy: Arc<dyn ConnectionPolicy>,
    /// Upper bound for a single backend call. `None` waits forever.
    pub backend_timeout: Option<Duration>,
    /// Write a JSON error object instead of staying silent on routing failures.
    pub error_replies: bool,
    pub max_message_size: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            socket_dir: None,
            namespace: IpcConfig::DEFAULT_NAMESPACE.to_string(),
            endpoint: IpcConfig::DEFAULT_ENDPOINT.to_string(),
            replace_existing: false,
            policy: Arc::new(PermissionPolicy::owner_only()),
            backend_timeout: Some(IpcConfig::BACKEND_TIMEOUT),
            error_replies: false,
            max_message_size: IpcConfig::MAX_MESSAGE_SIZE,
        }
    }
}

impl ServerOptions {
    /// Override the base directory the endpoint is created under.
    pub fn socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = Some(dir.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Take over the address from a running server.
    ///
    /// Default: `false` (startup fails with `AlreadyRunning`)
    pub fn replace_existing(mut self, enable: bool) -> Self {
        self.replace_existing = enable;
        self
    }

    /// Authorization policy applied to the endpoint when it is created.
    ///
    /// Default: owner-only permissions
    pub fn policy(mut self, policy: Arc<dyn ConnectionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Bound every backend `open`/`handle` call.
    ///
    /// Default: `Some(IpcConfig::BACKEND_TIMEOUT)`
    pub fn backend_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.backend_timeout = timeout;
        self
    }

    /// Reply with `{"success":false,...}` when a message cannot be routed.
    ///
    /// Default: `false` (routing failures are silent)
    pub fn error_replies(mut self, enable: bool) -> Self {
        self.error_replies = enable;
        self
    }

    /// Largest frame accepted from or written to a client.
    ///
    /// Default: `IpcConfig::MAX_MESSAGE_SIZE`. Capped at the 32-bit header limit.
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes.min(u32::MAX as usize);
        self
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("socket_dir", &self.socket_dir)
            .field("namespace", &self.namespace)
            .field("endpoint", &self.endpoint)
            .field("replace_existing", &self.replace_existing)
            .field("policy", &self.policy)
            .field("backend_timeout", &self.backend_timeout)
            .field("error_replies", &self.error_replies)
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}
