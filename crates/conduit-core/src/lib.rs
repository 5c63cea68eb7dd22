//! Conduit Core - session-routing IPC server for local clients.
//!
//! Lightweight foreground clients (editors, input contexts) connect to one
//! long-running server over a per-user Unix socket. Each connection binds to a
//! backend with an `init` message and from then on every message is forwarded
//! to that backend and its response written back.
//!
//! # Example
//!
//! ```rust,ignore
//! use conduit_core::{EchoBackend, IpcServer, ServerOptions, StaticRegistry};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> conduit_core::Result<()> {
//!     let registry = StaticRegistry::new().with("echo", Arc::new(EchoBackend::new("echo")));
//!     let mut server = IpcServer::start(ServerOptions::default(), Arc::new(registry)).await?;
//!     println!("listening on {}", server.path().display());
//!
//!     // Runs until a client sends `quit`.
//!     let reason = server.wait().await?;
//!     println!("stopped: {:?}", reason);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod ipc;

// Re-export commonly used types
pub use backend::{BackendHandler, BackendRegistry, EchoBackend, StaticRegistry};
pub use config::{IpcConfig, ServerOptions};
pub use error::{ConduitError, Result};
pub use ipc::{ExitReason, PermissionPolicy};

#[cfg(unix)]
pub use ipc::{IpcClient, IpcServer, IpcServerHandle};
