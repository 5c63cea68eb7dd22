//! Backend handler contract.
//!
//! Backends are the application side of the bus. The server only knows them
//! through two traits:
//!
//! - [`BackendRegistry`] maps the `id` of an `init` message to a handler and is
//!   finalized once at shutdown.
//! - [`BackendHandler`] opens a session, answers messages for it, and closes it.
//!
//! The dispatcher awaits `open` and `handle` inline, so a handler that needs
//! real concurrency should hand work to its own tasks. A panic in a handler
//! rejects the message that caused it and nothing more.

mod echo;
mod registry;

pub use echo::EchoBackend;
pub use registry::StaticRegistry;

use crate::error::Result;
use std::sync::Arc;

/// One backend, serving any number of client sessions.
#[async_trait::async_trait]
pub trait BackendHandler: Send + Sync + 'static {
    /// Name used in logs and error replies.
    fn name(&self) -> &str;

    /// Start a new client session and return its key.
    async fn open(&self) -> Result<String>;

    /// Answer one raw client message. The response is written back unmodified.
    async fn handle(&self, session_key: &str, message: &[u8]) -> Result<Vec<u8>>;

    /// The client went away. Called at most once per key.
    fn close(&self, session_key: &str);
}

/// Lookup from backend id to handler.
pub trait BackendRegistry: Send + Sync + 'static {
    /// Handler for `id`. The bound session holds the returned handler until
    /// teardown, so the registry does not need to keep it alive.
    fn resolve(&self, id: &str) -> Option<Arc<dyn BackendHandler>>;

    /// Release every backend. Called once, after all sessions are closed.
    fn finalize(&self);
}
