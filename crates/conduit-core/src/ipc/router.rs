//! Message routing from a session to its backend.
//!
//! The first message on a connection must be `{"method":"init","id":...}`.
//! It is parsed, the backend is resolved and opened, and the binding sticks for
//! the rest of the connection. Every message after that (and the `init` itself)
//! is forwarded to the backend untouched, without parsing.
//!
//! Anything that cannot be routed is rejected. Rejections are silent unless
//! error replies are enabled, and never close the connection.

use crate::backend::{BackendHandler, BackendRegistry};
use crate::config::ServerOptions;
use crate::error::{ConduitError, Result};
use crate::ipc::protocol::{is_quit, Envelope, ErrorReply};
use crate::ipc::session::ClientSession;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What the dispatcher should do with a routed message.
#[derive(Debug)]
pub enum RouteOutcome {
    /// Write these bytes back to the client.
    Reply(Vec<u8>),
    /// Drop the message; the connection stays open.
    Rejected(ConduitError),
    /// The client asked the whole server to stop.
    Quit,
}

pub struct Router {
    registry: Arc<dyn BackendRegistry>,
    backend_timeout: Option<Duration>,
    error_replies: bool,
}

impl Router {
    pub fn new(registry: Arc<dyn BackendRegistry>, options: &ServerOptions) -> Self {
        Self {
            registry,
            backend_timeout: options.backend_timeout,
            error_replies: options.error_replies,
        }
    }

    /// Route one complete message for `session`.
    pub async fn route<C>(&self, session: &mut ClientSession<C>, message: &[u8]) -> RouteOutcome {
        if is_quit(message) {
            return RouteOutcome::Quit;
        }

        let handler = match session.backend() {
            Some(handler) => handler,
            None => match self.bind(session, message).await {
                Ok(handler) => handler,
                Err(e) => return RouteOutcome::Rejected(e),
            },
        };

        let call = handler.handle(session.session_key(), message);
        match self.call(handler.name(), call).await {
            Ok(response) => RouteOutcome::Reply(response),
            Err(e) => RouteOutcome::Rejected(e),
        }
    }

    /// Bytes to send for a rejection, if error replies are enabled.
    pub fn rejection_reply(&self, err: &ConduitError) -> Option<Vec<u8>> {
        if !self.error_replies {
            return None;
        }
        match ErrorReply::new(err).to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Failed to encode error reply: {}", e);
                None
            }
        }
    }

    async fn bind<C>(
        &self,
        session: &mut ClientSession<C>,
        message: &[u8],
    ) -> Result<Arc<dyn BackendHandler>> {
        let envelope = Envelope::parse(message)?;
        let backend_id = envelope.init_backend_id().ok_or_else(|| ConduitError::Protocol {
            message: format!(
                "expected an init message with an id, got method {:?}",
                envelope.method
            ),
        })?;

        let handler = self
            .registry
            .resolve(backend_id)
            .ok_or_else(|| ConduitError::UnknownBackend {
                id: backend_id.to_string(),
            })?;

        let session_key = self.call(handler.name(), handler.open()).await?;
        debug!("Client {} opened {} session {}", session.id(), backend_id, session_key);
        session.bind(backend_id, handler.clone(), session_key);
        Ok(handler)
    }

    /// Await a backend call, bounded by the configured timeout.
    ///
    /// A panic inside the backend is caught and reported as a backend error,
    /// so it only costs the message that triggered it.
    async fn call<T>(&self, backend: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let guarded = AssertUnwindSafe(fut).catch_unwind();
        let outcome = match self.backend_timeout {
            Some(limit) => tokio::time::timeout(limit, guarded)
                .await
                .map_err(|_| ConduitError::BackendTimeout {
                    backend: backend.to_string(),
                    elapsed: limit,
                })?,
            None => guarded.await,
        };

        outcome.unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            warn!("Backend {} panicked: {}", backend, message);
            Err(ConduitError::backend(backend, format!("panicked: {}", message)))
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
