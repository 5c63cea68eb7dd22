//! Per-connection state.
//!
//! A session moves through a small state machine driven only by the
//! dispatcher:
//!
//! ```text
//! AwaitingConnect -> Reading -> Routing -> Writing -> Reading -> ...
//!                        \          \          \
//!                         +----------+----------+--> Closed
//! ```
//!
//! `Routing` may also fall straight back to `Reading` when a message is dropped
//! without a reply. A session never has a read and a write outstanding at once.

use crate::backend::BackendHandler;
use crate::error::Result;
use crate::ipc::completion::ConnectionId;
use crate::ipc::protocol::take_frame;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, first read not yet issued.
    AwaitingConnect,
    /// One READ outstanding.
    Reading,
    /// A complete message is being routed.
    Routing,
    /// One WRITE outstanding.
    Writing,
    Closed,
}

/// Sticky link from a session to its backend.
///
/// Holds the handler until teardown, so `close` always reaches the backend
/// that issued the key, whether or not the registry still holds it.
pub struct BackendBinding {
    backend_id: String,
    handler: Arc<dyn BackendHandler>,
    session_key: String,
}

impl fmt::Debug for BackendBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendBinding")
            .field("backend_id", &self.backend_id)
            .field("handler", &self.handler.name())
            .field("session_key", &self.session_key)
            .finish()
    }
}

impl BackendBinding {
    pub fn session_key(&self) -> &str {
        &self.session_key
    }
}

/// State for one connected client.
#[derive(Debug)]
pub struct ClientSession<C> {
    id: ConnectionId,
    connection: Option<C>,
    read_buffer: BytesMut,
    binding: Option<BackendBinding>,
    state: SessionState,
}

impl<C> ClientSession<C> {
    pub fn new(id: ConnectionId, connection: C) -> Self {
        Self {
            id,
            connection: Some(connection),
            read_buffer: BytesMut::new(),
            binding: None,
            state: SessionState::AwaitingConnect,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!("Client {}: {:?} -> {:?}", self.id, self.state, next);
        }
        self.state = next;
    }

    pub fn connection_mut(&mut self) -> Option<&mut C> {
        self.connection.as_mut()
    }

    pub fn buffered_len(&self) -> usize {
        self.read_buffer.len()
    }

    /// Add bytes from a completed READ.
    pub fn append(&mut self, chunk: &[u8]) {
        self.read_buffer.extend_from_slice(chunk);
    }

    /// Remove the next complete message from the buffer, if there is one.
    pub fn next_message(&mut self, max_len: usize) -> Result<Option<Bytes>> {
        take_frame(&mut self.read_buffer, max_len)
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    /// Key issued by the bound backend; empty when unbound.
    pub fn session_key(&self) -> &str {
        self.binding.as_ref().map(|b| b.session_key()).unwrap_or("")
    }

    /// Handler of the bound backend.
    pub fn backend(&self) -> Option<Arc<dyn BackendHandler>> {
        self.binding.as_ref().map(|b| b.handler.clone())
    }

    pub fn bind(
        &mut self,
        backend_id: impl Into<String>,
        handler: Arc<dyn BackendHandler>,
        session_key: String,
    ) {
        let backend_id = backend_id.into();
        debug!("Client {} bound to {} as {}", self.id, backend_id, session_key);
        self.binding = Some(BackendBinding {
            backend_id,
            handler,
            session_key,
        });
    }

    /// Tear the session down.
    ///
    /// Notifies the bound backend, releases its handler, clears the buffer and
    /// hands back the connection for release. Later calls return `None` and
    /// notify nobody. A panicking `close` is logged and does not stop teardown.
    pub fn shutdown(&mut self) -> Option<C> {
        if let Some(binding) = self.binding.take() {
            let BackendBinding {
                backend_id,
                handler,
                session_key,
            } = binding;
            let closed = panic::catch_unwind(AssertUnwindSafe(|| handler.close(&session_key)));
            if closed.is_err() {
                warn!(
                    "Client {}: backend {} panicked closing session {}",
                    self.id, backend_id, session_key
                );
            }
        }
        self.read_buffer.clear();
        self.transition(SessionState::Closed);
        self.connection.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::encode_frame;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingBackend {
        closed: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl BackendHandler for CountingBackend {
        fn name(&self) -> &str {
            "counting"
        }

        async fn open(&self) -> Result<String> {
            Ok("S1".to_string())
        }

        async fn handle(&self, _key: &str, message: &[u8]) -> Result<Vec<u8>> {
            Ok(message.to_vec())
        }

        fn close(&self, session_key: &str) {
            self.closed.lock().unwrap().push(session_key.to_string());
        }
    }

    #[test]
    fn test_new_session_is_unbound() {
        let session = ClientSession::new(ConnectionId::new(1), ());
        assert_eq!(session.state(), SessionState::AwaitingConnect);
        assert!(!session.is_bound());
        assert_eq!(session.session_key(), "");
    }

    #[test]
    fn test_messages_reassemble_from_chunks() {
        let mut session = ClientSession::new(ConnectionId::new(1), ());
        let frame = encode_frame(b"{\"method\":\"ping\"}");
        let (head, tail) = frame.split_at(6);

        session.append(head);
        assert!(session.next_message(1024).unwrap().is_none());
        session.append(tail);
        let message = session.next_message(1024).unwrap().unwrap();
        assert_eq!(&message[..], b"{\"method\":\"ping\"}");
        assert_eq!(session.buffered_len(), 0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let backend = Arc::new(CountingBackend::default());
        let handler: Arc<dyn BackendHandler> = backend.clone();
        let mut session = ClientSession::new(ConnectionId::new(1), "conn");
        session.bind("backend-X", handler.clone(), "S1".to_string());

        assert_eq!(session.shutdown(), Some("conn"));
        assert_eq!(session.shutdown(), None);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(*backend.closed.lock().unwrap(), vec!["S1".to_string()]);
    }

    #[test]
    fn test_binding_keeps_unretained_backend_alive() {
        let backend = Arc::new(CountingBackend::default());
        let mut session = ClientSession::new(ConnectionId::new(1), ());
        session.bind("backend-X", backend.clone(), "S1".to_string());
        assert_eq!(Arc::strong_count(&backend), 2);

        assert!(session.backend().is_some());
        assert_eq!(session.shutdown(), Some(()));
        assert_eq!(*backend.closed.lock().unwrap(), vec!["S1".to_string()]);
        // Teardown releases the handler.
        assert_eq!(Arc::strong_count(&backend), 1);
    }

    struct PanickyBackend;

    #[async_trait::async_trait]
    impl BackendHandler for PanickyBackend {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn open(&self) -> Result<String> {
            Ok("S1".to_string())
        }

        async fn handle(&self, _key: &str, message: &[u8]) -> Result<Vec<u8>> {
            Ok(message.to_vec())
        }

        fn close(&self, _session_key: &str) {
            panic!("close failed");
        }
    }

    #[test]
    fn test_panicking_close_still_tears_down() {
        let mut session = ClientSession::new(ConnectionId::new(1), "conn");
        session.bind("panicky", Arc::new(PanickyBackend), "S1".to_string());

        assert_eq!(session.shutdown(), Some("conn"));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_bound());
    }
}
