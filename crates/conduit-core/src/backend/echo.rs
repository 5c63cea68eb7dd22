//! Diagnostic backend that answers every message with itself.

use super::BackendHandler;
use crate::error::{ConduitError, Result};
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::debug;

/// Echoes each message back and tracks which session keys are open.
#[derive(Debug)]
pub struct EchoBackend {
    name: String,
    sessions: Mutex<HashSet<String>>,
}

impl EchoBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sessions: Mutex::new(HashSet::new()),
        }
    }

    /// Number of currently open sessions.
    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl BackendHandler for EchoBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<String> {
        let key = uuid::Uuid::new_v4().to_string();
        self.sessions
            .lock()
            .map_err(|_| ConduitError::backend(&self.name, "session table poisoned"))?
            .insert(key.clone());
        debug!("{}: opened session {}", self.name, key);
        Ok(key)
    }

    async fn handle(&self, session_key: &str, message: &[u8]) -> Result<Vec<u8>> {
        let known = self
            .sessions
            .lock()
            .map_err(|_| ConduitError::backend(&self.name, "session table poisoned"))?
            .contains(session_key);
        if !known {
            return Err(ConduitError::backend(
                &self.name,
                format!("unknown session {}", session_key),
            ));
        }
        Ok(message.to_vec())
    }

    fn close(&self, session_key: &str) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(session_key);
        }
        debug!("{}: closed session {}", self.name, session_key);
    }
}
