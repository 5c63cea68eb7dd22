//! The single control loop of the server.
//!
//! All session state lives here and is only touched from [`Dispatcher::handle`],
//! one completion at a time, in the order the completions were queued. That
//! serialization is what lets sessions go without locks.
//!
//! # Invariants
//!
//! - Exactly one accept is pending while the loop runs.
//! - A session has at most one READ or one WRITE outstanding, never both.
//! - Teardown releases each connection once and closes each backend session once.

use super::completion::{Completion, ConnectionId};
use super::driver::IoDriver;
use super::protocol::encode_frame;
use super::router::{RouteOutcome, Router};
use super::session::{ClientSession, SessionState};
use crate::backend::BackendRegistry;
use crate::config::{IpcConfig, ServerOptions};
use crate::error::ConduitError;
use std::collections::HashMap;
use std::io;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Why the dispatcher stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A client sent the `quit` command.
    Quit,
    /// The owner requested shutdown.
    Shutdown,
    /// Every completion sender went away.
    Disconnected,
}

pub struct Dispatcher<D: IoDriver> {
    driver: D,
    router: Router,
    registry: Arc<dyn BackendRegistry>,
    sessions: HashMap<ConnectionId, ClientSession<D::Conn>>,
    accept_pending: bool,
    accept_failures: u32,
    next_id: u64,
    max_message_size: usize,
    finalized: bool,
}

impl<D: IoDriver> Dispatcher<D> {
    pub fn new(driver: D, registry: Arc<dyn BackendRegistry>, options: &ServerOptions) -> Self {
        Self {
            driver,
            router: Router::new(registry.clone(), options),
            registry,
            sessions: HashMap::new(),
            accept_pending: false,
            accept_failures: 0,
            next_id: 1,
            max_message_size: options.max_message_size.min(u32::MAX as usize),
            finalized: false,
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, id: ConnectionId) -> Option<&ClientSession<D::Conn>> {
        self.sessions.get(&id)
    }

    pub fn is_accept_pending(&self) -> bool {
        self.accept_pending
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Arm the first accept.
    pub fn start(&mut self) {
        if !self.accept_pending {
            self.begin_accept(Duration::ZERO);
        }
    }

    /// Run until `quit`, shutdown, or the queue closes.
    pub async fn run(mut self, mut completions: mpsc::UnboundedReceiver<Completion<D::Conn>>) -> ExitReason {
        self.start();
        while let Some(completion) = completions.recv().await {
            if let ControlFlow::Break(reason) = self.handle(completion).await {
                info!("Dispatcher stopped: {:?}", reason);
                return reason;
            }
        }
        self.shutdown();
        ExitReason::Disconnected
    }

    /// Handle one completion.
    pub async fn handle(&mut self, completion: Completion<D::Conn>) -> ControlFlow<ExitReason> {
        match completion {
            Completion::Accept(result) => {
                self.on_accept(result);
                ControlFlow::Continue(())
            }
            Completion::Read { conn, result } => self.on_read(conn, result).await,
            Completion::Write { conn, result } => self.on_write(conn, result).await,
            Completion::Shutdown => {
                info!("Shutdown requested");
                self.shutdown();
                ControlFlow::Break(ExitReason::Shutdown)
            }
        }
    }

    fn begin_accept(&mut self, delay: Duration) {
        debug_assert!(!self.accept_pending, "second accept issued");
        self.accept_pending = true;
        self.driver.begin_accept(delay);
    }

    fn on_accept(&mut self, result: io::Result<D::Conn>) {
        self.accept_pending = false;

        match result {
            Ok(conn) => {
                self.accept_failures = 0;
                let id = ConnectionId::new(self.next_id);
                self.next_id += 1;
                debug!("Client {} connected ({:?})", id, conn);
                self.sessions.insert(id, ClientSession::new(id, conn));
                self.begin_read(id);
            }
            Err(e) => {
                self.accept_failures += 1;
                warn!("Accept failed ({} in a row): {}", self.accept_failures, e);
            }
        }

        let delay = if self.accept_failures > 0 {
            IpcConfig::ACCEPT_RETRY_DELAY
        } else {
            Duration::ZERO
        };
        self.begin_accept(delay);
    }

    fn begin_read(&mut self, id: ConnectionId) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        session.transition(SessionState::Reading);
        if let Some(conn) = session.connection_mut() {
            self.driver.begin_read(id, conn);
        }
    }

    fn begin_write(&mut self, id: ConnectionId, payload: &[u8]) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        session.transition(SessionState::Writing);
        if let Some(conn) = session.connection_mut() {
            self.driver.begin_write(id, conn, encode_frame(payload));
        }
    }

    async fn on_read(&mut self, id: ConnectionId, result: io::Result<Vec<u8>>) -> ControlFlow<ExitReason> {
        let Some(session) = self.sessions.get_mut(&id) else {
            debug!("Discarding read completion for closed client {}", id);
            return ControlFlow::Continue(());
        };
        if session.state() != SessionState::Reading {
            warn!("Client {}: read completed while {:?}", id, session.state());
            return ControlFlow::Continue(());
        }

        match result {
            Ok(chunk) if chunk.is_empty() => {
                debug!("Client {} disconnected", id);
                self.close_session(id);
                ControlFlow::Continue(())
            }
            Ok(chunk) => {
                session.append(&chunk);
                self.pump(id).await
            }
            Err(e) => {
                debug!("Read from client {} failed: {}", id, e);
                self.close_session(id);
                ControlFlow::Continue(())
            }
        }
    }

    async fn on_write(&mut self, id: ConnectionId, result: io::Result<usize>) -> ControlFlow<ExitReason> {
        let Some(session) = self.sessions.get(&id) else {
            debug!("Discarding write completion for closed client {}", id);
            return ControlFlow::Continue(());
        };
        if session.state() != SessionState::Writing {
            warn!("Client {}: write completed while {:?}", id, session.state());
            return ControlFlow::Continue(());
        }

        match result {
            Ok(_) => self.pump(id).await,
            Err(e) => {
                debug!("Write to client {} failed: {}", id, e);
                self.close_session(id);
                ControlFlow::Continue(())
            }
        }
    }

    /// Route buffered messages until one produces a write or more data is needed.
    async fn pump(&mut self, id: ConnectionId) -> ControlFlow<ExitReason> {
        loop {
            let Some(session) = self.sessions.get_mut(&id) else {
                return ControlFlow::Continue(());
            };

            let message = match session.next_message(self.max_message_size) {
                Ok(Some(message)) => message,
                Ok(None) => {
                    self.begin_read(id);
                    return ControlFlow::Continue(());
                }
                Err(e) => {
                    warn!("Dropping client {}: {}", id, e);
                    self.close_session(id);
                    return ControlFlow::Continue(());
                }
            };

            session.transition(SessionState::Routing);
            let rejected = match self.router.route(session, &message).await {
                RouteOutcome::Quit => {
                    info!("Client {} requested server shutdown", id);
                    self.shutdown();
                    return ControlFlow::Break(ExitReason::Quit);
                }
                RouteOutcome::Reply(response) if response.len() <= self.max_message_size => {
                    self.begin_write(id, &response);
                    return ControlFlow::Continue(());
                }
                // Clients cannot read a frame above the limit.
                RouteOutcome::Reply(response) => ConduitError::FrameTooLarge {
                    len: response.len(),
                    max: self.max_message_size,
                },
                RouteOutcome::Rejected(err) => err,
            };

            warn!("Dropping message from client {}: {}", id, rejected);
            if let Some(reply) = self.router.rejection_reply(&rejected) {
                self.begin_write(id, &reply);
                return ControlFlow::Continue(());
            }
        }
    }

    /// Tear down a session. Returns false if it was already gone.
    pub fn close_session(&mut self, id: ConnectionId) -> bool {
        let Some(mut session) = self.sessions.remove(&id) else {
            return false;
        };
        if let Some(conn) = session.shutdown() {
            self.driver.close(id, conn);
        }
        debug!("Client {} closed, {} active", id, self.sessions.len());
        true
    }

    /// Close every session, then finalize the registry once.
    pub fn shutdown(&mut self) {
        if self.finalized {
            return;
        }
        let ids: Vec<ConnectionId> = self.sessions.keys().copied().collect();
        info!("Closing {} active client(s)", ids.len());
        for id in ids {
            self.close_session(id);
        }
        self.registry.finalize();
        self.finalized = true;
    }
}
