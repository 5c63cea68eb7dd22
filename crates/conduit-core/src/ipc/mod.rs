//! Local IPC message bus.
//!
//! Foreground clients connect over a per-user Unix socket, bind to a backend
//! with an `init` message, and then exchange length-prefixed messages with it.
//!
//! # Architecture
//!
//! - **Endpoint**: builds the socket path, applies the connection policy, binds
//! - **Driver**: runs accept/read/write out of band and reports completions
//! - **Dispatcher**: single control loop owning every session
//! - **Session**: per-connection buffer, state and backend binding
//! - **Router**: quit handling, backend binding, forwarding
//! - **Protocol**: framing and the routing envelope shared with clients

pub mod completion;
pub mod dispatcher;
pub mod driver;
pub mod policy;
pub mod protocol;
pub mod router;
pub mod session;

#[cfg(unix)]
pub mod client;
#[cfg(unix)]
pub mod endpoint;
#[cfg(unix)]
pub mod server;

pub use completion::{Completion, ConnectionId};
pub use dispatcher::{Dispatcher, ExitReason};
pub use driver::IoDriver;
pub use policy::{ConnectionPolicy, PermissionPolicy};
pub use protocol::{Envelope, ErrorReply};
pub use router::{RouteOutcome, Router};
pub use session::{ClientSession, SessionState};

#[cfg(unix)]
pub use client::IpcClient;
#[cfg(unix)]
pub use driver::{UnixConnection, UnixDriver};
#[cfg(unix)]
pub use endpoint::{BoundEndpoint, ChannelFactory, EndpointAddress};
#[cfg(unix)]
pub use server::{IpcServer, IpcServerHandle};
