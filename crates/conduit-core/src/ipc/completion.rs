//! Completed asynchronous operations, as seen by the dispatcher.
//!
//! Accept, read and write run out of band. Each posts exactly one
//! [`Completion`] into the dispatcher's queue when it finishes. Completions name
//! their session by [`ConnectionId`] only; ids are never reused, so a completion
//! for a session that was already torn down simply finds nothing and is dropped.

use std::fmt;
use std::io;

/// Identity of one accepted connection for the lifetime of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A finished operation. `C` is the driver's connection type.
pub enum Completion<C> {
    /// The pending accept finished.
    Accept(io::Result<C>),
    /// A READ finished. An empty buffer means the peer closed the connection.
    Read {
        conn: ConnectionId,
        result: io::Result<Vec<u8>>,
    },
    /// A WRITE finished; carries the number of bytes written.
    Write {
        conn: ConnectionId,
        result: io::Result<usize>,
    },
    /// Stop the server the same way a `quit` message does.
    Shutdown,
}

impl<C> fmt::Debug for Completion<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Accept(result) => f
                .debug_tuple("Accept")
                .field(&result.as_ref().map(|_| "connected"))
                .finish(),
            Completion::Read { conn, result } => f
                .debug_struct("Read")
                .field("conn", conn)
                .field("result", &result.as_ref().map(|b| b.len()))
                .finish(),
            Completion::Write { conn, result } => f
                .debug_struct("Write")
                .field("conn", conn)
                .field("result", result)
                .finish(),
            Completion::Shutdown => f.write_str("Shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_payload() {
        let read: Completion<()> = Completion::Read {
            conn: ConnectionId::new(3),
            result: Ok(vec![1, 2]),
        };
        assert_eq!(format!("{:?}", read), "Read { conn: ConnectionId(3), result: Ok(2) }");
        assert_eq!(format!("{:?}", Completion::<()>::Shutdown), "Shutdown");
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(7).to_string(), "#7");
    }
}
