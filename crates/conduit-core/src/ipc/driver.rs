//! Asynchronous I/O issued on behalf of the dispatcher.
//!
//! The dispatcher never performs I/O itself. It asks an [`IoDriver`] to start
//! an accept, a read or a write, and the driver later posts the outcome as a
//! [`Completion`]. Swapping the driver is how the state machine is tested
//! without sockets.

use super::completion::{Completion, ConnectionId};
use std::fmt::Debug;
use std::time::Duration;

/// Starts operations whose results arrive later as completions.
pub trait IoDriver: Send + 'static {
    /// Connection handle owned by a client session.
    type Conn: Debug + Send + 'static;

    /// Start the single pending accept, optionally after a delay.
    fn begin_accept(&mut self, delay: Duration);

    /// Start one READ on `conn`.
    fn begin_read(&mut self, id: ConnectionId, conn: &mut Self::Conn);

    /// Start one WRITE of an already framed buffer.
    fn begin_write(&mut self, id: ConnectionId, conn: &mut Self::Conn, frame: Vec<u8>);

    /// Release the connection. In-flight operations on it are abandoned.
    fn close(&mut self, id: ConnectionId, conn: Self::Conn);
}

#[cfg(unix)]
pub use unix::{UnixConnection, UnixDriver};

#[cfg(unix)]
mod unix {
    use super::*;
    use crate::ipc::endpoint::BoundEndpoint;
    use std::fmt;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::UnixStream;
    use tokio::sync::{mpsc, Mutex};
    use tokio::task::JoinHandle;
    use tracing::debug;

    /// One accepted Unix socket connection.
    ///
    /// The halves sit behind mutexes so a spawned operation can borrow them
    /// while the session keeps ownership. With at most one read and one write
    /// in flight the locks are never contended.
    pub struct UnixConnection {
        reader: Arc<Mutex<OwnedReadHalf>>,
        writer: Arc<Mutex<OwnedWriteHalf>>,
        read_task: Option<JoinHandle<()>>,
        write_task: Option<JoinHandle<()>>,
        // Peer credentials, shown when the dispatcher logs the connection.
        peer_uid: Option<u32>,
        peer_pid: Option<i32>,
    }

    impl UnixConnection {
        pub fn new(stream: UnixStream) -> Self {
            let cred = stream.peer_cred().ok();
            let (reader, writer) = stream.into_split();
            Self {
                reader: Arc::new(Mutex::new(reader)),
                writer: Arc::new(Mutex::new(writer)),
                read_task: None,
                write_task: None,
                peer_uid: cred.map(|c| c.uid()),
                peer_pid: cred.and_then(|c| c.pid()),
            }
        }
    }

    impl fmt::Debug for UnixConnection {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("UnixConnection")
                .field("peer_uid", &self.peer_uid)
                .field("peer_pid", &self.peer_pid)
                .finish()
        }
    }

    impl Drop for UnixConnection {
        fn drop(&mut self) {
            // Aborted tasks drop their half clones, which closes the socket.
            for task in [self.read_task.take(), self.write_task.take()].into_iter().flatten() {
                task.abort();
            }
        }
    }

    /// Tokio-backed driver over a bound Unix socket.
    pub struct UnixDriver {
        endpoint: Arc<BoundEndpoint>,
        completions: mpsc::UnboundedSender<Completion<UnixConnection>>,
        accept_task: Option<JoinHandle<()>>,
        chunk_size: usize,
    }

    impl UnixDriver {
        pub fn new(
            endpoint: BoundEndpoint,
            completions: mpsc::UnboundedSender<Completion<UnixConnection>>,
            chunk_size: usize,
        ) -> Self {
            Self {
                endpoint: Arc::new(endpoint),
                completions,
                accept_task: None,
                chunk_size,
            }
        }
    }

    impl Drop for UnixDriver {
        fn drop(&mut self) {
            if let Some(task) = self.accept_task.take() {
                task.abort();
            }
        }
    }

    impl IoDriver for UnixDriver {
        type Conn = UnixConnection;

        fn begin_accept(&mut self, delay: Duration) {
            let endpoint = self.endpoint.clone();
            let tx = self.completions.clone();
            self.accept_task = Some(tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let result = endpoint
                    .listener()
                    .accept()
                    .await
                    .map(|(stream, _addr)| UnixConnection::new(stream));
                let _ = tx.send(Completion::Accept(result));
            }));
        }

        fn begin_read(&mut self, id: ConnectionId, conn: &mut UnixConnection) {
            let reader = conn.reader.clone();
            let tx = self.completions.clone();
            let chunk_size = self.chunk_size;
            conn.read_task = Some(tokio::spawn(async move {
                let mut reader = reader.lock().await;
                let mut buf = vec![0u8; chunk_size];
                let result = reader.read(&mut buf).await.map(|n| {
                    buf.truncate(n);
                    buf
                });
                let _ = tx.send(Completion::Read { conn: id, result });
            }));
        }

        fn begin_write(&mut self, id: ConnectionId, conn: &mut UnixConnection, frame: Vec<u8>) {
            let writer = conn.writer.clone();
            let tx = self.completions.clone();
            conn.write_task = Some(tokio::spawn(async move {
                let mut writer = writer.lock().await;
                let result = async {
                    writer.write_all(&frame).await?;
                    writer.flush().await?;
                    Ok::<_, std::io::Error>(frame.len())
                }
                .await;
                let _ = tx.send(Completion::Write { conn: id, result });
            }));
        }

        fn close(&mut self, id: ConnectionId, conn: UnixConnection) {
            debug!("Releasing connection {} ({:?})", id, conn);
            drop(conn);
        }
    }
}
