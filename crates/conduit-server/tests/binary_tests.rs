//! End-to-end tests for the `conduit` binary.
//!
//! Spawns the real executable with an echo backend in a temporary socket
//! directory and drives it over the socket.

#![cfg(unix)]

use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_conduit"))
}

struct ServerProcess {
    child: tokio::process::Child,
    socket: PathBuf,
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// Start the binary and wait for it to report its socket path.
async fn start_server(socket_dir: &Path, extra: &[&str]) -> ServerProcess {
    let mut child = tokio::process::Command::new(binary())
        .arg("--socket-dir")
        .arg(socket_dir)
        .arg("--echo-backend")
        .arg("echo")
        .args(extra)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn conduit");

    let stdout = child.stdout.take().expect("stdout not captured");
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let line = tokio::time::timeout(Duration::from_secs(20), lines.next_line())
        .await
        .expect("server did not report its socket in time")
        .expect("failed to read stdout")
        .expect("server exited before reporting its socket");
    let socket = PathBuf::from(
        line.strip_prefix("CONDUIT_SOCKET=")
            .unwrap_or_else(|| panic!("unexpected stdout line: {}", line)),
    );

    ServerProcess { child, socket }
}

async fn send(stream: &mut UnixStream, payload: &[u8]) {
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(payload).await.unwrap();
}

async fn recv(stream: &mut UnixStream) -> Vec<u8> {
    let mut len = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut len))
        .await
        .expect("no reply from server")
        .unwrap();
    let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut payload).await.unwrap();
    payload
}

async fn wait_for_exit(server: &mut ServerProcess) -> std::process::ExitStatus {
    tokio::time::timeout(Duration::from_secs(10), server.child.wait())
        .await
        .expect("server did not exit")
        .unwrap()
}

#[tokio::test]
async fn test_echo_session_and_quit() {
    let temp = TempDir::new().unwrap();
    let mut server = start_server(temp.path(), &[]).await;
    assert!(server.socket.starts_with(temp.path()));

    let mut stream = UnixStream::connect(&server.socket).await.unwrap();
    let init = serde_json::to_vec(&json!({"method": "init", "id": "echo"})).unwrap();
    send(&mut stream, &init).await;
    assert_eq!(recv(&mut stream).await, init);

    send(&mut stream, br#"{"method":"ping"}"#).await;
    assert_eq!(recv(&mut stream).await, br#"{"method":"ping"}"#.to_vec());

    let mut control = UnixStream::connect(&server.socket).await.unwrap();
    send(&mut control, b"quit").await;

    let status = wait_for_exit(&mut server).await;
    assert!(status.success());
    assert!(!server.socket.exists());
}

#[tokio::test]
async fn test_error_replies_flag() {
    let temp = TempDir::new().unwrap();
    let _server = start_server(temp.path(), &["--error-replies"]).await;

    let mut stream = UnixStream::connect(&_server.socket).await.unwrap();
    send(&mut stream, br#"{"method":"init","id":"missing"}"#).await;

    let reply: serde_json::Value = serde_json::from_slice(&recv(&mut stream).await).unwrap();
    assert_eq!(reply["success"], false);
    assert_eq!(reply["kind"], "unknown_backend");
}

#[tokio::test]
async fn test_quit_flag_stops_running_server() {
    let temp = TempDir::new().unwrap();
    let mut server = start_server(temp.path(), &[]).await;

    let status = tokio::process::Command::new(binary())
        .arg("--socket-dir")
        .arg(temp.path())
        .arg("--quit")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .unwrap();
    assert!(status.success());

    assert!(wait_for_exit(&mut server).await.success());
}

#[tokio::test]
async fn test_second_instance_refused_without_replace() {
    let temp = TempDir::new().unwrap();
    let _server = start_server(temp.path(), &[]).await;

    let status = tokio::process::Command::new(binary())
        .arg("--socket-dir")
        .arg(temp.path())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .unwrap();
    assert!(!status.success());
}
