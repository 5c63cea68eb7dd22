//! Listening endpoint creation.
//!
//! The endpoint is a Unix domain socket at a per-user, per-namespace path:
//!
//! ```text
//! <runtime dir>/<username>/<namespace>/<endpoint>
//! ```
//!
//! [`ChannelFactory`] creates the directories, applies the connection policy,
//! deals with a socket file left behind by an earlier run, and binds. It is used
//! once at startup; afterwards the accept loop owns the [`BoundEndpoint`].

use super::client::IpcClient;
use super::policy::ConnectionPolicy;
use crate::config::{IpcConfig, ServerOptions};
use crate::error::{ConduitError, Result};
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// `sun_path` is 108 bytes on Linux and 104 on macOS, including the NUL.
const MAX_SOCKET_PATH_LEN: usize = 103;

/// Per-user address of the listening socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddress {
    base: PathBuf,
    user: String,
    namespace: String,
    name: String,
}

impl EndpointAddress {
    pub fn new(
        base: impl Into<PathBuf>,
        user: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self> {
        let address = Self {
            base: base.into(),
            user: user.into(),
            namespace: namespace.into(),
            name: name.into(),
        };

        for (field, value) in [
            ("user", &address.user),
            ("namespace", &address.namespace),
            ("endpoint", &address.name),
        ] {
            validate_segment(field, value)?;
        }

        let len = address.path().as_os_str().len();
        if len > MAX_SOCKET_PATH_LEN {
            return Err(ConduitError::Endpoint {
                message: format!(
                    "socket path is {} bytes, limit is {}: {}",
                    len,
                    MAX_SOCKET_PATH_LEN,
                    address.path().display()
                ),
            });
        }

        Ok(address)
    }

    /// Address for the current user built from server options.
    pub fn from_options(options: &ServerOptions) -> Result<Self> {
        let base = match &options.socket_dir {
            Some(dir) => dir.clone(),
            None => default_base_dir(),
        };
        Self::new(base, current_username()?, &options.namespace, &options.endpoint)
    }

    pub fn path(&self) -> PathBuf {
        self.directory().join(&self.name)
    }

    /// Directory holding the socket (`<base>/<user>/<namespace>`).
    pub fn directory(&self) -> PathBuf {
        self.base.join(&self.user).join(&self.namespace)
    }

    fn user_directory(&self) -> PathBuf {
        self.base.join(&self.user)
    }
}

fn validate_segment(field: &str, value: &str) -> Result<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains('/') || value.contains('\0') {
        return Err(ConduitError::Config {
            message: format!("invalid {} component {:?}", field, value),
        });
    }
    Ok(())
}

/// Base directory for endpoints when none is configured.
///
/// Uses `$XDG_RUNTIME_DIR` where available, otherwise the temp dir.
pub fn default_base_dir() -> PathBuf {
    dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

/// Login name of the user running the server.
pub fn current_username() -> Result<String> {
    if let Ok(Some(user)) = nix::unistd::User::from_uid(nix::unistd::getuid()) {
        return Ok(user.name);
    }
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .map_err(|_| ConduitError::Config {
            message: "Could not determine current user name".to_string(),
        })
}

/// A bound listening socket. Removes its socket file on drop.
#[derive(Debug)]
pub struct BoundEndpoint {
    listener: UnixListener,
    path: PathBuf,
    /// Inode of the socket we created, so we never unlink a successor's file.
    inode: Option<(u64, u64)>,
}

impl BoundEndpoint {
    pub fn listener(&self) -> &UnixListener {
        &self.listener
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BoundEndpoint {
    fn drop(&mut self) {
        let current = std::fs::symlink_metadata(&self.path)
            .ok()
            .map(|m| (m.dev(), m.ino()));
        if current.is_some() && current == self.inode {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to remove endpoint {}: {}", self.path.display(), e);
            } else {
                debug!("Removed endpoint {}", self.path.display());
            }
        }
    }
}

/// Creates the listening endpoint for an address.
#[derive(Debug, Clone)]
pub struct ChannelFactory {
    address: EndpointAddress,
    policy: Arc<dyn ConnectionPolicy>,
}

impl ChannelFactory {
    pub fn new(address: EndpointAddress, policy: Arc<dyn ConnectionPolicy>) -> Self {
        Self { address, policy }
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    /// Prepare directories, clear any previous socket, bind and authorize.
    pub async fn bind(&self, replace_existing: bool) -> Result<BoundEndpoint> {
        let path = self.address.path();
        self.prepare_directories()?;

        if std::fs::symlink_metadata(&path).is_ok() {
            self.clear_existing(&path, replace_existing).await?;
        }

        let listener =
            UnixListener::bind(&path).map_err(|e| ConduitError::io_with_path(e, &path))?;

        if let Err(e) = self.policy.apply(&path) {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        let inode = std::fs::symlink_metadata(&path)
            .ok()
            .map(|m| (m.dev(), m.ino()));

        debug!("Bound endpoint {}", path.display());
        Ok(BoundEndpoint {
            listener,
            path,
            inode,
        })
    }

    fn prepare_directories(&self) -> Result<()> {
        for dir in [self.address.user_directory(), self.address.directory()] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir).map_err(|e| ConduitError::Io {
                    message: format!("Failed to create directory: {}", dir.display()),
                    path: Some(dir.clone()),
                    source: Some(e),
                })?;
                self.policy.prepare_directory(&dir)?;
            }
        }
        Ok(())
    }

    /// Deal with a socket file that already exists at `path`.
    async fn clear_existing(&self, path: &Path, replace_existing: bool) -> Result<()> {
        match UnixStream::connect(path).await {
            Ok(stream) => {
                drop(stream);
                if !replace_existing {
                    return Err(ConduitError::AlreadyRunning {
                        path: path.to_path_buf(),
                    });
                }

                info!("Asking the server at {} to quit", path.display());
                IpcClient::request_quit(path).await?;
                if !wait_until_gone(path, IpcConfig::QUIT_WAIT_TIMEOUT * 2).await {
                    return Err(ConduitError::AlreadyRunning {
                        path: path.to_path_buf(),
                    });
                }
            }
            Err(e) => {
                debug!("Removing stale endpoint {} ({})", path.display(), e);
            }
        }

        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConduitError::io_with_path(e, path)),
        }
    }
}

/// Poll until nothing accepts connections at `path`.
async fn wait_until_gone(path: &Path, limit: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        match UnixStream::connect(path).await {
            Ok(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            Err(_) => return true,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::policy::PermissionPolicy;
    use tempfile::TempDir;

    fn factory(base: &Path, name: &str) -> ChannelFactory {
        let address = EndpointAddress::new(base, "alice", "Conduit", name).unwrap();
        ChannelFactory::new(address, Arc::new(PermissionPolicy::owner_only()))
    }

    #[test]
    fn test_address_layout() {
        let address = EndpointAddress::new("/run/user/1000", "alice", "Conduit", "Launcher").unwrap();
        assert_eq!(
            address.path(),
            PathBuf::from("/run/user/1000/alice/Conduit/Launcher")
        );
    }

    #[test]
    fn test_address_rejects_bad_segments() {
        assert!(EndpointAddress::new("/tmp", "", "Conduit", "Launcher").is_err());
        assert!(EndpointAddress::new("/tmp", "alice", "a/b", "Launcher").is_err());
        assert!(EndpointAddress::new("/tmp", "alice", "Conduit", "..").is_err());
    }

    #[test]
    fn test_address_rejects_long_paths() {
        let long = "x".repeat(120);
        let err = EndpointAddress::new("/tmp", "alice", "Conduit", long).unwrap_err();
        assert!(matches!(err, ConduitError::Endpoint { .. }));
    }

    #[test]
    fn test_current_username_is_not_empty() {
        assert!(!current_username().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bind_creates_and_removes_socket() {
        let temp = TempDir::new().unwrap();
        let factory = factory(temp.path(), "Launcher");

        let endpoint = factory.bind(false).await.unwrap();
        let path = endpoint.path().to_path_buf();
        assert!(path.exists());

        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        drop(endpoint);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket_file() {
        let temp = TempDir::new().unwrap();
        let factory = factory(temp.path(), "Launcher");

        let path = factory.address().path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        // A listener that was dropped without cleanup leaves the file behind.
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let endpoint = factory.bind(false).await.unwrap();
        assert_eq!(endpoint.path(), path.as_path());
    }

    #[tokio::test]
    async fn test_bind_refuses_live_endpoint() {
        let temp = TempDir::new().unwrap();
        let factory = factory(temp.path(), "Launcher");

        let _first = factory.bind(false).await.unwrap();
        let err = factory.bind(false).await.unwrap_err();
        assert!(matches!(err, ConduitError::AlreadyRunning { .. }));
    }
}
