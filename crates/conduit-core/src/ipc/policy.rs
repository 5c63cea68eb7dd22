//! Connection authorization applied when the endpoint is created.
//!
//! The server does not decide who may connect; it asks a [`ConnectionPolicy`]
//! to lock down the endpoint directory and socket file before the accept loop
//! starts. A policy failure aborts startup.
//!
//! # Platform Behavior
//! - **Linux/macOS**: permission bits on the directory and socket path
//! - **Other**: no-op

use crate::error::Result;
use std::fmt::Debug;
use std::path::Path;
use tracing::debug;

/// Pluggable access policy for the listening endpoint.
pub trait ConnectionPolicy: Send + Sync + Debug {
    /// Called after the endpoint directory has been created.
    fn prepare_directory(&self, dir: &Path) -> Result<()>;

    /// Called right after the socket is bound.
    fn apply(&self, socket_path: &Path) -> Result<()>;
}

/// Unix permission-bit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionPolicy {
    pub dir_mode: u32,
    pub socket_mode: u32,
}

impl PermissionPolicy {
    /// Only the owning user may connect (0o700 / 0o600).
    pub const fn owner_only() -> Self {
        Self {
            dir_mode: 0o700,
            socket_mode: 0o600,
        }
    }

    /// The owner and its group may connect (0o770 / 0o660).
    pub const fn group_shared() -> Self {
        Self {
            dir_mode: 0o770,
            socket_mode: 0o660,
        }
    }
}

impl ConnectionPolicy for PermissionPolicy {
    fn prepare_directory(&self, dir: &Path) -> Result<()> {
        set_mode(dir, self.dir_mode)
    }

    fn apply(&self, socket_path: &Path) -> Result<()> {
        set_mode(socket_path, self.socket_mode)
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(mode);
        std::fs::set_permissions(path, permissions).map_err(|e| {
            crate::error::ConduitError::Authorization {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })?;
        debug!("Set mode {:o} on {}", mode, path.display());
    }

    #[cfg(not(unix))]
    {
        let _ = mode;
        debug!("Skipping permission bits for {}", path.display());
    }

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ConduitError;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_owner_only_directory() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("ns");
        std::fs::create_dir(&dir).unwrap();

        PermissionPolicy::owner_only().prepare_directory(&dir).unwrap();

        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_group_shared_file() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("sock");
        std::fs::write(&file, b"").unwrap();

        PermissionPolicy::group_shared().apply(&file).unwrap();

        let mode = std::fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);
    }

    #[test]
    fn test_missing_path_is_authorization_error() {
        let temp = TempDir::new().unwrap();
        let err = PermissionPolicy::owner_only()
            .apply(&temp.path().join("missing"))
            .unwrap_err();
        assert!(matches!(err, ConduitError::Authorization { .. }));
    }
}
