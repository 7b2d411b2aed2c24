//! The PID lock (§5, §6): an interface to the external launcher, not
//! elaborated beyond "a supervisor that starts/stops the gateway and
//! points the client at its listening address" (§1). On startup the
//! process writes `{pid, startedAt}` with owner-only permissions to
//! `<config_dir>/proxy.pid` and removes it on normal exit or a caught
//! signal; the launcher cross-verifies both fields against `/healthz`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PidLock {
    pub pid: u32,
    #[serde(rename = "startedAt")]
    pub started_at: i64,
}

pub fn lock_path(config_dir: &Path) -> PathBuf {
    config_dir.join("proxy.pid")
}

pub async fn write(config_dir: &Path, lock: PidLock) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(config_dir).await?;
    let path = lock_path(config_dir);
    let json = serde_json::to_vec_pretty(&lock)?;
    tokio::fs::write(&path, json).await?;
    set_owner_only(&path).await?;
    Ok(())
}

pub async fn remove(config_dir: &Path) {
    let path = lock_path(config_dir);
    let _ = tokio::fs::remove_file(&path).await;
}

#[cfg(unix)]
async fn set_owner_only(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_owner_only(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_and_removes_the_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let lock = PidLock { pid: 1234, started_at: 1_700_000_000_000 };
        write(dir.path(), lock).await.unwrap();
        assert!(lock_path(dir.path()).exists());
        let contents = tokio::fs::read_to_string(lock_path(dir.path())).await.unwrap();
        assert!(contents.contains("1234"));
        remove(dir.path()).await;
        assert!(!lock_path(dir.path()).exists());
    }
}
