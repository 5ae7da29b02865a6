//! Warm-restart snapshot of the last applied configuration.

use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Atomically replaces `path` with `bytes` (temp file, fsync, rename).
pub async fn persist(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let path = path.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || persist_blocking(&path, &bytes))
        .await
        .map_err(io::Error::other)?
}

fn persist_blocking(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    create_dir_all(&dir)?;

    // The temp file is unlinked on drop unless it is persisted.
    let mut tmp = NamedTempFile::new_in(&dir)?;
    set_owner_only(tmp.as_file())?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    debug!(path = %path.display(), bytes = bytes.len(), "State persisted.");
    Ok(())
}

#[cfg(unix)]
fn create_dir_all(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(dir)
}

#[cfg(not(unix))]
fn create_dir_all(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)
}

#[cfg(unix)]
fn set_owner_only(file: &std::fs::File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only(_file: &std::fs::File) -> io::Result<()> {
    Ok(())
}

/// Feeds the persisted bytes to `apply`. Returns `Ok(false)` when nothing
/// was persisted.
pub async fn restore<F, Fut, E>(path: &Path, apply: F) -> Result<bool, E>
where
    F: FnOnce(Vec<u8>) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: From<io::Error>,
{
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    info!(path = %path.display(), bytes = bytes.len(), "Restoring persisted state.");
    apply(bytes).await?;
    Ok(true)
}
