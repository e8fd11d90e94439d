//! Filesystem helpers for finished outputs.

use std::path::Path;

use tokio::fs;
use tracing::{debug, warn};

use crate::error::MediaResult;

/// EXDEV on Linux and macOS.
const CROSS_DEVICE_ERRNO: i32 = 18;

/// Move `src` to `dst`, creating the destination directory.
///
/// Falls back to copy-then-rename when the two paths are on different
/// filesystems, so the destination is never observed half-written.
pub async fn move_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> MediaResult<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await?;
    }

    match fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(CROSS_DEVICE_ERRNO) => {
            debug!("Cross-device move {} -> {}", src.display(), dst.display());
            let staging = dst.with_extension("moving");
            if let Err(e) = fs::copy(src, &staging).await {
                let _ = fs::remove_file(&staging).await;
                return Err(e.into());
            }
            if let Err(e) = fs::rename(&staging, dst).await {
                let _ = fs::remove_file(&staging).await;
                return Err(e.into());
            }
            if let Err(e) = fs::remove_file(src).await {
                warn!("Could not remove {} after move: {}", src.display(), e);
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Remove a file, ignoring "not found".
pub async fn remove_if_exists(path: impl AsRef<Path>) -> MediaResult<()> {
    match fs::remove_file(path.as_ref()).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_move_into_new_directory() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.mp4");
        let dst = dir.path().join("nested/b.mp4");
        fs::write(&src, b"data").await.unwrap();

        move_file(&src, &dst).await.unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_remove_if_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.mp4");
        remove_if_exists(&path).await.unwrap();
        fs::write(&path, b"x").await.unwrap();
        remove_if_exists(&path).await.unwrap();
        assert!(!path.exists());
    }
}
