use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
};

use anyhow::Context;

#[cfg(unix)]
type NodeKey = (u64, u64);
#[cfg(not(unix))]
type NodeKey = PathBuf;

#[cfg(unix)]
fn node_key(_path: &Path, meta: &std::fs::Metadata) -> NodeKey {
    use std::os::unix::fs::MetadataExt;
    (meta.dev(), meta.ino())
}

#[cfg(not(unix))]
fn node_key(path: &Path, _meta: &std::fs::Metadata) -> NodeKey {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Total size of regular files under `root`, following directory symlinks.
///
/// Each (device, inode) is visited once, so hard links are counted once and
/// symlink loops terminate. Unreadable entries are skipped.
pub fn disk_usage_blocking(root: &Path) -> io::Result<u64> {
    let meta = std::fs::metadata(root)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }

    let mut visited = HashSet::<NodeKey>::new();
    visited.insert(node_key(root, &meta));
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    let mut total: u64 = 0;

    while let Some(dir) = stack.pop() {
        let rd = match std::fs::read_dir(&dir) {
            Ok(v) => v,
            Err(err) => {
                tracing::debug!(dir = %dir.display(), error = %err, "skipping unreadable dir");
                continue;
            }
        };
        for entry in rd.flatten() {
            let path = entry.path();
            // Follows symlinks; dangling links fail here and are skipped.
            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };
            if !visited.insert(node_key(&path, &meta)) {
                continue;
            }
            if meta.is_dir() {
                stack.push(path);
            } else if meta.is_file() {
                total = total.saturating_add(meta.len());
            }
        }
    }

    Ok(total)
}

pub async fn disk_usage(root: &Path) -> anyhow::Result<u64> {
    let root = root.to_path_buf();
    let label = root.display().to_string();
    tokio::task::spawn_blocking(move || disk_usage_blocking(&root))
        .await
        .context("disk usage worker panicked")?
        .with_context(|| format!("measure {label}"))
}

/// Recursively deletes `path` on the blocking pool. A missing path is not an error.
pub async fn remove_tree(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    let res = tokio::task::spawn_blocking(move || {
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        if meta.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        }
    })
    .await;

    match res {
        Ok(inner) => inner,
        Err(join) => Err(io::Error::other(format!("remove worker failed: {join}"))),
    }
}
