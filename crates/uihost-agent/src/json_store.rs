//! Whole-file JSON persistence shared by the durable registries.

use std::path::Path;

use anyhow::Context;
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;

/// Reads `path`, falling back to `T::default()` when it is missing or unparsable.
pub async fn load_or_default<T>(path: &Path, what: &str) -> T
where
    T: DeserializeOwned + Default,
{
    let raw = match tokio::fs::read(path).await {
        Ok(v) => v,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read {what}; starting empty");
            return T::default();
        }
    };
    match serde_json::from_slice::<T>(&raw) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "{what} is corrupt; starting empty");
            T::default()
        }
    }
}

/// Replaces `path` with `value`: write a sibling temp file, flush, rename.
pub async fn write_atomic<T>(path: &Path, value: &T) -> anyhow::Result<()>
where
    T: Serialize + ?Sized,
{
    let data = serde_json::to_vec_pretty(value).context("serialize")?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("create {}", tmp.display()))?;
    f.write_all(&data)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    f.flush()
        .await
        .with_context(|| format!("flush {}", tmp.display()))?;
    drop(f);

    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[tokio::test]
    async fn write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let mut value = BTreeMap::new();
        value.insert("t1".to_string(), ("inst1".to_string(), 4242u32));

        write_atomic(&path, &value).await.unwrap();
        let loaded: BTreeMap<String, (String, u32)> = load_or_default(&path, "state").await;
        assert_eq!(loaded, value);
        assert!(!path.with_extension("json.tmp").exists());

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!({ "t1": ["inst1", 4242] }));
    }

    #[tokio::test]
    async fn missing_and_corrupt_files_load_default() {
        let dir = tempfile::tempdir().unwrap();
        let missing: Vec<u32> = load_or_default(&dir.path().join("nope.json"), "state").await;
        assert!(missing.is_empty());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, b"[1, 2").unwrap();
        let corrupt: Vec<u32> = load_or_default(&bad, "state").await;
        assert!(corrupt.is_empty());
    }
}
