use std::{
    collections::BTreeMap,
    path::{Component, Path, PathBuf},
    sync::Mutex,
};

use anyhow::Context;
use uihost_types::{InstallationId, InstallationRecord};

use crate::{
    error::{Error, Result},
    json_store,
};

/// Answers whether an installation currently has a running process.
pub trait InstanceActivity: Send + Sync {
    fn is_running(&self, installation_id: &InstallationId) -> bool;
}

/// Canonical form used to compare install paths.
///
/// Existing paths are canonicalized; others are made absolute and normalized
/// lexically so a not-yet-created destination still compares correctly.
pub fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(p) = std::fs::canonicalize(path) {
        return p;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut out = PathBuf::new();
    for comp in absolute.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Off-runtime [`resolve_path`]; canonicalization touches the filesystem.
pub async fn resolve_path_async(path: &Path) -> PathBuf {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || resolve_path(&owned))
        .await
        .unwrap_or_else(|err| {
            tracing::warn!(path = %path.display(), error = %err, "path resolution worker failed");
            path.to_path_buf()
        })
}

type RecordMap = BTreeMap<InstallationId, InstallationRecord>;

/// Durable `installation_id -> InstallationRecord` map backed by one JSON file.
///
/// Mutations build the next map, write it, and only then swap it in, so memory
/// never holds a change the file does not.
#[derive(Debug)]
pub struct InstanceRegistry {
    path: PathBuf,
    records: Mutex<RecordMap>,
    // Held for a whole mutation, file write included; never together with `records`.
    write_lock: tokio::sync::Mutex<()>,
}

impl InstanceRegistry {
    /// Loads the registry file. A missing or unreadable file starts empty.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records: RecordMap = json_store::load_or_default(&path, "instance registry").await;
        tracing::info!(path = %path.display(), count = records.len(), "instance registry loaded");

        Self {
            path,
            records: Mutex::new(records),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecordMap> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Writes `next` and, once it is on disk, makes it the live map.
    async fn store(&self, next: RecordMap) -> Result<()> {
        json_store::write_atomic(&self.path, &next)
            .await
            .context("write instance registry")?;
        *self.lock() = next;
        Ok(())
    }

    pub fn get(&self, installation_id: &InstallationId) -> Option<InstallationRecord> {
        self.lock().get(installation_id).cloned()
    }

    pub fn list_all(&self) -> Vec<InstallationRecord> {
        self.lock().values().cloned().collect()
    }

    /// Record other than `except` whose path resolves to the same location as `path`.
    async fn owner_of(
        &self,
        path: &Path,
        except: Option<&InstallationId>,
    ) -> Option<InstallationRecord> {
        let records = self.list_all();
        let path = path.to_path_buf();
        let except = except.cloned();
        let res = tokio::task::spawn_blocking(move || {
            let wanted = resolve_path(&path);
            records.into_iter().find(|r| {
                Some(&r.installation_id) != except.as_ref()
                    && resolve_path(Path::new(&r.path)) == wanted
            })
        })
        .await;
        match res {
            Ok(owner) => owner,
            Err(err) => {
                tracing::warn!(error = %err, "path lookup worker failed");
                None
            }
        }
    }

    /// Record whose path resolves to the same location as `path`.
    pub async fn find_by_path(&self, path: &Path) -> Option<InstallationRecord> {
        self.owner_of(path, None).await
    }

    /// Inserts or replaces the record for its id.
    pub async fn add(&self, record: InstallationRecord) -> Result<()> {
        let _writer = self.write_lock.lock().await;
        if let Some(other) = self
            .owner_of(Path::new(&record.path), Some(&record.installation_id))
            .await
        {
            return Err(Error::bad_request(format!(
                "path {} already belongs to installation {}",
                record.path, other.installation_id
            )));
        }
        let mut next = self.lock().clone();
        next.insert(record.installation_id.clone(), record.clone());
        self.store(next).await?;
        tracing::info!(
            installation_id = %record.installation_id,
            kind = %record.ui_kind,
            path = %record.path,
            "installation registered"
        );
        Ok(())
    }

    pub async fn remove(&self, installation_id: &InstallationId) -> Result<InstallationRecord> {
        let _writer = self.write_lock.lock().await;
        let mut next = self.lock().clone();
        let removed = next
            .remove(installation_id)
            .ok_or_else(|| Error::not_found(format!("installation {installation_id}")))?;
        self.store(next).await?;
        tracing::info!(%installation_id, "installation removed");
        Ok(removed)
    }

    /// Renames and/or moves an installation that is not running.
    pub async fn update(
        &self,
        installation_id: &InstallationId,
        new_display_name: Option<String>,
        new_path: Option<PathBuf>,
        activity: &dyn InstanceActivity,
    ) -> Result<InstallationRecord> {
        let _writer = self.write_lock.lock().await;
        let current = self
            .get(installation_id)
            .ok_or_else(|| Error::not_found(format!("installation {installation_id}")))?;
        if activity.is_running(installation_id) {
            return Err(Error::bad_request(format!(
                "installation {installation_id} is running; stop it first"
            )));
        }

        let display_name = match new_display_name {
            Some(name) if name.trim().is_empty() => {
                return Err(Error::bad_request("display name must not be empty"));
            }
            Some(name) => name.trim().to_string(),
            None => current.display_name.clone(),
        };

        let mut path = current.path.clone();
        let mut moved: Option<(PathBuf, PathBuf)> = None;
        if let Some(new_path) = new_path {
            let from = resolve_path_async(Path::new(&current.path)).await;
            let to = resolve_path_async(&new_path).await;
            if to != from {
                if let Some(other) = self.owner_of(&to, Some(installation_id)).await {
                    return Err(Error::bad_request(format!(
                        "path {} already belongs to installation {}",
                        to.display(),
                        other.installation_id
                    )));
                }
                if move_directory(&from, &to).await? {
                    moved = Some((from, to.clone()));
                }
                path = to.display().to_string();
            }
        }

        let updated = InstallationRecord {
            display_name,
            path,
            ..current
        };
        let mut next = self.lock().clone();
        next.insert(installation_id.clone(), updated.clone());
        if let Err(err) = self.store(next).await {
            // Put the directory back where the unchanged record points.
            if let Some((from, to)) = moved
                && let Err(undo) = tokio::fs::rename(&to, &from).await
            {
                tracing::error!(
                    %installation_id,
                    from = %to.display(),
                    to = %from.display(),
                    error = %undo,
                    "failed to move directory back after registry write failure"
                );
            }
            return Err(err);
        }
        tracing::info!(%installation_id, path = %updated.path, name = %updated.display_name, "installation updated");
        Ok(updated)
    }
}

/// Moves `from` to `to`; `Ok(false)` when there was nothing on disk to move.
async fn move_directory(from: &Path, to: &Path) -> Result<bool> {
    if tokio::fs::metadata(to).await.is_ok() {
        return Err(Error::bad_request(format!(
            "destination {} already exists",
            to.display()
        )));
    }
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            Error::failed(format!("failed to create {}: {e}", parent.display()))
        })?;
    }
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(true),
        // Nothing on disk to move; the record alone is updated.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(from = %from.display(), "install directory missing; updating record only");
            Ok(false)
        }
        Err(err) => Err(Error::failed(format!(
            "failed to move {} to {}: {err}",
            from.display(),
            to.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use uihost_types::UiKind;

    struct Running(HashSet<InstallationId>);

    impl InstanceActivity for Running {
        fn is_running(&self, installation_id: &InstallationId) -> bool {
            self.0.contains(installation_id)
        }
    }

    fn idle() -> Running {
        Running(HashSet::new())
    }

    fn record(id: &str, path: &Path) -> InstallationRecord {
        InstallationRecord {
            installation_id: InstallationId::from(id),
            ui_kind: UiKind::from("comfyui"),
            display_name: format!("ui {id}"),
            path: path.display().to_string(),
        }
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("installations.json");
        let reg = InstanceRegistry::open(&file).await;
        reg.add(record("a", &dir.path().join("a"))).await.unwrap();
        reg.add(record("b", &dir.path().join("b"))).await.unwrap();
        reg.remove(&InstallationId::from("a")).await.unwrap();

        let reopened = InstanceRegistry::open(&file).await;
        let all = reopened.list_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].installation_id, InstallationId::from("b"));
        assert!(!dir.path().join("installations.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("installations.json");
        std::fs::write(&file, "{ not json").unwrap();
        let reg = InstanceRegistry::open(&file).await;
        assert!(reg.list_all().is_empty());
    }

    #[tokio::test]
    async fn remove_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let reg = InstanceRegistry::open(dir.path().join("i.json")).await;
        let err = reg.remove(&InstallationId::from("zzz")).await.unwrap_err();
        assert!(matches!(err, Error::EntityNotFound(_)));
    }

    #[tokio::test]
    async fn update_moves_directory_and_renames() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old");
        std::fs::create_dir_all(&old).unwrap();
        std::fs::write(old.join("main.py"), "print(1)").unwrap();
        let reg = InstanceRegistry::open(dir.path().join("i.json")).await;
        reg.add(record("a", &old)).await.unwrap();

        let new = dir.path().join("nested").join("new");
        let updated = reg
            .update(
                &InstallationId::from("a"),
                Some("  Renamed  ".to_string()),
                Some(new.clone()),
                &idle(),
            )
            .await
            .unwrap();

        assert_eq!(updated.display_name, "Renamed");
        assert!(new.join("main.py").exists());
        assert!(!old.exists());
        assert_eq!(resolve_path(Path::new(&updated.path)), resolve_path(&new));
    }

    #[tokio::test]
    async fn update_rejects_running_instance() {
        let dir = tempfile::tempdir().unwrap();
        let reg = InstanceRegistry::open(dir.path().join("i.json")).await;
        reg.add(record("a", &dir.path().join("a"))).await.unwrap();

        let running = Running(HashSet::from([InstallationId::from("a")]));
        let err = reg
            .update(&InstallationId::from("a"), Some("x".to_string()), None, &running)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)), "{err:?}");
        assert_eq!(reg.get(&InstallationId::from("a")).unwrap().display_name, "ui a");
    }

    #[tokio::test]
    async fn update_rejects_colliding_path() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        let reg = InstanceRegistry::open(dir.path().join("i.json")).await;
        reg.add(record("a", &a)).await.unwrap();
        reg.add(record("b", &b)).await.unwrap();

        // Same location spelled differently still collides.
        let err = reg
            .update(&InstallationId::from("a"), None, Some(a.join("..").join("b")), &idle())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)), "{err:?}");
        assert!(a.exists());
    }

    /// A directory squatting on the temp name makes every registry write fail.
    fn block_writes(file: &Path) {
        std::fs::create_dir_all(file.with_extension("json.tmp")).unwrap();
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("i.json");
        let reg = InstanceRegistry::open(&file).await;
        reg.add(record("keep", &dir.path().join("keep"))).await.unwrap();
        block_writes(&file);

        let err = reg.add(record("new", &dir.path().join("new"))).await.unwrap_err();
        assert!(matches!(err, Error::Other(_)), "{err:?}");
        assert!(reg.get(&InstallationId::from("new")).is_none());

        reg.remove(&InstallationId::from("keep")).await.unwrap_err();
        assert!(reg.get(&InstallationId::from("keep")).is_some());

        let err = reg
            .update(&InstallationId::from("keep"), Some("renamed".to_string()), None, &idle())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Other(_)), "{err:?}");
        assert_eq!(reg.get(&InstallationId::from("keep")).unwrap().display_name, "ui keep");

        let on_disk = InstanceRegistry::open(&file).await;
        assert_eq!(on_disk.list_all(), reg.list_all());
    }

    #[tokio::test]
    async fn failed_write_moves_directory_back() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("i.json");
        let old = dir.path().join("old");
        std::fs::create_dir_all(&old).unwrap();
        let reg = InstanceRegistry::open(&file).await;
        reg.add(record("a", &old)).await.unwrap();
        block_writes(&file);

        reg.update(&InstallationId::from("a"), None, Some(dir.path().join("new")), &idle())
            .await
            .unwrap_err();
        assert!(old.exists());
        assert!(!dir.path().join("new").exists());
        assert_eq!(
            resolve_path(Path::new(&reg.get(&InstallationId::from("a")).unwrap().path)),
            resolve_path(&old)
        );
    }

    #[tokio::test]
    async fn find_by_path_matches_equivalent_spellings() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        std::fs::create_dir_all(&a).unwrap();
        let reg = InstanceRegistry::open(dir.path().join("i.json")).await;
        reg.add(record("a", &a)).await.unwrap();

        let found = reg.find_by_path(&a.join("..").join("a")).await.unwrap();
        assert_eq!(found.installation_id, InstallationId::from("a"));
        assert!(reg.find_by_path(&dir.path().join("b")).await.is_none());
        assert_eq!(resolve_path_async(&a.join(".")).await, resolve_path(&a));
    }

    #[tokio::test]
    async fn add_rejects_path_owned_by_another_record() {
        let dir = tempfile::tempdir().unwrap();
        let reg = InstanceRegistry::open(dir.path().join("i.json")).await;
        reg.add(record("a", &dir.path().join("shared"))).await.unwrap();
        let err = reg
            .add(record("b", &dir.path().join("shared")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }
}
