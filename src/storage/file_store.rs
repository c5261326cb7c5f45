use super::{EntityKind, Persistable};
use crate::{LoomError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// All subdirectories created under the data dir on open.
const LAYOUT: &[&str] = &[
    "projects",
    "epics",
    "tasks",
    "dependencies",
    "graphs",
    "indexes",
    "backups",
    "cache",
    "logs",
];

/// One-entity-per-file JSON store.
///
/// Writes are atomic at the entity granularity: content is staged to a
/// sibling temp file and renamed into place; the temp is removed on any
/// failure.
#[derive(Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in LAYOUT {
            tokio::fs::create_dir_all(root.join(dir))
                .await
                .map_err(|e| LoomError::storage(format!("creating {dir}: {e}")))?;
        }
        debug!("file store opened at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    fn entity_path(&self, kind: EntityKind, id: &str) -> Result<PathBuf> {
        check_id(id)?;
        Ok(self.root.join(kind.dir()).join(format!("{id}.json")))
    }

    pub async fn exists(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let path = self.entity_path(kind, id)?;
        Ok(tokio::fs::try_exists(&path)
            .await
            .map_err(|e| LoomError::storage(format!("stat {}: {e}", kind.label())))?)
    }

    pub async fn read<T: Persistable>(&self, id: &str) -> Result<Option<T>> {
        match self.read_raw(T::KIND, id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn read_raw(&self, kind: EntityKind, id: &str) -> Result<Option<serde_json::Value>> {
        let path = self.entity_path(kind, id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(LoomError::storage(format!(
                    "reading {} {id}: {e}",
                    kind.label()
                )))
            }
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub async fn write<T: Persistable>(&self, value: &T) -> Result<()> {
        let raw = serde_json::to_value(value)?;
        self.write_raw(T::KIND, value.id(), &raw).await
    }

    pub async fn write_raw(
        &self,
        kind: EntityKind,
        id: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let path = self.entity_path(kind, id)?;
        let tmp = path.with_file_name(format!(".{id}.{}.tmp", Uuid::new_v4()));

        let bytes = serde_json::to_vec_pretty(value)?;
        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(LoomError::storage(format!(
                "staging {} {id}: {e}",
                kind.label()
            )));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(LoomError::storage(format!(
                "committing {} {id}: {e}",
                kind.label()
            )));
        }
        Ok(())
    }

    /// Returns true when the entity existed.
    pub async fn delete(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let path = self.entity_path(kind, id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(LoomError::storage(format!(
                "deleting {} {id}: {e}",
                kind.label()
            ))),
        }
    }

    pub async fn list_ids(&self, kind: EntityKind) -> Result<Vec<String>> {
        let dir = self.root.join(kind.dir());
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| LoomError::storage(format!("listing {}: {e}", kind.label())))?;

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| LoomError::storage(format!("listing {}: {e}", kind.label())))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub async fn read_all<T: Persistable>(&self) -> Result<Vec<T>> {
        let ids = self.list_ids(T::KIND).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.read::<T>(&id).await {
                Ok(Some(value)) => out.push(value),
                Ok(None) => {}
                Err(e) => warn!("skipping unreadable {} {id}: {e}", T::KIND.label()),
            }
        }
        Ok(out)
    }
}

/// Entity ids become file names; anything outside this alphabet is refused
/// before it can touch the filesystem.
fn check_id(id: &str) -> Result<()> {
    if id.is_empty()
        || id.len() > 128
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        || id.starts_with('.')
    {
        return Err(LoomError::Validation(format!("invalid entity id: {id:?}")));
    }
    Ok(())
}
