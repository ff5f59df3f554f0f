//! Watermarks as JSON files, one per dataset

use super::{StateDocument, StateError, StateManager, StateResult, Watermarks};
use async_trait::async_trait;
use std::path::PathBuf;

/// Keeps `{dir}/{dataset_id}.json`
#[derive(Debug, Clone)]
pub struct FileStateManager {
    dir: PathBuf,
}

impl FileStateManager {
    pub fn new(dir: impl Into<PathBuf>) -> StateResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn state_path(&self, dataset_id: &str) -> StateResult<PathBuf> {
        if dataset_id.is_empty() || dataset_id.contains(['/', '\\']) || dataset_id.starts_with('.') {
            return Err(StateError::Config(format!(
                "dataset id {:?} cannot be used as a file name",
                dataset_id
            )));
        }
        Ok(self.dir.join(format!("{}.json", dataset_id)))
    }
}

#[async_trait]
impl StateManager for FileStateManager {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn load(&self, dataset_id: &str) -> StateResult<Watermarks> {
        let path = self.state_path(dataset_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => StateDocument::decode(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Watermarks::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, dataset_id: &str, watermarks: &Watermarks) -> StateResult<()> {
        let path = self.state_path(dataset_id)?;
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));

        tokio::fs::write(&tmp, StateDocument::encode(dataset_id, watermarks)?).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        tracing::debug!(dataset_id, series = watermarks.len(), path = ?path, "Saved state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_roundtrip() {
        let dir = tempdir().unwrap();
        contract::roundtrip(&FileStateManager::new(dir.path()).unwrap()).await;
    }

    #[tokio::test]
    async fn test_layout_and_no_leftovers() {
        let dir = tempdir().unwrap();
        let manager = FileStateManager::new(dir.path()).unwrap();
        manager.save("ipc", &Watermarks::new()).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["ipc.json"]);
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = tempdir().unwrap();
        let manager = FileStateManager::new(dir.path()).unwrap();
        assert!(matches!(
            manager.load("../etc").await,
            Err(StateError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("d1.json"), "{").unwrap();
        let manager = FileStateManager::new(dir.path()).unwrap();
        assert!(matches!(
            manager.load("d1").await,
            Err(StateError::Serialization(_))
        ));
    }
}
