use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::debug;

use super::{Issue, IssueStatus, IssueStore, StoreError};
use crate::identity::TenantScope;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    issues: Vec<Issue>,
}

/// Issues kept in a single JSON document, `{"issues": [...]}`.
///
/// Operations are serialised by a lock and every write goes through a temp
/// file and a rename, so readers never see a half-written document.
#[derive(Debug)]
pub struct JsonFileIssueStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileIssueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<StoreFile, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StoreFile::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", self.path.display())))
    }

    async fn save(&self, contents: &StoreFile) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(contents)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "issue store written");
        Ok(())
    }
}

#[async_trait]
impl IssueStore for JsonFileIssueStore {
    async fn list(&self, scope: &TenantScope) -> Result<Vec<Issue>, StoreError> {
        let _guard = self.lock.lock().await;
        let contents = self.load().await?;
        Ok(contents
            .issues
            .into_iter()
            .filter(|issue| issue.owner_id == scope.owner_id())
            .collect())
    }

    async fn get(&self, scope: &TenantScope, id: &str) -> Result<Issue, StoreError> {
        let _guard = self.lock.lock().await;
        let contents = self.load().await?;
        contents
            .issues
            .into_iter()
            .find(|issue| issue.id == id)
            .filter(|issue| scope.owns(&issue.owner_id, &issue.id))
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update_status(
        &self,
        scope: &TenantScope,
        id: &str,
        status: IssueStatus,
        note: Option<String>,
    ) -> Result<Issue, StoreError> {
        let _guard = self.lock.lock().await;
        let mut contents = self.load().await?;
        let issue = contents
            .issues
            .iter_mut()
            .find(|issue| issue.id == id)
            .filter(|issue| scope.owns(&issue.owner_id, &issue.id))
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        issue.transition(status, note)?;
        let updated = issue.clone();
        self.save(&contents).await?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Severity;

    async fn write_fixture(path: &Path) {
        let contents = StoreFile {
            issues: vec![
                Issue::new("ISS-1", "u-42", "login crash", Severity::High),
                Issue::new("ISS-2", "u-7", "slow export", Severity::Medium),
            ],
        };
        fs::write(path, serde_json::to_vec(&contents).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileIssueStore::new(dir.path().join("issues.json"));
        let scope = TenantScope::for_tests("u-42");
        assert!(store.list(&scope).await.unwrap().is_empty());
        assert!(matches!(
            store.get(&scope, "ISS-1").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_persists_and_isolates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("issues.json");
        write_fixture(&path).await;
        let store = JsonFileIssueStore::new(&path);
        let scope = TenantScope::for_tests("u-42");

        store
            .update_status(&scope, "ISS-1", IssueStatus::InProgress, Some("on it".into()))
            .await
            .unwrap();
        assert!(matches!(
            store
                .update_status(&scope, "ISS-2", IssueStatus::Dismissed, None)
                .await,
            Err(StoreError::NotFound(_))
        ));

        let reopened = JsonFileIssueStore::new(&path);
        let issue = reopened.get(&scope, "ISS-1").await.unwrap();
        assert_eq!(issue.status, IssueStatus::InProgress);
        assert_eq!(issue.status_note.as_deref(), Some("on it"));
        let other = reopened
            .get(&TenantScope::for_tests("u-7"), "ISS-2")
            .await
            .unwrap();
        assert_eq!(other.status, IssueStatus::Pending);
        assert!(!dir.path().join("issues.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("issues.json");
        fs::write(&path, b"{\"issues\": [").await.unwrap();
        let store = JsonFileIssueStore::new(&path);
        assert!(matches!(
            store.list(&TenantScope::for_tests("u-42")).await,
            Err(StoreError::Corrupt(_))
        ));
    }
}
