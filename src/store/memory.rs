use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Issue, IssueStatus, IssueStore, StoreError};
use crate::identity::TenantScope;

/// Process-local store. Used when no store file is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryIssueStore {
    issues: RwLock<Vec<Issue>>,
}

impl MemoryIssueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_issues(issues: impl IntoIterator<Item = Issue>) -> Self {
        Self {
            issues: RwLock::new(issues.into_iter().collect()),
        }
    }
}

#[async_trait]
impl IssueStore for MemoryIssueStore {
    async fn list(&self, scope: &TenantScope) -> Result<Vec<Issue>, StoreError> {
        let issues = self.issues.read().await;
        Ok(issues
            .iter()
            .filter(|issue| issue.owner_id == scope.owner_id())
            .cloned()
            .collect())
    }

    async fn get(&self, scope: &TenantScope, id: &str) -> Result<Issue, StoreError> {
        let issues = self.issues.read().await;
        issues
            .iter()
            .find(|issue| issue.id == id)
            .filter(|issue| scope.owns(&issue.owner_id, &issue.id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update_status(
        &self,
        scope: &TenantScope,
        id: &str,
        status: IssueStatus,
        note: Option<String>,
    ) -> Result<Issue, StoreError> {
        let mut issues = self.issues.write().await;
        let issue = issues
            .iter_mut()
            .find(|issue| issue.id == id)
            .filter(|issue| scope.owns(&issue.owner_id, &issue.id))
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        issue.transition(status, note)?;
        Ok(issue.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Severity;

    fn seeded() -> MemoryIssueStore {
        MemoryIssueStore::with_issues([
            Issue::new("ISS-1", "u-42", "login crash", Severity::High),
            Issue::new("ISS-2", "u-7", "slow export", Severity::Low),
            Issue::new("ISS-3", "u-42", "typo", Severity::Low),
        ])
    }

    #[tokio::test]
    async fn test_list_is_filtered_by_owner() {
        let store = seeded();
        let ids: Vec<String> = store
            .list(&TenantScope::for_tests("u-42"))
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, ["ISS-1", "ISS-3"]);
    }

    #[tokio::test]
    async fn test_foreign_record_is_not_found() {
        let store = seeded();
        let scope = TenantScope::for_tests("u-42");
        assert!(matches!(
            store.get(&scope, "ISS-2").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store
                .update_status(&scope, "ISS-2", IssueStatus::Dismissed, None)
                .await,
            Err(StoreError::NotFound(_))
        ));
        let owner = TenantScope::for_tests("u-7");
        assert_eq!(
            store.get(&owner, "ISS-2").await.unwrap().status,
            IssueStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_update_status_records_note() {
        let store = seeded();
        let scope = TenantScope::for_tests("u-42");
        let updated = store
            .update_status(&scope, "ISS-1", IssueStatus::Resolved, Some("fixed in 1.2".into()))
            .await
            .unwrap();
        assert_eq!(updated.status, IssueStatus::Resolved);
        assert_eq!(updated.status_note.as_deref(), Some("fixed in 1.2"));
        assert!(updated.updated_at >= updated.created_at);

        let reopened = store
            .update_status(&scope, "ISS-1", IssueStatus::InProgress, None)
            .await;
        assert!(matches!(
            reopened,
            Err(StoreError::InvalidTransition { .. })
        ));
    }
}
