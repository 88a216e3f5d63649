//! Tenant-owned issue records and the stores that hold them.
//!
//! Every method takes a [`TenantScope`]; there is no way to read or write a
//! record without naming the tenant it must belong to.

mod file;
mod memory;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use file::JsonFileIssueStore;
pub use memory::MemoryIssueStore;

use crate::identity::TenantScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Pending,
    InProgress,
    Resolved,
    Dismissed,
}

impl IssueStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, IssueStatus::Resolved | IssueStatus::Dismissed)
    }

    /// Terminal statuses can only be reopened back to `pending`. Setting the
    /// current status again is always allowed.
    pub fn can_transition_to(self, next: IssueStatus) -> bool {
        self == next || !self.is_terminal() || next == IssueStatus::Pending
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IssueStatus::Pending => "pending",
            IssueStatus::InProgress => "in_progress",
            IssueStatus::Resolved => "resolved",
            IssueStatus::Dismissed => "dismissed",
        }
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: IssueStatus,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_note: Option<String>,
}

impl Issue {
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        title: impl Into<String>,
        severity: Severity,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            title: title.into(),
            description: String::new(),
            status: IssueStatus::Pending,
            severity,
            created_at: now,
            updated_at: now,
            status_note: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_status(mut self, status: IssueStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    /// Apply a status change in place after checking the transition.
    pub(crate) fn transition(
        &mut self,
        status: IssueStatus,
        note: Option<String>,
    ) -> Result<(), StoreError> {
        if !self.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        self.status_note = note;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Also returned for records owned by another tenant.
    #[error("issue '{0}' not found")]
    NotFound(String),
    #[error("cannot move an issue from {from} to {to}")]
    InvalidTransition { from: IssueStatus, to: IssueStatus },
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store file is corrupt: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait IssueStore: Send + Sync {
    /// All issues owned by the scope's tenant.
    async fn list(&self, scope: &TenantScope) -> Result<Vec<Issue>, StoreError>;

    async fn get(&self, scope: &TenantScope, id: &str) -> Result<Issue, StoreError>;

    async fn update_status(
        &self,
        scope: &TenantScope,
        id: &str,
        status: IssueStatus,
        note: Option<String>,
    ) -> Result<Issue, StoreError>;
}
