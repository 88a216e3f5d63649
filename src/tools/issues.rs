use std::collections::HashSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    identity::TenantScope,
    schema::{CallToolResult, Tool, ToolInputSchema},
    store::{Issue, IssueStatus, IssueStore, Severity, StoreError},
};

pub const LIST_PENDING_ISSUES: &str = "list_pending_issues";
pub const GET_ISSUE: &str = "get_issue";
pub const UPDATE_ISSUE_STATUS: &str = "update_issue_status";
pub const SEARCH_SIMILAR_ISSUES: &str = "search_similar_issues";

pub const DEFAULT_LIMIT: usize = 20;
pub const MAX_LIMIT: usize = 100;

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ListPendingArgs {
    /// Maximum number of issues to return (default 20, at most 100).
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GetIssueArgs {
    pub issue_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdateStatusArgs {
    pub issue_id: String,
    /// New status. Resolved or dismissed issues can only go back to pending.
    pub status: IssueStatus,
    /// Free-text reason recorded with the change.
    pub note: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SearchSimilarArgs {
    /// Text to compare against issue titles and descriptions.
    pub query: String,
    pub limit: Option<u32>,
}

/// Wire shape of an issue in tool results.
#[derive(Debug, Clone, Serialize)]
pub struct IssueSummary {
    pub id: String,
    pub title: String,
    pub status: IssueStatus,
    pub severity: Severity,
    pub created_at: String,
}

impl From<&Issue> for IssueSummary {
    fn from(issue: &Issue) -> Self {
        Self {
            id: issue.id.clone(),
            title: issue.title.clone(),
            status: issue.status,
            severity: issue.severity,
            created_at: issue.created_at.to_rfc3339(),
        }
    }
}

pub fn definitions(search_is_remote: bool) -> Vec<Tool> {
    let search_description = if search_is_remote {
        "Rank your issues by similarity to a query using the search service."
    } else {
        "Rank your issues by word overlap with a query."
    };
    vec![
        Tool::new(
            LIST_PENDING_ISSUES,
            ToolInputSchema::from_json_schema::<ListPendingArgs>(),
        )
        .with_description("List your issues that are not resolved or dismissed, oldest first.")
        .with_read_only_hint(true),
        Tool::new(GET_ISSUE, ToolInputSchema::from_json_schema::<GetIssueArgs>())
            .with_description("Show the full detail of one of your issues.")
            .with_read_only_hint(true),
        Tool::new(
            UPDATE_ISSUE_STATUS,
            ToolInputSchema::from_json_schema::<UpdateStatusArgs>(),
        )
        .with_description("Change the status of one of your issues.")
        .with_idempotent_hint(true),
        Tool::new(
            SEARCH_SIMILAR_ISSUES,
            ToolInputSchema::from_json_schema::<SearchSimilarArgs>(),
        )
        .with_description(search_description)
        .with_read_only_hint(true),
    ]
}

pub(crate) fn clamp_limit(limit: Option<u32>) -> usize {
    limit
        .map(|l| (l as usize).clamp(1, MAX_LIMIT))
        .unwrap_or(DEFAULT_LIMIT)
}

/// Result for a lookup miss. Identical whether the record is absent or owned
/// by someone else.
pub(crate) fn not_found(issue_id: &str) -> CallToolResult {
    CallToolResult::error(format!("issue '{issue_id}' not found"))
}

pub(crate) async fn list_pending(
    store: &dyn IssueStore,
    scope: &TenantScope,
    args: ListPendingArgs,
) -> Result<CallToolResult, StoreError> {
    let mut issues: Vec<Issue> = store
        .list(scope)
        .await?
        .into_iter()
        .filter(|issue| !issue.status.is_terminal())
        .collect();
    issues.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    let total = issues.len();
    issues.truncate(clamp_limit(args.limit));

    let summaries: Vec<IssueSummary> = issues.iter().map(IssueSummary::from).collect();
    let text = if summaries.is_empty() {
        "No pending issues.".to_string()
    } else {
        summaries
            .iter()
            .map(|s| format!("{} [{}] ({:?}) {}", s.id, s.status, s.severity, s.title))
            .collect::<Vec<_>>()
            .join("\n")
    };
    Ok(CallToolResult::new()
        .with_text_content(text)
        .with_structured_content(json!({ "issues": summaries, "total": total })))
}

pub(crate) async fn get_issue(
    store: &dyn IssueStore,
    scope: &TenantScope,
    args: GetIssueArgs,
) -> Result<CallToolResult, StoreError> {
    match store.get(scope, &args.issue_id).await {
        Ok(issue) => Ok(detail(&issue)),
        Err(StoreError::NotFound(_)) => Ok(not_found(&args.issue_id)),
        Err(e) => Err(e),
    }
}

pub(crate) async fn update_status(
    store: &dyn IssueStore,
    scope: &TenantScope,
    args: UpdateStatusArgs,
) -> Result<CallToolResult, StoreError> {
    match store
        .update_status(scope, &args.issue_id, args.status, args.note)
        .await
    {
        Ok(issue) => Ok(CallToolResult::new()
            .with_text_content(format!("{} is now {}", issue.id, issue.status))
            .with_structured_content(issue_json(&issue))),
        Err(StoreError::NotFound(_)) => Ok(not_found(&args.issue_id)),
        Err(e @ StoreError::InvalidTransition { .. }) => Ok(CallToolResult::error(e.to_string())),
        Err(e) => Err(e),
    }
}

fn detail(issue: &Issue) -> CallToolResult {
    let mut text = format!(
        "{}: {}\nstatus: {}\nseverity: {:?}\ncreated: {}\nupdated: {}",
        issue.id,
        issue.title,
        issue.status,
        issue.severity,
        issue.created_at.to_rfc3339(),
        issue.updated_at.to_rfc3339(),
    );
    if let Some(note) = &issue.status_note {
        text.push_str(&format!("\nnote: {note}"));
    }
    if !issue.description.is_empty() {
        text.push_str(&format!("\n\n{}", issue.description));
    }
    CallToolResult::new()
        .with_text_content(text)
        .with_structured_content(issue_json(issue))
}

/// Owner ids are left out of every tool result.
fn issue_json(issue: &Issue) -> serde_json::Value {
    json!({
        "id": issue.id,
        "title": issue.title,
        "description": issue.description,
        "status": issue.status,
        "severity": issue.severity,
        "created_at": issue.created_at.to_rfc3339(),
        "updated_at": issue.updated_at.to_rfc3339(),
        "status_note": issue.status_note,
    })
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard overlap between the query's words and the issue's title and
/// description.
pub(crate) fn overlap_score(query: &HashSet<String>, issue: &Issue) -> f64 {
    let words = tokens(&format!("{} {}", issue.title, issue.description));
    let union = query.union(&words).count();
    if union == 0 {
        return 0.0;
    }
    query.intersection(&words).count() as f64 / union as f64
}

pub(crate) fn rank_locally(query: &str, issues: Vec<Issue>, limit: usize) -> Vec<(Issue, f64)> {
    let query = tokens(query);
    let mut scored: Vec<(Issue, f64)> = issues
        .into_iter()
        .map(|issue| {
            let score = overlap_score(&query, &issue);
            (issue, score)
        })
        .filter(|(_, score)| *score > 0.0)
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
    scored.truncate(limit);
    scored
}

pub(crate) fn search_result(ranked: &[(Issue, f64)]) -> CallToolResult {
    let matches: Vec<serde_json::Value> = ranked
        .iter()
        .map(|(issue, score)| {
            json!({
                "issue": IssueSummary::from(issue),
                "score": (score * 1000.0).round() / 1000.0,
            })
        })
        .collect();
    let text = if ranked.is_empty() {
        "No similar issues found.".to_string()
    } else {
        ranked
            .iter()
            .map(|(issue, score)| format!("{:.2} {} {}", score, issue.id, issue.title))
            .collect::<Vec<_>>()
            .join("\n")
    };
    CallToolResult::new()
        .with_text_content(text)
        .with_structured_content(json!({ "matches": matches }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_clamping() {
        assert_eq!(clamp_limit(None), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(5)), 5);
        assert_eq!(clamp_limit(Some(10_000)), MAX_LIMIT);
    }

    #[test]
    fn test_local_ranking() {
        let issues = vec![
            Issue::new("ISS-1", "u-42", "Login page crashes on submit", Severity::High),
            Issue::new("ISS-2", "u-42", "Export is slow", Severity::Low),
            Issue::new("ISS-3", "u-42", "Crash when login token expires", Severity::Critical),
        ];
        let ranked = rank_locally("login crash", issues, 10);
        let ids: Vec<&str> = ranked.iter().map(|(i, _)| i.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&"ISS-2"));
        assert!(ranked[0].1 >= ranked[1].1);
    }

    #[test]
    fn test_status_schema_lists_values() {
        let schema = ToolInputSchema::from_json_schema::<UpdateStatusArgs>();
        let status = &schema.properties.unwrap()["status"];
        let rendered = status.to_string();
        for value in ["pending", "in_progress", "resolved", "dismissed"] {
            assert!(rendered.contains(value), "{rendered}");
        }
        assert_eq!(
            schema.required,
            Some(vec!["issue_id".to_string(), "status".to_string()])
        );
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let parsed: Result<GetIssueArgs, _> =
            serde_json::from_value(json!({"issue_id": "ISS-1", "owner_id": "u-7"}));
        assert!(parsed.is_err());
    }
}
