//! The issue tools served over stdio framing, end to end.

use std::{collections::HashSet, sync::Arc};

use bugdesk::{
    auth::TokenValidator,
    downstream::SimilaritySearchClient,
    schema::INVALID_PARAMS,
    store::{Issue, IssueStatus, IssueStore, MemoryIssueStore, Severity},
    testutils::{
        init_tracing, test_identity, ExchangeMode, FakeAuthServer, TestClient,
        TEST_SIGNING_SECRET,
    },
    tools::{
        BugdeskConn, GET_ISSUE, LIST_PENDING_ISSUES, SEARCH_SIMILAR_ISSUES, UPDATE_ISSUE_STATUS,
    },
    Server,
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};

const SEARCH_AUDIENCE: &str = "urn:svc:similarity";

fn seeded_store() -> Arc<MemoryIssueStore> {
    let start = Utc::now() - Duration::hours(2);
    Arc::new(MemoryIssueStore::with_issues([
        Issue::new("BUG-1", "u-42", "Login button unresponsive on Safari", Severity::High)
            .with_created_at(start),
        Issue::new("BUG-2", "u-42", "Crash when exporting report", Severity::Critical)
            .with_description("Exporting a large report to PDF crashes the tab.")
            .with_created_at(start + Duration::minutes(10)),
        Issue::new("BUG-3", "u-42", "Typo on settings page", Severity::Low)
            .with_status(IssueStatus::Resolved)
            .with_created_at(start + Duration::minutes(20)),
        Issue::new("BUG-9", "u-7", "Login fails for SSO users", Severity::High)
            .with_created_at(start + Duration::minutes(5)),
    ]))
}

async fn connect(conn: BugdeskConn) -> TestClient {
    let (mut client, reader, writer) = TestClient::pair();
    tokio::spawn(Server::new(conn).serve_stream(reader, writer));
    let init = client.initialize().await;
    assert_eq!(init["result"]["serverInfo"]["name"], "bugdesk");
    client
}

async fn connect_as(user_id: &str, store: Arc<MemoryIssueStore>) -> TestClient {
    connect(BugdeskConn::new(test_identity(user_id).unwrap(), store)).await
}

fn result(response: &Value) -> &Value {
    assert!(response["error"].is_null(), "unexpected error: {response}");
    &response["result"]
}

fn is_error(response: &Value) -> bool {
    result(response)["isError"].as_bool().unwrap_or(false)
}

fn text(response: &Value) -> String {
    result(response)["content"][0]["text"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

fn listed_ids(response: &Value) -> Vec<String> {
    result(response)["structuredContent"]["issues"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["id"].as_str().unwrap().to_string())
        .collect()
}

fn matched_ids(response: &Value) -> Vec<String> {
    result(response)["structuredContent"]["matches"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["issue"]["id"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_tools_list() {
    init_tracing();
    let mut client = connect_as("u-42", seeded_store()).await;

    let response = client.request(1, "tools/list", json!({})).await;
    let names: HashSet<&str> = result(&response)["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        HashSet::from([
            LIST_PENDING_ISSUES,
            GET_ISSUE,
            UPDATE_ISSUE_STATUS,
            SEARCH_SIMILAR_ISSUES
        ])
    );
}

#[tokio::test]
async fn test_list_shows_only_own_pending_issues() {
    let mut client = connect_as("u-42", seeded_store()).await;

    let response = client.call_tool(1, LIST_PENDING_ISSUES, json!({})).await;
    assert!(!is_error(&response));
    assert_eq!(listed_ids(&response), vec!["BUG-1", "BUG-2"]);
    assert_eq!(result(&response)["structuredContent"]["total"], 2);
    assert!(!response.to_string().contains("u-7"));
    assert!(!response.to_string().contains("owner_id"));

    let response = client
        .call_tool(2, LIST_PENDING_ISSUES, json!({"limit": 1}))
        .await;
    assert_eq!(listed_ids(&response), vec!["BUG-1"]);
    assert_eq!(result(&response)["structuredContent"]["total"], 2);
}

#[tokio::test]
async fn test_foreign_issue_is_indistinguishable_from_missing() {
    let mut client = connect_as("u-42", seeded_store()).await;

    let foreign = client
        .call_tool(1, GET_ISSUE, json!({"issue_id": "BUG-9"}))
        .await;
    let missing = client
        .call_tool(2, GET_ISSUE, json!({"issue_id": "BUG-404"}))
        .await;

    assert!(is_error(&foreign));
    assert!(is_error(&missing));
    assert_eq!(text(&foreign), "issue 'BUG-9' not found");
    assert_eq!(text(&missing), "issue 'BUG-404' not found");
    assert!(!foreign.to_string().contains("SSO"));
}

#[tokio::test]
async fn test_get_own_issue() {
    let mut client = connect_as("u-42", seeded_store()).await;

    let response = client
        .call_tool(1, GET_ISSUE, json!({"issue_id": "BUG-2"}))
        .await;
    assert!(!is_error(&response));
    let issue = &result(&response)["structuredContent"];
    assert_eq!(issue["id"], "BUG-2");
    assert_eq!(issue["status"], "pending");
    assert_eq!(issue["severity"], "critical");
    assert!(issue.get("owner_id").is_none());
    assert!(text(&response).contains("crashes the tab"));
}

#[tokio::test]
async fn test_update_foreign_issue_changes_nothing() {
    let store = seeded_store();
    let mut client = connect_as("u-42", store.clone()).await;

    let response = client
        .call_tool(
            1,
            UPDATE_ISSUE_STATUS,
            json!({"issue_id": "BUG-9", "status": "dismissed"}),
        )
        .await;
    assert!(is_error(&response));
    assert_eq!(text(&response), "issue 'BUG-9' not found");

    let owner = test_identity("u-7").unwrap().scope();
    let untouched = store.get(&owner, "BUG-9").await.unwrap();
    assert_eq!(untouched.status, IssueStatus::Pending);
}

#[tokio::test]
async fn test_update_own_issue() {
    let mut client = connect_as("u-42", seeded_store()).await;

    let response = client
        .call_tool(
            1,
            UPDATE_ISSUE_STATUS,
            json!({"issue_id": "BUG-1", "status": "in_progress", "note": "reproduced"}),
        )
        .await;
    assert!(!is_error(&response));
    let issue = &result(&response)["structuredContent"];
    assert_eq!(issue["status"], "in_progress");
    assert_eq!(issue["status_note"], "reproduced");

    let response = client
        .call_tool(2, UPDATE_ISSUE_STATUS, json!({"issue_id": "BUG-1", "status": "resolved"}))
        .await;
    assert!(!is_error(&response));

    let response = client.call_tool(3, LIST_PENDING_ISSUES, json!({})).await;
    assert_eq!(listed_ids(&response), vec!["BUG-2"]);
}

#[tokio::test]
async fn test_invalid_transition_is_error_result() {
    let mut client = connect_as("u-42", seeded_store()).await;

    let response = client
        .call_tool(
            1,
            UPDATE_ISSUE_STATUS,
            json!({"issue_id": "BUG-3", "status": "in_progress"}),
        )
        .await;
    assert!(is_error(&response));
    assert!(text(&response).contains("resolved"));

    let response = client
        .call_tool(2, UPDATE_ISSUE_STATUS, json!({"issue_id": "BUG-3", "status": "pending"}))
        .await;
    assert!(!is_error(&response));
}

#[tokio::test]
async fn test_invalid_arguments_are_error_results() {
    let mut client = connect_as("u-42", seeded_store()).await;

    let response = client.call_tool(1, GET_ISSUE, json!({})).await;
    assert!(is_error(&response));
    assert!(text(&response).starts_with("invalid arguments for get_issue"));

    let response = client
        .call_tool(2, GET_ISSUE, json!({"issue_id": "BUG-9", "owner_id": "u-7"}))
        .await;
    assert!(is_error(&response));
    assert!(!response.to_string().contains("SSO"));

    let response = client
        .call_tool(
            3,
            UPDATE_ISSUE_STATUS,
            json!({"issue_id": "BUG-1", "status": "closed"}),
        )
        .await;
    assert!(is_error(&response));
}

#[tokio::test]
async fn test_unknown_tool_is_protocol_error() {
    let mut client = connect_as("u-42", seeded_store()).await;

    let response = client.call_tool(1, "delete_everything", json!({})).await;
    assert_eq!(response["error"]["code"], INVALID_PARAMS);
    assert_eq!(response["id"], 1);
}

#[tokio::test]
async fn test_local_search_stays_within_tenant() {
    let mut client = connect_as("u-42", seeded_store()).await;

    let response = client
        .call_tool(1, SEARCH_SIMILAR_ISSUES, json!({"query": "login safari"}))
        .await;
    assert!(!is_error(&response));
    assert_eq!(matched_ids(&response), vec!["BUG-1"]);

    let response = client
        .call_tool(2, SEARCH_SIMILAR_ISSUES, json!({"query": "   "}))
        .await;
    assert!(is_error(&response));
}

struct Downstream {
    server: FakeAuthServer,
    inbound: String,
    client: TestClient,
}

async fn connect_with_search() -> Downstream {
    let server = FakeAuthServer::start("u-42").await.unwrap();
    let identity = test_identity("u-42").unwrap();
    let inbound = identity.access_token().expose().to_string();
    let search = SimilaritySearchClient::new(
        &server.downstream_config(SEARCH_AUDIENCE).unwrap(),
        server.obo_exchanger().unwrap(),
        reqwest::Client::new(),
    );
    let conn = BugdeskConn::new(identity, seeded_store()).with_search(search);
    let client = connect(conn).await;
    Downstream {
        server,
        inbound,
        client,
    }
}

#[tokio::test]
async fn test_downstream_search_uses_exchanged_token() {
    let Downstream {
        server,
        inbound,
        mut client,
    } = connect_with_search().await;
    server.set_search_matches(&[("BUG-9", 0.99), ("BUG-2", 0.8), ("BUG-404", 0.5)]);

    let response = client
        .call_tool(1, SEARCH_SIMILAR_ISSUES, json!({"query": "export crash"}))
        .await;
    assert!(!is_error(&response), "{response}");
    assert_eq!(matched_ids(&response), vec!["BUG-2"]);

    let tokens = server.search_tokens();
    assert_eq!(tokens.len(), 1);
    assert_ne!(tokens[0], inbound);
    let claims = TokenValidator::hs256(TEST_SIGNING_SECRET, SEARCH_AUDIENCE)
        .validate(&tokens[0])
        .unwrap();
    assert_eq!(claims.user_id, "u-42");
    assert_eq!(server.exchange_requests()[0]["audience"], SEARCH_AUDIENCE);
}

#[tokio::test]
async fn test_downstream_search_retries_unavailable_service() {
    let Downstream {
        server, mut client, ..
    } = connect_with_search().await;
    server.set_search_matches(&[("BUG-1", 0.9)]);
    server.fail_searches(1);

    let response = client
        .call_tool(1, SEARCH_SIMILAR_ISSUES, json!({"query": "login"}))
        .await;
    assert!(!is_error(&response), "{response}");
    assert_eq!(matched_ids(&response), vec!["BUG-1"]);
    assert_eq!(server.search_tokens().len(), 2);
    assert_eq!(server.exchange_requests().len(), 1);
}

#[tokio::test]
async fn test_failed_exchange_is_error_result() {
    let Downstream {
        server,
        inbound,
        mut client,
    } = connect_with_search().await;

    server.set_exchange_mode(ExchangeMode::Echo);
    let response = client
        .call_tool(1, SEARCH_SIMILAR_ISSUES, json!({"query": "login"}))
        .await;
    assert!(is_error(&response));
    assert!(!response.to_string().contains(&inbound));

    server.set_exchange_mode(ExchangeMode::Deny);
    let response = client
        .call_tool(2, SEARCH_SIMILAR_ISSUES, json!({"query": "login"}))
        .await;
    assert!(is_error(&response));

    assert!(server.search_tokens().is_empty());
}
