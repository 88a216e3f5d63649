//! The bug-reporter tool surface served over MCP.

mod issues;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

pub use issues::{
    GetIssueArgs, IssueSummary, ListPendingArgs, SearchSimilarArgs, UpdateStatusArgs,
    DEFAULT_LIMIT, GET_ISSUE, LIST_PENDING_ISSUES, MAX_LIMIT, SEARCH_SIMILAR_ISSUES,
    UPDATE_ISSUE_STATUS,
};

use crate::{
    arguments::Arguments,
    connection::ServerConn,
    context::ServerCtx,
    downstream::SimilaritySearchClient,
    error::{Error, Result},
    identity::{Identity, TenantScope},
    schema::{
        CallToolResult, ClientCapabilities, Cursor, Implementation, InitializeResult,
        ListToolsResult,
    },
    store::{IssueStore, StoreError},
};

const INSTRUCTIONS: &str = "Tools for triaging your own bug reports. Every tool only sees \
issues that belong to the signed-in user.";

/// Serves the issue tools for exactly one authenticated user.
pub struct BugdeskConn {
    identity: Identity,
    scope: TenantScope,
    store: Arc<dyn IssueStore>,
    search: Option<SimilaritySearchClient>,
}

impl BugdeskConn {
    pub fn new(identity: Identity, store: Arc<dyn IssueStore>) -> Self {
        let scope = identity.scope();
        Self {
            identity,
            scope,
            store,
            search: None,
        }
    }

    /// Route `search_similar_issues` through the downstream service.
    pub fn with_search(mut self, search: SimilaritySearchClient) -> Self {
        self.search = Some(search);
        self
    }

    async fn search_similar(&self, args: SearchSimilarArgs) -> Result<CallToolResult> {
        if args.query.trim().is_empty() {
            return Ok(CallToolResult::error("query must not be empty"));
        }
        let limit = issues::clamp_limit(args.limit);

        let Some(search) = &self.search else {
            let candidates = self.store.list(&self.scope).await?;
            return Ok(issues::search_result(&issues::rank_locally(
                &args.query,
                candidates,
                limit,
            )));
        };

        let matches = match search
            .search(self.identity.access_token(), &args.query, limit)
            .await
        {
            Ok(matches) => matches,
            Err(e) => {
                warn!(audience = search.audience(), "similarity search failed: {e}");
                return Ok(CallToolResult::error(format!("similarity search failed: {e}")));
            }
        };

        // Downstream ids are untrusted; each one is re-read through the
        // tenant filter and dropped if it is not ours.
        let mut ranked = Vec::with_capacity(matches.len());
        for m in matches {
            match self.store.get(&self.scope, &m.issue_id).await {
                Ok(issue) => ranked.push((issue, m.score)),
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            if ranked.len() == limit {
                break;
            }
        }
        Ok(issues::search_result(&ranked))
    }
}

/// Typed arguments, or the `isError` result describing why they are invalid.
fn parse_args<T: DeserializeOwned>(
    tool: &str,
    arguments: Option<Arguments>,
) -> std::result::Result<T, CallToolResult> {
    arguments
        .unwrap_or_default()
        .deserialize()
        .map_err(|e| CallToolResult::error(format!("invalid arguments for {tool}: {e}")))
}

#[async_trait]
impl ServerConn for BugdeskConn {
    async fn initialize(
        &self,
        _context: &ServerCtx,
        protocol_version: String,
        _capabilities: ClientCapabilities,
        client_info: Implementation,
    ) -> Result<InitializeResult> {
        info!(client = %client_info.name, version = %client_info.version, "client connected");
        Ok(
            InitializeResult::new("bugdesk", env!("CARGO_PKG_VERSION"))
                .with_protocol_version(&protocol_version)
                .with_tools(false)
                .with_instructions(INSTRUCTIONS),
        )
    }

    async fn list_tools(
        &self,
        _context: &ServerCtx,
        _cursor: Option<Cursor>,
    ) -> Result<ListToolsResult> {
        Ok(issues::definitions(self.search.is_some())
            .into_iter()
            .fold(ListToolsResult::new(), ListToolsResult::with_tool))
    }

    async fn call_tool(
        &self,
        _context: &ServerCtx,
        name: String,
        arguments: Option<Arguments>,
    ) -> Result<CallToolResult> {
        let store = self.store.as_ref();
        let scope = &self.scope;
        let result = match name.as_str() {
            LIST_PENDING_ISSUES => match parse_args(&name, arguments) {
                Ok(args) => issues::list_pending(store, scope, args).await,
                Err(invalid) => return Ok(invalid),
            },
            GET_ISSUE => match parse_args(&name, arguments) {
                Ok(args) => issues::get_issue(store, scope, args).await,
                Err(invalid) => return Ok(invalid),
            },
            UPDATE_ISSUE_STATUS => match parse_args::<UpdateStatusArgs>(&name, arguments) {
                Ok(args) => {
                    info!(issue = %args.issue_id, status = %args.status, "updating issue status");
                    issues::update_status(store, scope, args).await
                }
                Err(invalid) => return Ok(invalid),
            },
            SEARCH_SIMILAR_ISSUES => {
                return match parse_args(&name, arguments) {
                    Ok(args) => self.search_similar(args).await,
                    Err(invalid) => Ok(invalid),
                }
            }
            _ => return Err(Error::ToolNotFound(name)),
        };
        result.map_err(Error::from)
    }

    async fn on_shutdown(&self) -> Result<()> {
        info!(user_id = %self.identity.user_id(), "session ended");
        Ok(())
    }
}
