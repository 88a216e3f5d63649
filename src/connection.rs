use async_trait::async_trait;

use crate::{
    arguments::Arguments,
    context::ServerCtx,
    error::{Error, Result},
    schema::{self, CallToolResult, InitializeResult, ListToolsResult},
};

/// Handlers for the MCP methods the resource server answers. One instance
/// serves the whole stdio session.
#[async_trait]
pub trait ServerConn: Send + Sync {
    /// Handle initialize request
    async fn initialize(
        &self,
        context: &ServerCtx,
        protocol_version: String,
        capabilities: schema::ClientCapabilities,
        client_info: schema::Implementation,
    ) -> Result<InitializeResult>;

    async fn pong(&self, _context: &ServerCtx) -> Result<()> {
        Ok(())
    }

    async fn list_tools(
        &self,
        _context: &ServerCtx,
        _cursor: Option<schema::Cursor>,
    ) -> Result<ListToolsResult> {
        Ok(ListToolsResult::new())
    }

    async fn call_tool(
        &self,
        _context: &ServerCtx,
        name: String,
        _arguments: Option<Arguments>,
    ) -> Result<CallToolResult> {
        Err(Error::ToolNotFound(name))
    }

    /// Called once after the I/O loop stops.
    async fn on_shutdown(&self) -> Result<()> {
        Ok(())
    }
}
