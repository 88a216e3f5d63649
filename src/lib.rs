//! # bugdesk
//!
//! A stdio MCP bug-reporter server that acts with delegated, per-user OAuth
//! credentials.
//!
//! Stdio transport cannot do browser redirects or carry bearer headers, so the
//! credential chain is split over three processes:
//!
//! - **`bugdesk-auth login`** runs Authorization Code with PKCE once, through
//!   a loopback listener, and stores the refresh token in the OS keyring.
//! - **`bugdesk-launch`** runs on every IDE session: it refreshes, validates
//!   the access token offline and starts the server with
//!   `bugdesk-server <userId> <accessToken>`.
//! - **`bugdesk-server`** re-validates that identity, then serves the issue
//!   tools over stdio with every data access filtered to that one user.
//!   Downstream calls use an on-behalf-of token exchange.
//!
//! ## Serving the tools in-process
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bugdesk::{
//!     auth::TokenValidator,
//!     identity::{Identity, LaunchArgs},
//!     store::MemoryIssueStore,
//!     tools::BugdeskConn,
//!     Result, Server,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let validator = TokenValidator::hs256(b"shared-secret", "urn:mcp:bug-reporter");
//!     let args = LaunchArgs::from_args(std::env::args().skip(1))?;
//!     let identity = Identity::establish(args, &validator)?;
//!
//!     let conn = BugdeskConn::new(identity, Arc::new(MemoryIssueStore::new()));
//!     Server::new(conn).serve_stdio().await
//! }
//! ```

mod codec;
mod context;
mod error;
mod transport;

pub mod arguments;
pub mod auth;
pub mod config;
pub mod connection;
pub mod downstream;
pub mod identity;
pub mod launcher;
pub mod logging;
pub mod retry;
pub mod schema;
pub mod secret;
pub mod server;
pub mod store;
pub mod testutils;
pub mod tools;
pub mod vault;

pub use arguments::Arguments;
pub use codec::{Frame, JsonRpcCodec};
pub use connection::ServerConn;
pub use context::ServerCtx;
pub use error::{Error, Result};
pub use secret::Secret;
pub use server::Server;
pub use transport::{GenericDuplex, StdioTransport, StreamTransport, Transport, TransportStream};
