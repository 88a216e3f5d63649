//! The subset of the Model Context Protocol wire schema served by `bugdesk-server`.
//!
//! Only the lifecycle (`initialize`, `ping`), tool (`tools/list`, `tools/call`)
//! and cancellation surfaces are modelled; everything else is answered with
//! `-32601 Method not found`.

pub mod jsonrpc;
pub mod requests;

mod content;
mod initialization;
mod tools;

pub use content::*;
pub use initialization::*;
pub use jsonrpc::*;
pub use requests::*;
pub use tools::*;
