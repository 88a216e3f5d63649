use std::time::Duration;

use thiserror::Error;

use crate::{
    auth::{ExchangeFailure, ValidationFailure},
    schema::{ErrorObject, JSONRPCError, RequestId, INVALID_PARAMS, JSONRPC_VERSION, METHOD_NOT_FOUND},
    store::StoreError,
    vault::VaultError,
};

/// Errors produced anywhere in the authenticator, launcher or resource server.
///
/// No variant ever carries token or credential material; messages are safe to log.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("No stored credential found")]
    CredentialMissing,

    #[error("Stored credential was rejected by the authorization server: {0}")]
    CredentialExpired(String),

    #[error("Authorization callback state does not match this login attempt")]
    StateMismatch,

    #[error("Authorization server returned error '{error}'{}", describe(.description))]
    AuthorizationDenied {
        error: String,
        description: Option<String>,
    },

    #[error("No authorization callback received within {0:?}")]
    CallbackTimeout(Duration),

    #[error("Authorization callback was malformed: {0}")]
    MalformedCallback(String),

    #[error("Token endpoint rejected the request: {0}")]
    TokenEndpoint(String),

    #[error("Token validation failed: {0}")]
    TokenRejected(#[from] ValidationFailure),

    #[error("Token subject does not match the launch identity")]
    IdentityMismatch,

    #[error("Invalid launch arguments: {0}")]
    InvalidLaunchArgs(String),

    #[error("Upstream service unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Token exchange failed: {0}")]
    Exchange(#[from] ExchangeFailure),

    #[error("Credential vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Data store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport disconnected")]
    TransportDisconnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid message format: {message}")]
    InvalidMessageFormat { message: String },

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn describe(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(": {d}"))
        .unwrap_or_default()
}

impl Error {
    /// Map protocol-level errors onto their JSON-RPC error codes. Returns `None`
    /// for errors that should surface as a generic internal error.
    pub fn to_jsonrpc_response(&self, id: RequestId) -> Option<JSONRPCError> {
        let code = match self {
            Error::MethodNotFound(_) => METHOD_NOT_FOUND,
            Error::InvalidParams(_) | Error::ToolNotFound(_) => INVALID_PARAMS,
            _ => return None,
        };
        Some(JSONRPCError {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            error: ErrorObject {
                code,
                message: self.to_string(),
                data: None,
            },
        })
    }

    /// Whether an idempotent read may be retried after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::UpstreamUnavailable(_)
                | Error::Timeout(_)
                | Error::ConnectionClosed
                | Error::TransportDisconnected
        )
    }

    /// Security failures are never retried and never downgraded to warnings.
    pub fn is_security_failure(&self) -> bool {
        matches!(
            self,
            Error::StateMismatch | Error::TokenRejected(_) | Error::IdentityMismatch
        )
    }

    /// A one-line instruction telling the user how to recover, if there is one.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            Error::CredentialMissing | Error::CredentialExpired(_) => {
                Some("run `bugdesk-auth login` to sign in again")
            }
            Error::CallbackTimeout(_) => {
                Some("the browser sign-in was not completed in time; run `bugdesk-auth login` again")
            }
            Error::StateMismatch => Some(
                "the sign-in response did not belong to this attempt and was discarded; \
                 start a fresh `bugdesk-auth login` and do not reuse old browser tabs",
            ),
            Error::TokenRejected(_) | Error::IdentityMismatch => Some(
                "the issued token could not be trusted; check the [validation] settings and sign in again",
            ),
            Error::UpstreamUnavailable(_) => {
                Some("the authorization server is unreachable; check connectivity and retry")
            }
            Error::InvalidConfiguration(_) => Some("fix the bugdesk configuration file"),
            _ => None,
        }
    }

    /// Process exit code used by the binaries.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::InvalidConfiguration(_) | Error::InvalidLaunchArgs(_) => 2,
            _ => 1,
        }
    }

    /// Print the error and its remediation to stderr and pick the exit code.
    pub fn report(&self) -> std::process::ExitCode {
        eprintln!("error: {self}");
        if let Some(hint) = self.remediation() {
            eprintln!("hint: {hint}");
        }
        std::process::ExitCode::from(self.exit_code())
    }
}
