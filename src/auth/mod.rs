//! Delegated OAuth credentials: interactive login, token endpoint calls,
//! offline validation and on-behalf-of exchange.

mod authenticator;
mod callback;
mod obo;
mod oauth_client;
pub mod pkce;
mod validator;

pub use authenticator::{Authenticator, BrowserLauncher, CredentialStatus, SystemBrowser};
pub use callback::{CallbackListener, CallbackParams, CALLBACK_TIMEOUT};
pub use obo::{
    ExchangeFailure, ExchangedToken, OboExchanger, ACCESS_TOKEN_TYPE, TOKEN_EXCHANGE_GRANT,
};
pub use oauth_client::{OAuthClient, TokenSet};
pub use pkce::{verify_challenge, AuthAttempt};
pub use validator::{TokenValidator, ValidatedToken, ValidationFailure};
