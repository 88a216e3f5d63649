use std::{sync::Arc, time::Duration};

use tracing::{info, warn};
use url::Url;

use super::{
    callback::{CallbackListener, CALLBACK_TIMEOUT},
    oauth_client::OAuthClient,
    pkce::AuthAttempt,
    validator::{TokenValidator, ValidatedToken},
};
use crate::{
    error::{Error, Result},
    vault::CredentialVault,
};

/// Opens the authorization URL for the user.
pub trait BrowserLauncher: Send + Sync {
    fn open(&self, url: &Url) -> std::io::Result<()>;
}

/// The desktop browser. The URL is always printed to stderr so headless
/// sessions can copy it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &Url) -> std::io::Result<()> {
        eprintln!("Opening your browser to sign in. If it does not open, visit:\n\n    {url}\n");
        webbrowser::open(url.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Present,
    Absent,
}

/// One interactive Authorization-Code-with-PKCE login.
pub struct Authenticator {
    oauth: OAuthClient,
    validator: TokenValidator,
    vault: Arc<dyn CredentialVault>,
    browser: Arc<dyn BrowserLauncher>,
    callback_timeout: Duration,
}

impl Authenticator {
    pub fn new(
        oauth: OAuthClient,
        validator: TokenValidator,
        vault: Arc<dyn CredentialVault>,
        browser: Arc<dyn BrowserLauncher>,
    ) -> Self {
        Self {
            oauth,
            validator,
            vault,
            browser,
            callback_timeout: CALLBACK_TIMEOUT,
        }
    }

    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    /// Run the browser flow and persist the refresh token. The vault is only
    /// written after the issued access token validates, so a failed login
    /// leaves any earlier credential in place.
    pub async fn login(&self) -> Result<ValidatedToken> {
        let listener = CallbackListener::bind().await?;
        let attempt = AuthAttempt::generate().with_redirect_port(listener.port());
        let redirect_uri = listener.redirect_uri();
        let url = self.oauth.authorization_url(&attempt, &redirect_uri)?;

        info!(port = attempt.redirect_port(), "waiting for authorization callback");
        if let Err(e) = self.browser.open(&url) {
            warn!("could not open a browser: {e}");
        }

        let params = listener.wait(self.callback_timeout).await?;

        match params.state.as_deref() {
            Some(state) if attempt.state_matches(state) => {}
            _ => {
                warn!(target: "bugdesk::security", "callback state mismatch; discarding response");
                return Err(Error::StateMismatch);
            }
        }
        if let Some(error) = params.error {
            return Err(Error::AuthorizationDenied {
                error,
                description: params.error_description,
            });
        }
        let code = params
            .code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::MalformedCallback("callback carried no code".into()))?;

        let tokens = self
            .oauth
            .exchange_code(&code, &attempt, &redirect_uri)
            .await?;
        drop(attempt);

        let refresh_token = tokens.refresh_token.ok_or_else(|| {
            Error::TokenEndpoint("token response carried no refresh token".into())
        })?;
        let validated = self.validator.validate(tokens.access_token.expose())?;

        self.vault.set(&refresh_token)?;
        info!(user_id = %validated.user_id, "signed in; refresh credential stored");
        Ok(validated)
    }

    /// Remove the stored credential. Succeeds when there is none.
    pub fn logout(&self) -> Result<()> {
        self.vault.delete()?;
        info!("stored credential removed");
        Ok(())
    }

    pub fn status(&self) -> Result<CredentialStatus> {
        Ok(if self.vault.exists()? {
            CredentialStatus::Present
        } else {
            CredentialStatus::Absent
        })
    }
}
