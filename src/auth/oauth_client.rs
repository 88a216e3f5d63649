use std::{borrow::Cow, time::Duration};

use oauth2::{
    basic::{BasicClient, BasicErrorResponse, BasicErrorResponseType, BasicTokenResponse},
    AuthType, AuthUrl, AuthorizationCode, ClientId, CsrfToken, EndpointNotSet, EndpointSet,
    HttpClientError, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken,
    RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use tracing::debug;
use url::Url;

use crate::{
    auth::pkce::AuthAttempt,
    config::{AuthorizationConfig, HttpConfig},
    error::{Error, Result},
    secret::Secret,
};

type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

type TokenError = RequestTokenError<HttpClientError<reqwest::Error>, BasicErrorResponse>;

/// A token endpoint response. Only the refresh token is ever persisted.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: Secret,
    pub refresh_token: Option<Secret>,
    pub expires_in: Option<Duration>,
    pub scope: Option<String>,
}

impl From<BasicTokenResponse> for TokenSet {
    fn from(response: BasicTokenResponse) -> Self {
        Self {
            access_token: Secret::new(response.access_token().secret().clone()),
            refresh_token: response
                .refresh_token()
                .map(|t| Secret::new(t.secret().clone())),
            expires_in: response.expires_in(),
            scope: response.scopes().map(|scopes| {
                scopes
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(" ")
            }),
        }
    }
}

/// Public-client calls against `/authorize` and `/token`.
pub struct OAuthClient {
    client: ConfiguredClient,
    http: reqwest::Client,
    resource: String,
    scopes: Vec<String>,
}

impl OAuthClient {
    pub fn new(config: &AuthorizationConfig, http: &HttpConfig) -> Result<Self> {
        let auth_url = AuthUrl::from_url(config.authorize_endpoint()?);
        let token_url = TokenUrl::from_url(config.token_endpoint()?);
        let client = BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_auth_uri(auth_url)
            .set_token_uri(token_url)
            .set_auth_type(AuthType::RequestBody);

        Ok(Self {
            client,
            http: http.client()?,
            resource: config.resource.clone(),
            scopes: config.scopes.clone(),
        })
    }

    /// Authorization URL bound to this attempt's challenge and state.
    pub fn authorization_url(&self, attempt: &AuthAttempt, redirect_uri: &str) -> Result<Url> {
        let redirect = redirect_url(redirect_uri)?;
        let verifier = PkceCodeVerifier::new(attempt.code_verifier().expose().to_string());
        let state = attempt.state().expose().to_string();

        let mut request = self
            .client
            .authorize_url(move || CsrfToken::new(state))
            .set_redirect_uri(Cow::Owned(redirect))
            .set_pkce_challenge(PkceCodeChallenge::from_code_verifier_sha256(&verifier))
            .add_extra_param("resource", self.resource.as_str());
        for scope in &self.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        let (url, _) = request.url();
        Ok(url)
    }

    /// `grant_type=authorization_code`. Never retried: codes are single use.
    pub async fn exchange_code(
        &self,
        code: &str,
        attempt: &AuthAttempt,
        redirect_uri: &str,
    ) -> Result<TokenSet> {
        let redirect = redirect_url(redirect_uri)?;
        let verifier = PkceCodeVerifier::new(attempt.code_verifier().expose().to_string());
        let response = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(verifier)
            .set_redirect_uri(Cow::Owned(redirect))
            .add_extra_param("resource", self.resource.as_str())
            .request_async(&self.http)
            .await
            .map_err(|e| map_token_error(e, "authorization code exchange"))?;
        debug!("authorization code exchanged");
        Ok(response.into())
    }

    /// `grant_type=refresh_token`. `invalid_grant` means the credential was
    /// revoked or expired and the user must sign in again.
    pub async fn refresh(&self, refresh_token: &Secret) -> Result<TokenSet> {
        let response = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.expose().to_string()))
            .add_extra_param("resource", self.resource.as_str())
            .request_async(&self.http)
            .await
            .map_err(|e| match e {
                RequestTokenError::ServerResponse(ref resp)
                    if matches!(resp.error(), BasicErrorResponseType::InvalidGrant) =>
                {
                    Error::CredentialExpired(describe_server_error(resp))
                }
                other => map_token_error(other, "refresh"),
            })?;
        debug!("refresh token exchanged");
        Ok(response.into())
    }
}

fn redirect_url(uri: &str) -> Result<RedirectUrl> {
    RedirectUrl::new(uri.to_string())
        .map_err(|e| Error::InvalidConfiguration(format!("invalid redirect URI: {e}")))
}

fn describe_server_error(resp: &BasicErrorResponse) -> String {
    match resp.error_description() {
        Some(description) => format!("{}: {description}", resp.error()),
        None => resp.error().to_string(),
    }
}

/// Response bodies are never echoed: on a parse failure they may hold tokens.
fn map_token_error(err: TokenError, operation: &str) -> Error {
    match err {
        RequestTokenError::ServerResponse(resp) => {
            Error::TokenEndpoint(format!("{operation}: {}", describe_server_error(&resp)))
        }
        RequestTokenError::Request(e) => {
            Error::UpstreamUnavailable(format!("{operation}: {e}"))
        }
        RequestTokenError::Parse(_, _) => Error::TokenEndpoint(format!(
            "{operation}: unparseable token endpoint response"
        )),
        RequestTokenError::Other(msg) => Error::TokenEndpoint(format!("{operation}: {msg}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::pkce::challenge_for;
    use std::collections::HashMap;

    fn config() -> AuthorizationConfig {
        AuthorizationConfig {
            server_url: Url::parse("https://auth.example.com/").unwrap(),
            client_id: "bugdesk-cli".into(),
            resource: "urn:mcp:bug-reporter".into(),
            scopes: vec!["issues:read".into(), "issues:write".into()],
        }
    }

    #[test]
    fn test_authorization_url_parameters() {
        let client = OAuthClient::new(&config(), &HttpConfig::default()).unwrap();
        let attempt = AuthAttempt::generate();
        let url = client
            .authorization_url(&attempt, "http://127.0.0.1:49152/")
            .unwrap();
        assert_eq!(url.path(), "/authorize");

        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["client_id"], "bugdesk-cli");
        assert_eq!(query["redirect_uri"], "http://127.0.0.1:49152/");
        assert_eq!(query["code_challenge_method"], "S256");
        assert_eq!(
            query["code_challenge"],
            challenge_for(attempt.code_verifier().expose())
        );
        assert_eq!(&query["state"], attempt.state().expose());
        assert_eq!(query["resource"], "urn:mcp:bug-reporter");
        assert_eq!(query["scope"], "issues:read issues:write");
        assert!(!url.as_str().contains(attempt.code_verifier().expose()));
    }
}
