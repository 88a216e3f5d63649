//! RFC 8693 token exchange: trade the inbound access token for one scoped to a
//! downstream audience, so the resource server never forwards its own token.

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::{
    config::{AuthorizationConfig, HttpConfig},
    error::Result,
    secret::Secret,
};

pub const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
pub const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeFailure {
    #[error("authorization server refused the exchange: {0}")]
    ExchangeDenied(String),
    #[error("token exchange endpoint unavailable: {0}")]
    DownstreamUnavailable(String),
}

#[derive(Debug, Clone)]
pub struct ExchangedToken {
    pub access_token: Secret,
    pub audience: String,
    pub expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct ExchangeResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct ExchangeErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OboExchanger {
    endpoint: Url,
    client_id: String,
    http: reqwest::Client,
}

impl OboExchanger {
    pub fn new(config: &AuthorizationConfig, http: &HttpConfig) -> Result<Self> {
        Ok(Self {
            endpoint: config.token_exchange_endpoint()?,
            client_id: config.client_id.clone(),
            http: http.client()?,
        })
    }

    pub async fn exchange(
        &self,
        inbound: &Secret,
        target_audience: &str,
    ) -> std::result::Result<ExchangedToken, ExchangeFailure> {
        let params = [
            ("grant_type", TOKEN_EXCHANGE_GRANT),
            ("subject_token", inbound.expose()),
            ("subject_token_type", ACCESS_TOKEN_TYPE),
            ("audience", target_audience),
            ("client_id", self.client_id.as_str()),
        ];

        let response = self
            .http
            .post(self.endpoint.clone())
            .form(&params)
            .send()
            .await
            .map_err(|e| ExchangeFailure::DownstreamUnavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ExchangeFailure::DownstreamUnavailable(format!(
                "HTTP {status}"
            )));
        }
        if !status.is_success() {
            let reason = match response.json::<ExchangeErrorResponse>().await {
                Ok(body) => match body.error_description {
                    Some(description) => format!("{}: {description}", body.error),
                    None => body.error,
                },
                Err(_) => format!("HTTP {status}"),
            };
            warn!(audience = target_audience, %reason, "token exchange denied");
            return Err(ExchangeFailure::ExchangeDenied(reason));
        }

        let body: ExchangeResponse = response.json().await.map_err(|_| {
            ExchangeFailure::ExchangeDenied("unparseable token exchange response".into())
        })?;
        if body.access_token.is_empty() {
            return Err(ExchangeFailure::ExchangeDenied(
                "empty access token in exchange response".into(),
            ));
        }
        if body.access_token == inbound.expose() {
            warn!(
                audience = target_audience,
                "token exchange returned the inbound token; refusing to forward it"
            );
            return Err(ExchangeFailure::ExchangeDenied(
                "exchange returned the inbound token unchanged".into(),
            ));
        }

        debug!(audience = target_audience, "token exchanged");
        Ok(ExchangedToken {
            access_token: Secret::new(body.access_token),
            audience: target_audience.to_string(),
            expires_in: body.expires_in,
        })
    }
}
