use std::{collections::HashSet, fs};

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    config::{SigningAlgorithm, ValidationConfig},
    error::{Error as CrateError, Result},
};

/// Why an access token was refused. Messages never contain the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    #[error("signature or format is invalid")]
    SignatureInvalid,
    #[error("token has expired")]
    Expired,
    #[error("token audience does not match this resource")]
    WrongAudience,
    #[error("token is missing a required claim")]
    MissingClaims,
}

/// Claims the rest of the system is allowed to rely on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedToken {
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    pub issued_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
}

/// Offline JWT validation against locally held key material.
///
/// Checks run in a fixed order: signature and format, required claims
/// (`sub`, `exp`, `aud`), expiry, audience, then issuer when one is
/// configured. A foreign issuer is reported as [`ValidationFailure::SignatureInvalid`].
#[derive(Clone)]
pub struct TokenValidator {
    key: DecodingKey,
    algorithm: Algorithm,
    audience: String,
    issuer: Option<String>,
    leeway_secs: u64,
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("algorithm", &self.algorithm)
            .field("audience", &self.audience)
            .field("issuer", &self.issuer)
            .field("leeway_secs", &self.leeway_secs)
            .finish_non_exhaustive()
    }
}

impl TokenValidator {
    pub fn new(key: DecodingKey, algorithm: SigningAlgorithm, audience: impl Into<String>) -> Self {
        Self {
            key,
            algorithm: match algorithm {
                SigningAlgorithm::HS256 => Algorithm::HS256,
                SigningAlgorithm::RS256 => Algorithm::RS256,
                SigningAlgorithm::ES256 => Algorithm::ES256,
            },
            audience: audience.into(),
            issuer: None,
            leeway_secs: 0,
        }
    }

    pub fn hs256(secret: &[u8], audience: impl Into<String>) -> Self {
        Self::new(
            DecodingKey::from_secret(secret),
            SigningAlgorithm::HS256,
            audience,
        )
    }

    /// Read key material from `validation.key_path`.
    pub fn from_config(config: &ValidationConfig, audience: impl Into<String>) -> Result<Self> {
        let bytes = fs::read(&config.key_path).map_err(|e| {
            CrateError::InvalidConfiguration(format!(
                "cannot read validation key {}: {e}",
                config.key_path.display()
            ))
        })?;
        let bad_key = |e: jsonwebtoken::errors::Error| {
            CrateError::InvalidConfiguration(format!("invalid validation key: {e}"))
        };
        let key = match config.algorithm {
            SigningAlgorithm::HS256 => DecodingKey::from_secret(bytes.trim_ascii_end()),
            SigningAlgorithm::RS256 => DecodingKey::from_rsa_pem(&bytes).map_err(bad_key)?,
            SigningAlgorithm::ES256 => DecodingKey::from_ec_pem(&bytes).map_err(bad_key)?,
        };
        let mut validator = Self::new(key, config.algorithm, audience)
            .with_leeway(config.leeway_secs);
        if let Some(issuer) = &config.issuer {
            validator = validator.with_issuer(issuer.clone());
        }
        Ok(validator)
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn with_leeway(mut self, secs: u64) -> Self {
        self.leeway_secs = secs;
        self
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn validate(&self, token: &str) -> std::result::Result<ValidatedToken, ValidationFailure> {
        self.validate_at(token, Utc::now())
    }

    pub fn validate_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<ValidatedToken, ValidationFailure> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        let claims = decode::<Map<String, Value>>(token, &self.key, &validation)
            .map_err(|_| ValidationFailure::SignatureInvalid)?
            .claims;

        let user_id = claims
            .get("sub")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or(ValidationFailure::MissingClaims)?;
        let exp = claims
            .get("exp")
            .and_then(Value::as_i64)
            .ok_or(ValidationFailure::MissingClaims)?;
        let aud = claims.get("aud").ok_or(ValidationFailure::MissingClaims)?;

        let leeway = i64::try_from(self.leeway_secs).unwrap_or(i64::MAX);
        if exp.saturating_add(leeway) <= now.timestamp() {
            return Err(ValidationFailure::Expired);
        }

        if !self.audience_matches(aud) {
            return Err(ValidationFailure::WrongAudience);
        }

        if let Some(expected) = &self.issuer {
            let issuer = claims.get("iss").and_then(Value::as_str);
            if issuer != Some(expected.as_str()) {
                return Err(ValidationFailure::SignatureInvalid);
            }
        }

        let expires_at = Utc
            .timestamp_opt(exp, 0)
            .single()
            .ok_or(ValidationFailure::MissingClaims)?;
        let issued_at = claims
            .get("iat")
            .and_then(Value::as_i64)
            .and_then(|iat| Utc.timestamp_opt(iat, 0).single());

        Ok(ValidatedToken {
            user_id: user_id.to_string(),
            expires_at,
            issued_at,
            scope: claims
                .get("scope")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    /// A plain string, or an array whose only member is the expected value.
    fn audience_matches(&self, aud: &Value) -> bool {
        match aud {
            Value::String(s) => s == &self.audience,
            Value::Array(values) => {
                values.len() == 1 && values[0].as_str() == Some(self.audience.as_str())
            }
            _ => false,
        }
    }
}
