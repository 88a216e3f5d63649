//! The argv trust boundary between `bugdesk-launch` and `bugdesk-server`, and
//! the per-tenant scope every data access must carry.

use std::fmt;

use tracing::warn;

use crate::{
    auth::TokenValidator,
    error::{Error, Result},
    secret::Secret,
};

/// `bugdesk-server <userId> <accessToken>`, parsed once at start-up.
#[derive(Clone)]
pub struct LaunchArgs {
    pub user_id: String,
    pub access_token: Secret,
}

impl LaunchArgs {
    pub fn new(user_id: impl Into<String>, access_token: Secret) -> Self {
        Self {
            user_id: user_id.into(),
            access_token,
        }
    }

    /// Parse the positional arguments after the program name.
    pub fn from_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        match args.as_slice() {
            [user_id, token] => {
                if user_id.trim().is_empty() {
                    return Err(Error::InvalidLaunchArgs("user id is empty".into()));
                }
                if token.is_empty() {
                    return Err(Error::InvalidLaunchArgs("access token is empty".into()));
                }
                Ok(Self::new(user_id.clone(), Secret::new(token.clone())))
            }
            other => Err(Error::InvalidLaunchArgs(format!(
                "expected exactly 2 arguments <userId> <accessToken>, got {}",
                other.len()
            ))),
        }
    }

    pub fn to_argv(&self) -> [String; 2] {
        [
            self.user_id.clone(),
            self.access_token.expose().to_string(),
        ]
    }
}

impl fmt::Debug for LaunchArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchArgs")
            .field("user_id", &self.user_id)
            .field("access_token", &self.access_token)
            .finish()
    }
}

/// The caller the resource server acts for. Immutable for the life of the process.
#[derive(Debug, Clone)]
pub struct Identity {
    user_id: String,
    access_token: Secret,
}

impl Identity {
    /// Re-validate the launch token and bind it to the claimed user.
    pub fn establish(args: LaunchArgs, validator: &TokenValidator) -> Result<Self> {
        let validated = validator.validate(args.access_token.expose())?;
        if validated.user_id != args.user_id {
            warn!(
                target: "bugdesk::security",
                claimed = %args.user_id,
                "launch user id does not match token subject"
            );
            return Err(Error::IdentityMismatch);
        }
        Ok(Self {
            user_id: args.user_id,
            access_token: args.access_token,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Inbound token, only ever handed to the token-exchange endpoint.
    pub fn access_token(&self) -> &Secret {
        &self.access_token
    }

    pub fn scope(&self) -> TenantScope {
        TenantScope {
            owner_id: self.user_id.clone(),
        }
    }
}

/// Proof that a data access is filtered to one tenant. Only obtainable from a
/// validated [`Identity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantScope {
    owner_id: String,
}

impl TenantScope {
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Equality filter on the owner id. A miss is logged and treated as absent.
    pub fn owns(&self, owner_id: &str, record_id: &str) -> bool {
        if owner_id == self.owner_id {
            return true;
        }
        warn!(
            target: "bugdesk::tenant",
            tenant = %self.owner_id,
            record = record_id,
            "cross-tenant access attempt treated as not found"
        );
        false
    }

    #[cfg(test)]
    pub(crate) fn for_tests(owner_id: &str) -> Self {
        Self {
            owner_id: owner_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ValidationFailure;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &[u8] = b"identity-test-secret";
    const AUD: &str = "urn:mcp:bug-reporter";

    fn token_for(sub: &str, aud: &str) -> String {
        let exp = chrono::Utc::now().timestamp() + 600;
        encode(
            &Header::default(),
            &json!({"sub": sub, "aud": aud, "exp": exp}),
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_exactly_two_args() {
        let args = LaunchArgs::from_args(["u-42", "tok"]).unwrap();
        assert_eq!(args.user_id, "u-42");
        assert_eq!(args.to_argv(), ["u-42".to_string(), "tok".to_string()]);

        for bad in [vec![], vec!["u-42"], vec!["u-42", "tok", "extra"], vec!["", "tok"]] {
            assert!(matches!(
                LaunchArgs::from_args(bad),
                Err(Error::InvalidLaunchArgs(_))
            ));
        }
    }

    #[test]
    fn test_debug_never_prints_token() {
        let args = LaunchArgs::from_args(["u-42", "super-secret-token"]).unwrap();
        assert!(!format!("{args:?}").contains("super-secret-token"));
    }

    #[test]
    fn test_establish_requires_matching_subject() {
        let validator = TokenValidator::hs256(SECRET, AUD);
        let identity = Identity::establish(
            LaunchArgs::from_args(["u-42", token_for("u-42", AUD).as_str()]).unwrap(),
            &validator,
        )
        .unwrap();
        assert_eq!(identity.user_id(), "u-42");
        assert_eq!(identity.scope().owner_id(), "u-42");

        let mismatch = Identity::establish(
            LaunchArgs::from_args(["u-7", token_for("u-42", AUD).as_str()]).unwrap(),
            &validator,
        );
        assert!(matches!(mismatch, Err(Error::IdentityMismatch)));

        let wrong_aud = Identity::establish(
            LaunchArgs::from_args(["u-42", token_for("u-42", "urn:other").as_str()]).unwrap(),
            &validator,
        );
        assert!(matches!(
            wrong_aud,
            Err(Error::TokenRejected(ValidationFailure::WrongAudience))
        ));
    }

    #[test]
    fn test_establish_refuses_every_invalid_token() {
        let validator = TokenValidator::hs256(SECRET, AUD);
        let now = chrono::Utc::now().timestamp();
        let signed = |claims: serde_json::Value, key: &[u8]| {
            encode(&Header::default(), &claims, &EncodingKey::from_secret(key)).unwrap()
        };

        let cases = [
            (
                signed(json!({"sub": "u-42", "aud": AUD, "exp": now - 60}), SECRET),
                ValidationFailure::Expired,
            ),
            (
                signed(json!({"sub": "u-42", "aud": AUD, "exp": now + 600}), &b"other-key"[..]),
                ValidationFailure::SignatureInvalid,
            ),
            (
                signed(json!({"aud": AUD, "exp": now + 600}), SECRET),
                ValidationFailure::MissingClaims,
            ),
        ];
        for (token, expected) in cases {
            let result = Identity::establish(
                LaunchArgs::from_args(["u-42", token.as_str()]).unwrap(),
                &validator,
            );
            match result {
                Err(Error::TokenRejected(failure)) => assert_eq!(failure, expected),
                other => panic!("expected {expected:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_scope_ownership() {
        let scope = TenantScope::for_tests("u-42");
        assert!(scope.owns("u-42", "ISS-1"));
        assert!(!scope.owns("u-7", "ISS-2"));
    }
}
