//! Configuration shared by `bugdesk-auth`, `bugdesk-launch` and `bugdesk-server`.
//!
//! Searched in order:
//! 1. the `--config` flag
//! 2. `$BUGDESK_CONFIG`
//! 3. `$XDG_CONFIG_HOME/bugdesk/config.toml`
//! 4. `~/.config/bugdesk/config.toml`
//!
//! ```toml
//! [authorization]
//! server_url = "https://auth.example.com/"
//! client_id = "bugdesk-cli"
//! resource = "urn:mcp:bug-reporter"
//! scopes = ["issues:read", "issues:write"]
//!
//! [validation]
//! algorithm = "RS256"
//! key_path = "/etc/bugdesk/issuer.pem"
//! issuer = "https://auth.example.com/"
//! ```

use std::{
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

pub const CONFIG_ENV: &str = "BUGDESK_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub authorization: AuthorizationConfig,
    pub validation: ValidationConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub downstream: Option<DownstreamConfig>,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthorizationConfig {
    /// Base URL of the authorization server; `authorize`, `token` and
    /// `token-exchange` are resolved against it.
    pub server_url: Url,
    pub client_id: String,
    /// Audience every access token must be scoped to.
    pub resource: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl AuthorizationConfig {
    pub fn authorize_endpoint(&self) -> Result<Url> {
        self.endpoint("authorize")
    }

    pub fn token_endpoint(&self) -> Result<Url> {
        self.endpoint("token")
    }

    pub fn token_exchange_endpoint(&self) -> Result<Url> {
        self.endpoint("token-exchange")
    }

    fn endpoint(&self, name: &str) -> Result<Url> {
        let mut base = self.server_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join(name)
            .map_err(|e| Error::InvalidConfiguration(format!("bad {name} endpoint: {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    HS256,
    RS256,
    ES256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationConfig {
    pub algorithm: SigningAlgorithm,
    /// Shared secret (HS256) or PEM public key (RS256, ES256).
    pub key_path: PathBuf,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub leeway_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VaultConfig {
    pub service: String,
    pub account: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            service: "bugdesk".to_string(),
            account: "refresh-token".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Resource server executable. Defaults to `bugdesk-server` next to the
    /// running launcher.
    pub entrypoint: Option<PathBuf>,
    pub tool_timeout_secs: u64,
    /// JSON issue store. Without it the server runs on an empty in-memory store.
    pub store_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            entrypoint: None,
            tool_timeout_secs: 30,
            store_path: None,
        }
    }
}

impl ServerConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn resolve_entrypoint(&self) -> Result<PathBuf> {
        if let Some(path) = &self.entrypoint {
            return Ok(path.clone());
        }
        let exe = std::env::current_exe()?;
        let dir = exe.parent().ok_or_else(|| {
            Error::InvalidConfiguration("cannot locate the launcher's directory".into())
        })?;
        Ok(dir.join(format!("bugdesk-server{}", std::env::consts::EXE_SUFFIX)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownstreamConfig {
    pub search_url: Url,
    /// Audience requested from the token-exchange endpoint.
    pub audience: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

impl HttpConfig {
    pub fn client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .timeout(Duration::from_secs(self.request_timeout_secs))
            // Token endpoints must not redirect; following one would leak the form body.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::InvalidConfiguration(format!("HTTP client: {e}")))
    }
}

impl Config {
    /// Load from an explicit path or the first existing default location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path().ok_or_else(|| {
                Error::InvalidConfiguration(format!(
                    "no configuration found; pass --config or set ${CONFIG_ENV}"
                ))
            })?,
        };
        let contents = fs::read_to_string(&path).map_err(|e| {
            Error::InvalidConfiguration(format!("cannot read {}: {e}", path.display()))
        })?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(contents).map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        let candidates = [
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(|d| PathBuf::from(d).join("bugdesk/config.toml")),
            dirs::home_dir().map(|h| h.join(".config/bugdesk/config.toml")),
        ];
        candidates.into_iter().flatten().find(|p| p.exists())
    }

    pub fn validate(&self) -> Result<()> {
        let auth = &self.authorization;
        require_secure(&auth.server_url, "authorization.server_url")?;
        if auth.client_id.trim().is_empty() {
            return Err(Error::InvalidConfiguration(
                "authorization.client_id must not be empty".into(),
            ));
        }
        if auth.resource.trim().is_empty() {
            return Err(Error::InvalidConfiguration(
                "authorization.resource must not be empty".into(),
            ));
        }
        if self.server.tool_timeout_secs == 0 {
            return Err(Error::InvalidConfiguration(
                "server.tool_timeout_secs must be positive".into(),
            ));
        }
        if let Some(downstream) = &self.downstream {
            require_secure(&downstream.search_url, "downstream.search_url")?;
            if downstream.audience.trim().is_empty() {
                return Err(Error::InvalidConfiguration(
                    "downstream.audience must not be empty".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Credentials only travel over HTTPS; plain HTTP is allowed for loopback hosts.
fn require_secure(url: &Url, field: &str) -> Result<()> {
    match url.scheme() {
        "https" => Ok(()),
        "http" if is_loopback(url) => Ok(()),
        other => Err(Error::InvalidConfiguration(format!(
            "{field} must use https (got {other}://)"
        ))),
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host_str() {
        Some("localhost") => true,
        Some(host) => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [authorization]
        server_url = "https://auth.example.com/oauth"
        client_id = "bugdesk-cli"
        resource = "urn:mcp:bug-reporter"

        [validation]
        algorithm = "HS256"
        key_path = "/tmp/key"
    "#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.vault.service, "bugdesk");
        assert_eq!(config.vault.account, "refresh-token");
        assert_eq!(config.server.tool_timeout(), Duration::from_secs(30));
        assert_eq!(config.validation.leeway_secs, 0);
        assert!(config.downstream.is_none());
        assert!(config.authorization.scopes.is_empty());
    }

    #[test]
    fn test_endpoints_resolve_under_base_path() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        let auth = &config.authorization;
        assert_eq!(
            auth.authorize_endpoint().unwrap().as_str(),
            "https://auth.example.com/oauth/authorize"
        );
        assert_eq!(
            auth.token_endpoint().unwrap().as_str(),
            "https://auth.example.com/oauth/token"
        );
        assert_eq!(
            auth.token_exchange_endpoint().unwrap().as_str(),
            "https://auth.example.com/oauth/token-exchange"
        );
    }

    #[test]
    fn test_plain_http_rejected_unless_loopback() {
        let insecure = MINIMAL.replace("https://auth.example.com", "http://auth.example.com");
        assert!(matches!(
            Config::from_toml_str(&insecure),
            Err(Error::InvalidConfiguration(_))
        ));

        let loopback = MINIMAL.replace("https://auth.example.com", "http://127.0.0.1:8080");
        assert!(Config::from_toml_str(&loopback).is_ok());
    }

    #[test]
    fn test_empty_resource_rejected() {
        let bad = MINIMAL.replace("urn:mcp:bug-reporter", " ");
        let err = Config::from_toml_str(&bad).unwrap_err();
        assert!(err.to_string().contains("resource"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, MINIMAL).unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.authorization.client_id, "bugdesk-cli");

        let missing = dir.path().join("absent.toml");
        assert!(matches!(
            Config::load(Some(&missing)),
            Err(Error::InvalidConfiguration(_))
        ));
    }
}
