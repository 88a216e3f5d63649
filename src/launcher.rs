//! Turns the stored refresh credential into a validated access grant and
//! starts `bugdesk-server` with it on every IDE session.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    auth::{OAuthClient, TokenValidator},
    config::CONFIG_ENV,
    error::{Error, Result},
    identity::LaunchArgs,
    secret::Secret,
    vault::CredentialVault,
};

/// A short-lived, validated access token. Lives only in launcher memory and
/// the child's argv.
#[derive(Clone)]
pub struct AccessGrant {
    pub user_id: String,
    pub access_token: Secret,
    pub expires_at: DateTime<Utc>,
    pub issued_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for AccessGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessGrant")
            .field("user_id", &self.user_id)
            .field("access_token", &self.access_token)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessGrant {
    pub fn launch_args(&self) -> LaunchArgs {
        LaunchArgs::new(self.user_id.clone(), self.access_token.clone())
    }
}

/// Starts the resource server and reports its exit code.
#[async_trait]
pub trait ServerSpawner: Send + Sync {
    async fn run(&self, entrypoint: &Path, args: &LaunchArgs) -> Result<i32>;
}

/// Spawns a real child with inherited stdio and forwards termination signals.
#[derive(Debug, Default, Clone)]
pub struct ProcessSpawner {
    config_path: Option<PathBuf>,
}

impl ProcessSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand the launcher's configuration file to the child via `$BUGDESK_CONFIG`.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }
}

#[async_trait]
impl ServerSpawner for ProcessSpawner {
    async fn run(&self, entrypoint: &Path, args: &LaunchArgs) -> Result<i32> {
        let mut command = tokio::process::Command::new(entrypoint);
        if let Some(path) = &self.config_path {
            command.env(CONFIG_ENV, path);
        }
        let mut child = command
            .args(args.to_argv())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::InvalidConfiguration(format!(
                    "cannot start {}: {e}",
                    entrypoint.display()
                ))
            })?;
        debug!(pid = ?child.id(), "resource server started");

        let status = wait_forwarding_signals(&mut child).await?;
        Ok(exit_code_of(status))
    }
}

#[cfg(unix)]
async fn wait_forwarding_signals(
    child: &mut tokio::process::Child,
) -> Result<std::process::ExitStatus> {
    use nix::{
        sys::signal::{kill, Signal},
        unistd::Pid,
    };
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        let forward = tokio::select! {
            status = child.wait() => return Ok(status?),
            _ = sigint.recv() => Signal::SIGINT,
            _ = sigterm.recv() => Signal::SIGTERM,
            _ = sighup.recv() => Signal::SIGHUP,
        };
        if let Some(pid) = child.id() {
            debug!(signal = %forward, pid, "forwarding signal to resource server");
            if let Err(e) = kill(Pid::from_raw(pid as i32), forward) {
                warn!("failed to forward {forward}: {e}");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_forwarding_signals(
    child: &mut tokio::process::Child,
) -> Result<std::process::ExitStatus> {
    loop {
        tokio::select! {
            status = child.wait() => return Ok(status?),
            _ = tokio::signal::ctrl_c() => {
                let _ = child.start_kill();
            }
        }
    }
}

/// The child's own code, or `128 + signal` when it was killed by one.
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

pub struct Launcher {
    oauth: OAuthClient,
    validator: TokenValidator,
    vault: Arc<dyn CredentialVault>,
    spawner: Arc<dyn ServerSpawner>,
    entrypoint: PathBuf,
}

impl Launcher {
    pub fn new(
        oauth: OAuthClient,
        validator: TokenValidator,
        vault: Arc<dyn CredentialVault>,
        spawner: Arc<dyn ServerSpawner>,
        entrypoint: PathBuf,
    ) -> Self {
        Self {
            oauth,
            validator,
            vault,
            spawner,
            entrypoint,
        }
    }

    /// Refresh, persist any rotated refresh token, then validate.
    pub async fn prepare(&self) -> Result<AccessGrant> {
        let refresh_token = self.vault.get()?.ok_or(Error::CredentialMissing)?;

        let tokens = self.oauth.refresh(&refresh_token).await?;
        if let Some(rotated) = tokens.refresh_token.as_ref() {
            if rotated != &refresh_token {
                self.vault.set(rotated)?;
                info!("refresh token rotated and stored");
            }
        }

        let validated = self.validator.validate(tokens.access_token.expose())?;
        Ok(AccessGrant {
            user_id: validated.user_id,
            access_token: tokens.access_token,
            expires_at: validated.expires_at,
            issued_at: validated.issued_at,
        })
    }

    /// Prepare a grant and run the server to completion. Nothing is spawned
    /// unless every check in [`Launcher::prepare`] passed.
    pub async fn run(&self) -> Result<i32> {
        let grant = self.prepare().await?;
        info!(
            user_id = %grant.user_id,
            expires_at = %grant.expires_at,
            entrypoint = %self.entrypoint.display(),
            "starting resource server"
        );
        let code = self
            .spawner
            .run(&self.entrypoint, &grant.launch_args())
            .await?;
        debug!(code, "resource server exited");
        Ok(code)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exit_code_passthrough() {
        let status = tokio::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .status()
            .await
            .unwrap();
        assert_eq!(exit_code_of(status), 3);
    }

    #[tokio::test]
    async fn test_signal_exit_code() {
        let status = tokio::process::Command::new("sh")
            .args(["-c", "kill -TERM $$"])
            .status()
            .await
            .unwrap();
        assert_eq!(exit_code_of(status), 128 + 15);
    }

    #[test]
    fn test_grant_debug_redacts_token() {
        let grant = AccessGrant {
            user_id: "u-42".into(),
            access_token: Secret::new("eyJ.secret.sig"),
            expires_at: Utc::now(),
            issued_at: None,
        };
        assert!(!format!("{grant:?}").contains("eyJ"));
    }
}
