//! Entry point the IDE runs for every session. Refreshes and validates the
//! stored credential, then runs `bugdesk-server` as a child on the inherited
//! stdio, forwarding termination signals and returning its exit code. Nothing
//! is started unless validation succeeds.

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use bugdesk::{
    auth::{OAuthClient, TokenValidator},
    config::Config,
    launcher::{Launcher, ProcessSpawner},
    logging,
    vault::{CredentialVault, KeyringVault},
    Result,
};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(long, env = "BUGDESK_CONFIG")]
    config: Option<PathBuf>,

    /// Resource server executable, overriding `server.entrypoint`
    #[arg(long)]
    entrypoint: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.verbose);

    match run(args).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => e.report(),
    }
}

async fn run(args: Args) -> Result<i32> {
    let config = Config::load(args.config.as_deref())?;
    let validator =
        TokenValidator::from_config(&config.validation, config.authorization.resource.clone())?;
    let oauth = OAuthClient::new(&config.authorization, &config.http)?;
    let vault: Arc<dyn CredentialVault> = Arc::new(KeyringVault::from_config(&config.vault));
    let entrypoint = match args.entrypoint {
        Some(path) => path,
        None => config.server.resolve_entrypoint()?,
    };

    let mut spawner = ProcessSpawner::new();
    if let Some(path) = args.config {
        spawner = spawner.with_config_path(path);
    }

    Launcher::new(oauth, validator, vault, Arc::new(spawner), entrypoint)
        .run()
        .await
}
