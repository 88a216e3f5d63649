//! One-time interactive sign-in for bugdesk.
//!
//! Usage:
//!   bugdesk-auth login     # browser sign-in, stores the refresh credential
//!   bugdesk-auth status    # is a credential stored?
//!   bugdesk-auth logout    # delete the stored credential

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use bugdesk::{
    auth::{Authenticator, CredentialStatus, OAuthClient, SystemBrowser, TokenValidator},
    config::Config,
    logging,
    vault::{CredentialVault, KeyringVault},
    Result,
};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(long, env = "BUGDESK_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in through the browser and store the refresh credential
    Login,
    /// Delete the stored credential
    Logout,
    /// Report whether a credential is stored
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => e.report(),
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(args.config.as_deref())?;
    let validator =
        TokenValidator::from_config(&config.validation, config.authorization.resource.clone())?;
    let oauth = OAuthClient::new(&config.authorization, &config.http)?;
    let vault: Arc<dyn CredentialVault> = Arc::new(KeyringVault::from_config(&config.vault));
    let authenticator = Authenticator::new(oauth, validator, vault, Arc::new(SystemBrowser));

    match args.command {
        Command::Login => {
            let token = authenticator.login().await?;
            println!(
                "Signed in as {}. Access tokens will be refreshed on every launch.",
                token.user_id
            );
        }
        Command::Logout => {
            authenticator.logout()?;
            println!("Signed out; the stored credential was removed.");
        }
        Command::Status => match authenticator.status()? {
            CredentialStatus::Present => println!("A credential is stored."),
            CredentialStatus::Absent => {
                println!("No credential stored. Run `bugdesk-auth login`.")
            }
        },
    }
    Ok(())
}
