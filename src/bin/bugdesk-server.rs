//! `bugdesk-server <userId> <accessToken>`
//!
//! Started by `bugdesk-launch`. Re-validates the identity it was given and
//! exits before reading stdin if anything is wrong. Logs go to stderr; set
//! `BUGDESK_LOG` for more detail.

use std::{process::ExitCode, sync::Arc};

use bugdesk::{
    auth::{OboExchanger, TokenValidator},
    config::Config,
    downstream::SimilaritySearchClient,
    identity::{Identity, LaunchArgs},
    logging,
    store::{IssueStore, JsonFileIssueStore, MemoryIssueStore},
    tools::BugdeskConn,
    Result, Server,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init(false);

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => e.report(),
    }
}

async fn run() -> Result<()> {
    let args = LaunchArgs::from_args(std::env::args().skip(1))?;
    let config = Config::load(None)?;
    let validator =
        TokenValidator::from_config(&config.validation, config.authorization.resource.clone())?;
    let identity = Identity::establish(args, &validator)?;
    info!(user_id = %identity.user_id(), "identity established");

    let store: Arc<dyn IssueStore> = match &config.server.store_path {
        Some(path) => Arc::new(JsonFileIssueStore::new(path)),
        None => {
            warn!("no server.store_path configured; serving an empty in-memory store");
            Arc::new(MemoryIssueStore::new())
        }
    };

    let mut conn = BugdeskConn::new(identity, store);
    if let Some(downstream) = &config.downstream {
        let exchanger = OboExchanger::new(&config.authorization, &config.http)?;
        conn = conn.with_search(SimilaritySearchClient::new(
            downstream,
            exchanger,
            config.http.client()?,
        ));
    }

    let server = Server::new(conn).with_tool_timeout(config.server.tool_timeout());
    tokio::spawn(cancel_on_signal(server.shutdown_token()));
    server.serve_stdio().await
}

#[cfg(unix)]
async fn cancel_on_signal(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut sigint), Ok(mut sigterm)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) else {
        warn!("cannot install signal handlers");
        return;
    };
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    shutdown.cancel();
}

#[cfg(not(unix))]
async fn cancel_on_signal(shutdown: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received Ctrl-C");
        shutdown.cancel();
    }
}
