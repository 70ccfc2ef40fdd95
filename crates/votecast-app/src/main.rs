// Votecast server entry point.
//
// Startup sequence:
// 1. Initialize tracing
// 2. Load config
// 3. Open the session store
// 4. Build hub, vote caster and request service
// 5. Bind and spawn the WebSocket server
// 6. Wait for Ctrl+C, then close every observer

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use votecast_core::auth::CredentialStore;
use votecast_core::config;
use votecast_core::hub::NotificationHub;
use votecast_core::orchestrator::VoteCaster;
use votecast_core::service::VotingService;
use votecast_core::store::SessionStore;
use votecast_core::workflow::VoteWorkflow;
use votecast_core::ws_server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing
    init_tracing()?;
    info!("Votecast starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: {} users, snapshot limit {}",
        config.credentials.users.len(),
        config.voting.snapshot_limit
    );

    // 3. Open the session store
    let store = Arc::new(
        SessionStore::open(&config.database).context("failed to open session store")?,
    );
    info!("Database opened at {}", config.database.path);

    // 4. Build hub, vote caster and request service
    let hub = Arc::new(NotificationHub::new(config.hub.write_timeout()));
    let caster = VoteCaster::new(
        VoteWorkflow::new(store),
        Arc::clone(&hub),
        config.voting.snapshot_limit,
    );
    let credentials = CredentialStore::from_config(&config.credentials);
    if credentials.is_empty() {
        info!("No credentials configured; every vote will be rejected");
    }
    let service = Arc::new(VotingService::new(
        caster,
        credentials,
        config.voting.request_timeout(),
    ));

    // 5. Bind and spawn the WebSocket server
    let addr = config.server.addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind WebSocket server on {addr}"))?;
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(ws_server::run(
        listener,
        Arc::clone(&hub),
        service,
        shutdown.clone(),
    ));
    info!("Application ready. WebSocket server listening on {addr}");

    // 6. Wait for Ctrl+C
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("Shutdown requested");

    shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("WebSocket server error: {e:#}"),
        Err(e) => error!("WebSocket server task failed: {e}"),
    }
    hub.close_all().await;

    info!("Votecast shut down cleanly");
    Ok(())
}

/// Initialize tracing to stdout, filtered by `RUST_LOG`.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("votecast=info,warn")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
