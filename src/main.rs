use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};

use mcp_switchboard::config::{
    load_settings_with, load_store_seed_with, MemoryStore, OsConfigProvider,
};
use mcp_switchboard::events::{EventEmitter, NullEmitter, PendingApprovals};
use mcp_switchboard::http::{start_http_server, AppState};
use mcp_switchboard::logging::SqlitePublisher;
use mcp_switchboard::router::GlobalRequestRouter;
use mcp_switchboard::session_store::{SessionStore, SessionStoreDeps};
use mcp_switchboard::supervisor::{ServerSupervisor, SupervisorDeps};

#[tokio::main]
async fn main() -> Result<()> {
    // Structured logging via tracing with env filter.
    // Configure via RUST_LOG, e.g., RUST_LOG=info,mcp_switchboard=debug
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,mcp_switchboard=debug"))
        .unwrap_or_default();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();

    let cp = OsConfigProvider;
    let settings = load_settings_with(&cp);

    let store = MemoryStore::new();
    let seed = load_store_seed_with(&cp);
    for user in seed.users {
        store.put_user(user).await;
    }
    for server in seed.servers {
        if let Err(e) = server.validate() {
            warn!(target = "main", error = %e, "skipping invalid server entity");
            continue;
        }
        store.put_server(server).await;
    }
    for (token, user_id) in &seed.tokens {
        store.put_token(token, user_id).await;
    }

    let logger = Arc::new(SqlitePublisher::start(&cp));
    let emitter: Arc<dyn EventEmitter> = Arc::new(NullEmitter);
    let router = GlobalRequestRouter::new();
    let supervisor = ServerSupervisor::new(SupervisorDeps {
        server_store: store.clone(),
        user_store: store.clone(),
        router: router.clone(),
        emitter: emitter.clone(),
        logger: logger.clone(),
        settings: settings.clone(),
    });
    let approvals = PendingApprovals::new(emitter.clone());
    let sessions = SessionStore::new(SessionStoreDeps {
        supervisor: supervisor.clone(),
        router: router.clone(),
        user_store: store.clone(),
        approvals,
        emitter: emitter.clone(),
        logger: logger.clone(),
    });
    let sweeper = sessions.spawn_sweeper();

    let addr: std::net::SocketAddr = settings
        .listen_addr
        .parse()
        .with_context(|| format!("listen addr {}", settings.listen_addr))?;
    let state = AppState {
        sessions: sessions.clone(),
        verifier: store.clone(),
        settings: settings.clone(),
    };
    let (server_handle, local) = start_http_server(state, addr)
        .await
        .map_err(|e| anyhow!(e))?;
    info!(target = "main", addr = %local, "endpoint ready");

    // Connect enabled servers in the background so the endpoint accepts
    // clients before downstreams settle.
    {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            let report = supervisor.connect_all_servers().await;
            info!(
                target = "main",
                connected = report.success_servers.len(),
                failed = report.failed_servers.len(),
                "auto_connect_complete"
            );
            for failure in &report.failed_servers {
                warn!(target = "main", server = %failure.server_id, error = %failure.error, "auto_connect_failed");
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!(target = "main", "shutting down");

    // Teardown paths are idempotent; a late second signal finds nothing to do.
    sessions.close_all().await;
    supervisor.shutdown().await;
    sweeper.abort();
    server_handle.abort();
    Ok(())
}
