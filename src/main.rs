use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use inbox_drafter::config::{LedgerConfig, LogConfig, PipelineConfig, ServerConfig, process_env};
use inbox_drafter::ledger;
use inbox_drafter::llm::{LlmAssistant, LlmConfig, create_provider};
use inbox_drafter::logging;
use inbox_drafter::mailbox::{GraphConfig, GraphMailbox};
use inbox_drafter::pipeline::Orchestrator;
use inbox_drafter::webhook::{self, webhook_routes};

/// Connect timeout for outbound HTTP; per-attempt deadlines come from the
/// pipeline config.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = logging::init(&LogConfig::from_vars(&process_env));

    // ── Configuration ───────────────────────────────────────────────
    let pipeline_config =
        PipelineConfig::from_vars(&process_env).context("invalid pipeline configuration")?;
    let ledger_config =
        LedgerConfig::from_vars(&process_env).context("invalid ledger configuration")?;
    let server_config =
        ServerConfig::from_vars(&process_env).context("invalid webhook configuration")?;
    let llm_config = LlmConfig::from_vars(&process_env).context("invalid LLM configuration")?;
    let graph_config =
        GraphConfig::from_vars(&process_env).context("invalid Microsoft Graph configuration")?;

    info!("Inbox Drafter v{}", env!("CARGO_PKG_VERSION"));
    info!(
        max_redraft_attempts = pipeline_config.max_redraft_attempts,
        review_exhausted_policy = ?pipeline_config.review_exhausted_policy,
        retry_attempts = pipeline_config.retry.max_attempts,
        "Pipeline configured"
    );

    // ── Collaborators ───────────────────────────────────────────────
    let ledger = ledger::open(&ledger_config)
        .await
        .context("failed to open dedup ledger")?;

    let http = reqwest::Client::builder()
        .connect_timeout(HTTP_CONNECT_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;

    let provider = create_provider(&llm_config, http.clone());
    let llm = Arc::new(LlmAssistant::new(provider));
    let mailbox = Arc::new(GraphMailbox::new(http, &graph_config));
    info!(user = %graph_config.user, "Using Microsoft Graph mailbox");

    let orchestrator = Arc::new(Orchestrator::new(ledger, mailbox, llm, pipeline_config));

    // ── Dispatcher ──────────────────────────────────────────────────
    let (tx, source) = webhook::channel(server_config.queue_capacity);
    let dispatcher = tokio::spawn(Arc::clone(&orchestrator).run(source));

    // ── HTTP server ─────────────────────────────────────────────────
    let app = webhook_routes(tx, &server_config);
    let listener = tokio::net::TcpListener::bind(server_config.bind)
        .await
        .with_context(|| format!("failed to bind {}", server_config.bind))?;
    info!(
        "Listening on http://{}/api/graph-notifications",
        server_config.bind
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    // The router (and with it the last sender) is gone; let queued runs finish.
    dispatcher.await.context("pipeline dispatcher panicked")?;
    info!("Shut down cleanly");
    Ok(())
}
