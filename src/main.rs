use std::sync::Arc;

use anyhow::Context;

use autoflow::automation::scheduler;
use autoflow::automation::{
    Clock, HttpSender, LoggingSender, MessageSender, Orchestrator, SystemClock,
};
use autoflow::config::AutomationConfig;
use autoflow::server::automation_routes;
use autoflow::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AutomationConfig::from_env().context("invalid configuration")?;

    eprintln!("Autoflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api/events", config.port);

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = std::path::Path::new(&config.db_path);
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path))?,
    );
    eprintln!("   Database: {}", config.db_path);

    // ── Delivery ─────────────────────────────────────────────────────────
    let sender: Arc<dyn MessageSender> = match &config.delivery_url {
        Some(url) => {
            eprintln!("   Delivery: {url}");
            Arc::new(HttpSender::new(url.clone(), config.delivery_token.clone()))
        }
        None => {
            eprintln!("   Delivery: disabled (intents are logged only)");
            Arc::new(LoggingSender)
        }
    };

    // ── Orchestrator + delay ticker ──────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let orchestrator = Arc::new(
        Orchestrator::new(Arc::clone(&db), sender, &config).with_clock(Arc::clone(&clock)),
    );
    let _ticker = scheduler::spawn_delay_ticker(
        Arc::clone(&orchestrator),
        Arc::clone(&db),
        clock,
        config.delay_poll_interval,
    );
    eprintln!(
        "   Delays: polled every {}s, max {} nodes per pass\n",
        config.delay_poll_interval.as_secs(),
        config.max_nodes_per_pass
    );

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = automation_routes(orchestrator);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Automation server started");
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
