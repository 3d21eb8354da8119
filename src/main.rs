use anyhow::{Context, Result};
use dataquery::{
    auth::{AnyOf, IssuedTokens, StaticCredentials},
    requestlog::RequestLog,
    server::{self, AppState},
    store::RowStore,
    Config, DataService,
};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // ─── 1) init logging ─────────────────────────────────────────────
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(config.log_level.parse().unwrap_or(Level::INFO.into())),
        )
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();
    info!("startup");

    // ─── 2) open storage ─────────────────────────────────────────────
    let service = if config.in_memory {
        warn!("running in memory; nothing will be persisted");
        DataService::in_memory()
    } else {
        let store = RowStore::open(&config.data_dir)
            .with_context(|| format!("opening row store in {}", config.data_dir.display()))?;
        let log = RequestLog::open(&config.data_dir)
            .with_context(|| format!("opening request log in {}", config.data_dir.display()))?;
        info!(
            rows = store.len(),
            dir = %config.data_dir.display(),
            "row store loaded"
        );
        DataService::new(Arc::new(store), Arc::new(log))
    };
    if let Some(every) = config.vacuum_interval() {
        service.start_vacuum_loops(every);
    }

    // ─── 3) credentials ──────────────────────────────────────────────
    if config.uses_default_credentials() {
        warn!("using the default username and password; set DATAQUERY_USERNAME and DATAQUERY_PASSWORD");
    }
    let tokens = Arc::new(IssuedTokens::new());
    for token in &config.api_tokens {
        tokens.register(token);
    }
    let auth = AnyOf(vec![
        Box::new(StaticCredentials::new(&config.username, &config.password)),
        Box::new(Arc::clone(&tokens)),
    ]);

    // ─── 4) serve ────────────────────────────────────────────────────
    let state = Arc::new(AppState {
        service,
        auth: Arc::new(auth),
        tokens,
        max_upload_bytes: config.max_upload_bytes,
    });

    info!("Server starting on port {}", config.port);
    info!("Health check: http://localhost:{}/health", config.port);
    warp::serve(server::routes(state))
        .run(([0, 0, 0, 0], config.port))
        .await;

    Ok(())
}
