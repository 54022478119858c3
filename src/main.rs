use std::sync::Arc;

use anyhow::Context;
use murmur::{db::SqliteStore, store::MessageStore, AppState, Chat, Config};
use tower_sessions::{cookie::SameSite, Expiry, MemoryStore, SessionManagerLayer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let config = Config::from_env()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("murmur=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let session_store = MemoryStore::default();
    let session_layer = SessionManagerLayer::new(session_store)
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::minutes(config.session_expiry_minutes)));

    let db = SqliteStore::connect(&config.database_url, 16)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    let store = MessageStore::new(Arc::new(db.clone()), Arc::new(db));

    let app_state = AppState {
        chat: Chat::new(store, &config),
        config: Arc::new(config.clone()),
    };

    let app = murmur::app(app_state).layer(session_layer);

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("binding {}", config.bind_address))?;
    tracing::info!(address = %config.bind_address, "murmur v{} listening", env!("CARGO_PKG_VERSION"));

    axum::serve(listener, app).await?;
    Ok(())
}
