use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::channel_adapter::ChannelRegistry;
use crate::channels::{LineAdapter, MessengerAdapter};
use crate::config::{Config, ConversationStoreKind};
use crate::dedup::RecentMessageIds;
use crate::error::ShopChatError;
use crate::llm::LlmProvider;
use crate::session::SessionManager;
use crate::storage::conversation::{
    ConversationStore, MemoryConversationStore, SqliteConversationStore,
};
use crate::storage::db::Database;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

pub struct AppState {
    pub config: Config,
    pub channel_registry: Arc<ChannelRegistry>,
    pub catalog: Arc<Catalog>,
    pub store: Arc<dyn ConversationStore>,
    pub sessions: Arc<SessionManager>,
    pub dedup: RecentMessageIds,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(
        config: Config,
        llm: Arc<dyn LlmProvider>,
        store: Arc<dyn ConversationStore>,
        channel_registry: Arc<ChannelRegistry>,
        catalog: Arc<Catalog>,
        http: reqwest::Client,
    ) -> Result<Self, ShopChatError> {
        let sessions = Arc::new(SessionManager::new(
            &config,
            llm,
            catalog.clone(),
            store.clone(),
            channel_registry.clone(),
        )?);
        Ok(Self {
            dedup: RecentMessageIds::new(Duration::from_secs(config.dedup_window_secs)),
            config,
            channel_registry,
            catalog,
            store,
            sessions,
            http,
        })
    }
}

pub fn build_channel_registry(config: &Config, http: &reqwest::Client) -> ChannelRegistry {
    let mut registry = ChannelRegistry::new();
    if config.messenger.enabled() {
        registry.register(Arc::new(MessengerAdapter::new(&config.messenger, http.clone())));
    }
    if config.line.enabled() {
        registry.register(Arc::new(LineAdapter::new(&config.line, http.clone())));
    }
    registry
}

pub fn build_conversation_store(config: &Config) -> anyhow::Result<Arc<dyn ConversationStore>> {
    let ttl = config.history_ttl();
    let store: Arc<dyn ConversationStore> = match config.conversation_store {
        ConversationStoreKind::Memory => {
            Arc::new(MemoryConversationStore::new(config.history_turns, ttl))
        }
        ConversationStoreKind::Sqlite => {
            let db = Database::new(&config.data_dir)
                .with_context(|| format!("opening history database in {}", config.data_dir))?;
            Arc::new(SqliteConversationStore::new(
                Arc::new(db),
                config.history_turns,
                ttl,
            ))
        }
    };
    Ok(store)
}

/// Periodic housekeeping: expired dedup ids, stale intents and history.
fn spawn_maintenance(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let ids = state.dedup.purge_expired();
            let intents = state.sessions.intents().purge_expired();
            let histories = match state.store.purge_expired().await {
                Ok(n) => n,
                Err(e) => {
                    warn!("history purge failed: {e}");
                    0
                }
            };
            if ids + intents + histories > 0 {
                tracing::debug!(ids, intents, histories, "expired entries purged");
            }
        }
    });
}

fn spawn_catalog_reload(state: Arc<AppState>) {
    let secs = state.config.catalog_reload_interval_secs;
    if secs == 0 || state.catalog.source().is_none() {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(secs));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match state.catalog.reload(&state.http).await {
                Ok(count) => info!(products = count, "catalog reloaded"),
                Err(e) => warn!("catalog reload failed, keeping previous snapshot: {e}"),
            }
        }
    });
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let http = reqwest::Client::new();
    let catalog = Arc::new(Catalog::open(config.catalog_source.clone(), &http).await);
    let llm: Arc<dyn LlmProvider> = Arc::from(crate::llm::create_provider(&config));
    let store = build_conversation_store(&config)?;

    if !config.has_channel() {
        warn!("no Messenger or LINE credentials configured; serving health and admin endpoints only");
    }
    if config.admin_token.is_none() {
        warn!("admin_token not set; POST /admin/catalog/reload is disabled");
    }
    let registry = build_channel_registry(&config, &http);
    if registry.has_any() {
        info!(channels = ?registry.names(), "channels configured");
    }

    let state = Arc::new(
        AppState::new(config, llm, store, Arc::new(registry), catalog, http)
            .context("building application state")?,
    );
    spawn_maintenance(state.clone());
    spawn_catalog_reload(state.clone());

    crate::web::start_web_server(state).await
}
