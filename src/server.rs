//! Node wiring: broker, stroke store, hub and HTTP router.

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::{routing::get, Router};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::config::Config;
use crate::db::dbcanvas::{spawn_persist_worker, StrokeStore};
use crate::docs::ApiDoc;
use crate::relay::{self, Broker, BrokerError, MemoryBroker, PgBroker, Relay, RelayStats};
use crate::routes::create_api_routes;
use crate::store::Document;
use crate::websocket::websocket_handler;
use crate::ws::{spawn_hub, Hub, HubHandle};

#[derive(Error, Debug)]
pub enum StartError {
    #[error("broker unavailable: {0}")]
    Broker(#[from] BrokerError),
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

/// Shared state handed to every HTTP and WebSocket handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub config: Arc<Config>,
    pub node_id: Uuid,
    pub relay_stats: Arc<RelayStats>,
    pub broker_name: &'static str,
}

/// A running node: its state plus the background tasks that serve it.
pub struct Node {
    pub state: AppState,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Stop every background task of this node.
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Connect the broker named by the config, or an in-process one in standalone mode.
pub async fn connect_broker(config: &Config) -> Result<Arc<dyn Broker>, StartError> {
    match &config.broker_url {
        Some(url) => Ok(Arc::new(PgBroker::connect(url, &config.broker_channel).await?)),
        None => {
            warn!("No BROKER_URL configured, running standalone with an in-process broker");
            Ok(Arc::new(MemoryBroker::default()))
        }
    }
}

/// Open the stroke store. Persistence is best effort, so failures only warn.
pub async fn connect_store(config: &Config) -> Option<Arc<StrokeStore>> {
    let Some(url) = config.store_url() else {
        info!("Persistence disabled");
        return None;
    };

    let store = match StrokeStore::connect(url).await {
        Ok(store) => store,
        Err(e) => {
            warn!("Stroke store unavailable, running without persistence: {}", e);
            return None;
        }
    };
    if let Err(e) = store.migrate().await {
        warn!("Failed to prepare stroke table, running without persistence: {}", e);
        return None;
    }
    Some(Arc::new(store))
}

/// Build the document this node starts from.
async fn hydrate(config: &Config, store: Option<&StrokeStore>) -> Document {
    let mut document = Document::with_pending_limit(config.max_pending_strokes);
    let Some(store) = store else {
        return document;
    };

    match store.load_board(&config.board_name).await {
        Ok(ops) => {
            for op in &ops {
                if let Err(e) = document.apply(op) {
                    warn!("Skipping stored operation: {}", e);
                }
            }
            info!(
                "Hydrated board '{}' with {} strokes",
                config.board_name,
                document.stats().visible
            );
        }
        Err(e) => warn!("Failed to load board '{}', starting empty: {}", config.board_name, e),
    }
    document
}

/// Start the relay tasks and the hub for one node.
///
/// The broker subscription is established first; failing that, the node does
/// not start.
pub async fn start_node(
    config: Config,
    broker: Arc<dyn Broker>,
    store: Option<Arc<StrokeStore>>,
) -> Result<Node, StartError> {
    let node_id = config.node_id.unwrap_or_else(Uuid::new_v4);
    let stats = Arc::new(RelayStats::default());

    let (relayed_tx, relayed_rx) = mpsc::channel(config.relay_capacity);
    let subscriber = relay::start_subscriber(
        broker.clone(),
        node_id,
        config.board_name.clone(),
        relayed_tx,
        stats.clone(),
    )
    .await?;

    let (publish_tx, publish_rx) = mpsc::channel(config.relay_capacity);
    let publisher = relay::spawn_publisher(broker.clone(), publish_rx, stats.clone());

    let document = hydrate(&config, store.as_deref()).await;

    let mut tasks = vec![subscriber, publisher];
    let persistence = store.map(|store| {
        let (handle, task) = spawn_persist_worker(store, config.board_name.clone(), config.relay_capacity);
        tasks.push(task);
        handle
    });

    let relay = Relay::new(node_id, &config.board_name, publish_tx, stats.clone());
    let hub = Hub::new(&config.board_name, document, relay, persistence)
        .allow_declared_user_id(config.allow_declared_user_id);
    let (hub_handle, hub_task) = spawn_hub(hub, config.hub_capacity, relayed_rx);
    tasks.push(hub_task);

    info!("Node {} started for board '{}' ({} broker)", node_id, config.board_name, broker.name());

    Ok(Node {
        state: AppState {
            hub: hub_handle,
            config: Arc::new(config),
            node_id,
            relay_stats: stats,
            broker_name: broker.name(),
        },
        tasks,
    })
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origin_list()
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    if origins.is_empty() {
        if config.is_development() {
            return CorsLayer::permissive();
        }
        return CorsLayer::new();
    }
    CorsLayer::new().allow_origin(AllowOrigin::list(origins))
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    Router::new()
        // Client event channel
        .route("/ws", get(websocket_handler))
        // Mount API routes
        .nest("/api", create_api_routes())
        .with_state(state)
        // Mount Swagger UI
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors)
        // Add tracing layer
        .layer(TraceLayer::new_for_http())
}

/// Run one node until the HTTP server stops.
pub async fn run(config: Config) -> Result<(), StartError> {
    let broker = connect_broker(&config).await?;
    let store = connect_store(&config).await;
    let address = config.server_address();
    let node = start_node(config, broker, store).await?;
    let app = build_router(node.state.clone());

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| StartError::Bind(address.clone(), e))?;

    info!("🚀 Server running on http://{}", address);
    info!("📡 WebSocket available at ws://{}/ws", address);
    info!("📚 Swagger UI available at http://{}/swagger", address);

    let result = axum::serve(listener, app).await.map_err(StartError::Serve);
    node.shutdown();
    result
}
