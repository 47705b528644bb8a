use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use beigebox_agents::Operator;
use beigebox_backends::dispatcher::Dispatcher;
use beigebox_core::config::{BackendEntry, BeigeBoxConfig};
use beigebox_core::runtime::RuntimeOverlay;
use beigebox_hooks::HookPipeline;
use beigebox_replay::{Replayer, SemanticMap};
use beigebox_router::{CentroidClassifier, DecisionAgent, RouteTable, SessionCache};
use beigebox_store::MessageStore;
use beigebox_tools::ToolRegistry;
use beigebox_vector::{HttpEmbedder, SqliteVecBackend, VectorIndex};
use beigebox_wire::WireLog;
use clap::Parser;
use tracing::{info, warn};

mod app;
mod context;
mod flight;
mod http;
mod proxy;
mod summarize;

#[derive(Parser)]
#[command(name = "beigebox-gateway", about = "OpenAI-compatible LLM proxy")]
struct Args {
    /// Path to beigebox.toml
    #[arg(long)]
    config: Option<String>,

    /// Regenerate route centroids from the seed prototypes, then exit
    #[arg(long)]
    build_centroids: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beigebox=info,beigebox_gateway=info,tower_http=warn".into()),
        )
        .init();

    let args = Args::parse();
    let config = BeigeBoxConfig::load(args.config.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        BeigeBoxConfig::default()
    });
    let config = Arc::new(config);

    // Embedding + vector index
    let embedder = Arc::new(HttpEmbedder::new(
        config.embedding.model.clone(),
        config.embedding_backend_url(),
        config.embedding.dimension,
    ));
    let vector_backend =
        Arc::new(SqliteVecBackend::open(&config.storage.vector_path, config.embedding.dimension)?);
    let vector = Arc::new(VectorIndex::new(embedder.clone(), vector_backend));

    if args.build_centroids {
        let written = beigebox_router::centroid::build_centroids(
            embedder.as_ref(),
            std::path::Path::new(&config.embedding_classifier.centroid_dir),
        )
        .await?;
        info!(routes = ?written, "centroids rebuilt");
        return Ok(());
    }

    // Storage
    let store = Arc::new(MessageStore::open(&config.storage.sqlite_path)?);
    let wire = Arc::new(WireLog::new(&config.wiretap.path));
    let overlay = Arc::new(RuntimeOverlay::new(&config.runtime_overlay.path));

    // Tools (the memory tool needs the vector index)
    let tools = Arc::new(ToolRegistry::from_config(&config, Some(vector.clone())));

    // Hooks
    let hooks = Arc::new(HookPipeline::from_names(&config.hooks.enabled));

    // Backends: configured list, or a single local backend as the default
    let backend_entries: Vec<BackendEntry> = if config.backends.is_empty() {
        vec![BackendEntry {
            provider: "local".to_string(),
            name: "local".to_string(),
            url: config.backend.url.clone(),
            api_key: String::new(),
            timeout: config.backend.timeout,
            priority: 1,
            max_retries: 2,
            backoff_base: 1.5,
            backoff_max: 10.0,
        }]
    } else {
        config.backends.clone()
    };
    let dispatcher = Arc::new(Dispatcher::from_config(&backend_entries));

    // Routing core
    let routes =
        RouteTable::new(config.decision_llm.routes.clone(), &config.backend.default_model);
    let decision_agent = Arc::new(DecisionAgent::new(
        if config.decision_llm.enabled { &config.decision_llm.model } else { "" },
        config.decision_backend_url(),
        config.decision_llm.timeout,
        routes.clone(),
        tools.list(),
    ));
    let classifier = Arc::new(CentroidClassifier::load(
        std::path::Path::new(&config.embedding_classifier.centroid_dir),
        vector.embedder(),
        routes.clone(),
        config.embedding_classifier.threshold,
    ));
    let session =
        Arc::new(SessionCache::new(Duration::from_secs(config.routing.session_ttl_seconds)));

    // Proxy plumbing
    let flights = Arc::new(flight::FlightStore::new(1000, 24));
    let system_context = Arc::new(context::SystemContext::new(&config));
    let proxy = Arc::new(proxy::Proxy::new(
        config.clone(),
        overlay.clone(),
        store.clone(),
        vector.clone(),
        wire.clone(),
        hooks.clone(),
        tools.clone(),
        dispatcher.clone(),
        decision_agent.clone(),
        classifier.clone(),
        session,
        routes,
        flights.clone(),
        system_context,
    ));

    // Agents + derivations
    let operator_model = if config.operator.model.is_empty() {
        config.backend.default_model.clone()
    } else {
        config.operator.model.clone()
    };
    let operator = Arc::new(Operator::new(
        &config.backend.url,
        &operator_model,
        config.operator.max_iterations,
        config.operator.timeout,
        tools.clone(),
    ));
    let replayer = Arc::new(Replayer::new(store.clone(), &config.wiretap.path));
    let semantic_map = Arc::new(SemanticMap::new(store.clone(), vector.clone()));

    let state = Arc::new(app::AppState {
        config: config.clone(),
        overlay,
        proxy,
        store,
        vector,
        tools,
        hooks,
        dispatcher: dispatcher.clone(),
        decision_agent: decision_agent.clone(),
        flights,
        operator,
        replayer,
        semantic_map,
    });

    info!(
        host = %config.server.host,
        port = config.server.port,
        backends = ?dispatcher.backend_names(),
        tools = ?state.tools.list(),
        hooks = ?state.hooks.names(),
        classifier_ready = classifier.ready(),
        "beigebox starting"
    );

    // Pin models in the background so the first request doesn't pay
    // load latency
    {
        let decision_agent = decision_agent.clone();
        let dispatcher = dispatcher.clone();
        let embed_model = config.embedding.model.clone();
        tokio::spawn(async move {
            dispatcher.preload(&embed_model).await;
            decision_agent.preload().await;
        });
    }

    let router = app::build_router(state);
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
