use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::interval;
use log::{info, error};
use tower_http::cors::CorsLayer;

use candle_relay::api::{ApiState, create_api_router};
use candle_relay::auth::{JwtGenerator, SessionManager};
use candle_relay::config::{ServerConfig, BROADCAST_CHANNEL_SIZE, CLEANUP_INTERVAL_SECS, LOG_MAX_LEN};
use candle_relay::data::{
    CandleAggregator, FlushPublisher, IngestConfig, MemoryLog, PipelineStats, PubSubManager,
    ReplayController, StreamIngestConsumer, TickLog,
};
use candle_relay::websocket::WebSocketHandler;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = ServerConfig::from_env();

    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(&config.log_level));

    config.log_config();
    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(e.into());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Aggregation pipeline
    let tick_log: Arc<dyn TickLog> = Arc::new(MemoryLog::new(LOG_MAX_LEN));
    info!("Upstream log ready (max {} entries)", LOG_MAX_LEN);
    let aggregator = CandleAggregator::shared();
    let stats = Arc::new(PipelineStats::new());
    let pubsub_manager = Arc::new(PubSubManager::new(&config.channel_prefix, BROADCAST_CHANNEL_SIZE));

    let consumer = StreamIngestConsumer::new(
        tick_log.clone(),
        aggregator.clone(),
        stats.clone(),
        IngestConfig {
            group: config.consumer_group.clone(),
            consumer: config.consumer_name.clone(),
            batch_size: config.ingest_batch_size,
            block: config.ingest_block,
            retry_delay: config.ingest_retry,
        },
    );
    let publisher = FlushPublisher::new(
        aggregator,
        pubsub_manager.clone(),
        stats,
        config.flush_interval,
        config.stats_interval,
    );
    let ingest_task = tokio::spawn(consumer.run(shutdown_rx.clone()));
    let flush_task = tokio::spawn(publisher.run(shutdown_rx.clone()));

    // Sessions and replay feed
    let session_manager = SessionManager::new(&config.jwt_secret);
    let replay_controller = Arc::new(ReplayController::new(
        tick_log.clone(),
        config.data_dir.clone(),
        config.replay_interval,
    ));
    info!("📊 Replay feed ready - use POST /api/replay/start to begin streaming {}", config.data_dir.display());

    start_background_tasks(session_manager.clone(), pubsub_manager.clone(), shutdown_rx.clone());

    // Start API server
    let api_state = ApiState {
        session_manager: session_manager.clone(),
        jwt_generator: Arc::new(JwtGenerator::new(&config.jwt_secret)),
        pubsub_manager: pubsub_manager.clone(),
        tick_log,
        replay_controller,
        api_key: Arc::from(config.api_key.as_str()),
        public_ws_url: Arc::from(config.public_ws_url.as_str()),
        token_ttl_secs: config.token_ttl_secs,
    };

    let api_router = create_api_router(api_state)
        .layer(CorsLayer::permissive()); // Enable CORS for web clients

    let api_listener = TcpListener::bind(&config.api_bind_address).await?;
    info!("🌐 HTTP API server running at http://{}", config.api_bind_address);
    let mut api_shutdown = shutdown_rx.clone();
    let api_server = axum::serve(api_listener, api_router)
        .with_graceful_shutdown(async move {
            let _ = api_shutdown.changed().await;
        });

    // Start WebSocket server
    let ws_listener = TcpListener::bind(&config.bind_address).await?;
    info!("🚀 WebSocket server running at ws://{}/ws with JWT authentication", config.bind_address);

    let websocket_server = async move {
        while let Ok((stream, addr)) = ws_listener.accept().await {
            let handler = WebSocketHandler::new(session_manager.clone(), pubsub_manager.clone(), addr.to_string());
            tokio::spawn(handler.handle_connection(stream));
        }
    };

    tokio::select! {
        result = api_server => {
            error!("API server stopped: {:?}", result);
        }
        _ = websocket_server => {
            error!("WebSocket server stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = ingest_task.await;
        let _ = flush_task.await;
    })
    .await;
    info!("Relay stopped");

    Ok(())
}

fn start_background_tasks(
    session_manager: SessionManager,
    pubsub: Arc<PubSubManager>,
    shutdown: watch::Receiver<bool>,
) {
    // Session cleanup task
    let mut cleanup_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval_timer = interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));

        loop {
            tokio::select! {
                _ = cleanup_shutdown.changed() => break,
                _ = interval_timer.tick() => {
                    session_manager.cleanup_stale_sessions();
                    session_manager.log_session_stats();
                }
            }
        }
    });

    // Channel stats task
    let mut stats_shutdown = shutdown;
    tokio::spawn(async move {
        let mut interval_timer = interval(Duration::from_secs(60));

        loop {
            tokio::select! {
                _ = stats_shutdown.changed() => break,
                _ = interval_timer.tick() => {
                    let (channel_count, session_count) = pubsub.get_stats();
                    if channel_count > 0 || session_count > 0 {
                        info!("Stats - Channels: {}, Subscribed sessions: {}, Symbols seen: {}",
                              channel_count, session_count, pubsub.get_symbol_list().len());
                    }
                }
            }
        }
    });

    info!("🧹 Started session cleanup task (every {} seconds)", CLEANUP_INTERVAL_SECS);
    info!("📈 Started stats monitoring task (every 60 seconds)");
}
