use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use log::{info, warn, error};

use candle_relay::client::{
    Broker, CachedValue, HttpBackfillSource, HttpCredentialSource, LiveFeed, MultiplexerConfig,
    Payload, QuoteFallbackResolver, TokenLifecycleCoordinator, Topic,
};
use candle_relay::config::ClientConfig;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

fn log_value(topic: &Topic, value: &CachedValue) {
    match value.payload {
        Payload::Bar(bar) => info!(
            "{} [{:?}] o={} h={} l={} c={} v={} t={}",
            topic, value.source, bar.o, bar.h, bar.l, bar.c, bar.v, bar.t
        ),
        Payload::Quote { price, volume, t } => info!(
            "{} [{:?}] price={} volume={} t={}",
            topic, value.source, price, volume, t
        ),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig::from_env();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(&config.log_level));

    config.log_config();
    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(e.into());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let http = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()?;

    let (handle, notices, broker_task) = Broker::spawn(MultiplexerConfig {
        heartbeat_interval: config.heartbeat_interval,
        heartbeat_timeout: config.heartbeat_timeout,
        backoff_base: config.backoff_base,
        backoff_max: config.backoff_max,
    });

    let coordinator = TokenLifecycleCoordinator::new(
        Arc::new(HttpCredentialSource::new(http.clone(), &config.api_url, &config.api_key, &config.client_id)),
        Arc::new(handle.clone()),
        config.token_refresh,
    );
    let resolver = Arc::new(QuoteFallbackResolver::new(
        Arc::new(HttpBackfillSource::new(http, &config.api_url, coordinator.credentials())),
        config.backfill_timeout,
    ));
    let feed = LiveFeed::new(handle.port(), resolver);

    // the first connection needs a credential; keep trying until one arrives
    let mut retry = config.backoff_base;
    let credential = loop {
        match coordinator.fetch_initial().await {
            Ok(credential) => break credential,
            Err(e) => {
                warn!("Initial credential fetch failed, retrying in {:?}: {}", retry, e);
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => return Ok(()),
                    _ = tokio::time::sleep(retry) => {}
                }
                retry = (retry * 2).min(config.backoff_max);
            }
        }
    };
    let coordinator_task = tokio::spawn(coordinator.run(notices, shutdown_rx));

    for symbol in &config.symbols {
        feed.subscribe(Topic::candles(symbol), Arc::new(log_value));
    }
    for symbol in &config.quotes {
        feed.subscribe(Topic::quote(symbol), Arc::new(log_value));
    }
    feed.connect(&credential.ws_url, &credential.token);
    info!("👀 Watching {} topics via {}", feed.subscribed_topics().len(), credential.ws_url);

    let mut connected = feed.connected();
    tokio::spawn(async move {
        while connected.changed().await.is_ok() {
            let open = *connected.borrow();
            if open {
                info!("🟢 Live");
            } else {
                warn!("🔴 Disconnected");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    let _ = shutdown_tx.send(true);
    let _ = coordinator_task.await;
    // last port gone, broker disposes the connection
    drop(feed);
    drop(handle);
    let _ = tokio::time::timeout(Duration::from_secs(5), broker_task).await;
    info!("Watch client stopped");

    Ok(())
}
