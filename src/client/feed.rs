use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use log::{info, warn};

use crate::client::broker::{Port, PortEvent, PortSender};
use crate::client::fallback::QuoteFallbackResolver;
use crate::client::multiplexer::Status;
use crate::client::registry::{run_all, Callback, SubscriptionId, SubscriptionRegistry};
use crate::client::topic::{route, Topic};
use crate::websocket::ServerEnvelope;

type SharedRegistry = Arc<Mutex<SubscriptionRegistry>>;

fn lock_registry(registry: &SharedRegistry) -> MutexGuard<'_, SubscriptionRegistry> {
    match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Subscription registry lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// One logical consumer: a port on the shared connection, its own
/// subscription registry, and backfill for topics that have no value yet.
pub struct LiveFeed {
    sender: PortSender,
    registry: SharedRegistry,
    resolver: Arc<QuoteFallbackResolver>,
    connected: watch::Receiver<bool>,
    pump: JoinHandle<()>,
}

impl LiveFeed {
    pub fn new(port: Port, resolver: Arc<QuoteFallbackResolver>) -> Self {
        let sender = port.sender();
        let registry = Arc::new(Mutex::new(SubscriptionRegistry::new(Arc::new(sender.clone()))));
        let (connected_tx, connected) = watch::channel(false);
        let pump = tokio::spawn(pump(port, registry.clone(), connected_tx));

        Self {
            sender,
            registry,
            resolver,
            connected,
            pump,
        }
    }

    pub fn connect(&self, url: &str, token: &str) {
        self.sender.connect(url, token);
    }

    /// Registers a callback for `topic`. A cached value is delivered before
    /// this returns; with nothing cached a backfill is started.
    pub fn subscribe(&self, topic: Topic, callback: Callback) -> SubscriptionId {
        let (id, immediate) = lock_registry(&self.registry).register(topic.clone(), callback);
        match immediate {
            Some(delivery) => delivery.run(),
            None => self.spawn_backfill(topic),
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock_registry(&self.registry).deregister(id)
    }

    /// True while the shared connection is open.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    pub fn subscribed_topics(&self) -> Vec<Topic> {
        lock_registry(&self.registry).topics()
    }

    fn spawn_backfill(&self, topic: Topic) {
        let resolver = self.resolver.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            if let Some(payload) = resolver.resolve(&topic).await {
                let deliveries = lock_registry(&registry).seed_backfill(&topic, payload);
                run_all(deliveries);
            }
        });
    }
}

impl Drop for LiveFeed {
    fn drop(&mut self) {
        // dropping the pump drops the port, which detaches it
        self.pump.abort();
    }
}

async fn pump(mut port: Port, registry: SharedRegistry, connected: watch::Sender<bool>) {
    while let Some(event) = port.recv().await {
        match event {
            PortEvent::Status(status) => {
                let open = status == Status::Open;
                if *connected.borrow() != open {
                    info!("Feed {} connectivity: {:?}", port.id(), status);
                }
                connected.send_replace(open);
            }
            PortEvent::Message(envelope) => {
                if let Some((topic, payload)) = route(&envelope) {
                    let deliveries = lock_registry(&registry).deliver_live(&topic, payload);
                    run_all(deliveries);
                } else if let ServerEnvelope::TokenRefreshed { expires_at } = envelope {
                    info!("Server accepted rotated token, expires at {}", expires_at);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use crate::client::broker::{Broker, MultiplexerConfig};
    use crate::client::fallback::tests::SlowSource;
    use crate::client::registry::{CachedValue, ValueSource};
    use crate::client::topic::Payload;
    use crate::data::Ohlcv;

    fn config() -> MultiplexerConfig {
        MultiplexerConfig {
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }

    fn bar() -> Ohlcv {
        Ohlcv { o: 1.0, h: 2.0, l: 1.0, c: 2.0, v: 3.0, t: 4 }
    }

    #[tokio::test]
    async fn test_backfill_delivered_through_callback() {
        let (handle, _notices, _task) = Broker::spawn(config());
        let source = Arc::new(SlowSource { calls: AtomicUsize::new(0), delay: Duration::ZERO, bar: Some(bar()) });
        let resolver = Arc::new(QuoteFallbackResolver::new(source, Duration::from_secs(1)));
        let feed = LiveFeed::new(handle.port(), resolver);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<CachedValue>();
        feed.subscribe(Topic::candles("AAPL"), Arc::new(move |_: &Topic, value: &CachedValue| {
            let _ = tx.send(*value);
        }));

        let value = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(value, CachedValue { payload: Payload::Bar(bar()), source: ValueSource::Backfilled });

        // a second subscriber gets the cached value synchronously
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_c = seen.clone();
        feed.subscribe(Topic::candles("AAPL"), Arc::new(move |_: &Topic, value: &CachedValue| {
            seen_c.lock().unwrap().push(value.source);
        }));
        assert_eq!(*seen.lock().unwrap(), vec![ValueSource::Backfilled]);
        assert_eq!(feed.subscribed_topics(), vec![Topic::candles("AAPL")]);
    }
}
