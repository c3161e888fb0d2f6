use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, warn};

use crate::client::http::{BackfillSource, ClientError};
use crate::client::topic::{Payload, Topic};

type InFlight = Shared<BoxFuture<'static, Option<Payload>>>;

/// One-shot backfill for topics that have no value yet. Concurrent requests
/// for the same topic share a single fetch.
pub struct QuoteFallbackResolver {
    source: Arc<dyn BackfillSource>,
    timeout: Duration,
    in_flight: Mutex<HashMap<Topic, (u64, InFlight)>>,
    next_fetch: AtomicU64,
}

impl QuoteFallbackResolver {
    pub fn new(source: Arc<dyn BackfillSource>, timeout: Duration) -> Self {
        Self {
            source,
            timeout,
            in_flight: Mutex::new(HashMap::new()),
            next_fetch: AtomicU64::new(1),
        }
    }

    /// Fetches the topic's last known value. Failures and timeouts yield None.
    pub async fn resolve(&self, topic: &Topic) -> Option<Payload> {
        let (fetch_id, fetch) = self.join_or_start(topic)?;
        // clears the entry even when this future is dropped before completing
        let _guard = InFlightGuard { resolver: self, topic, fetch_id };
        fetch.await
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn join_or_start(&self, topic: &Topic) -> Option<(u64, InFlight)> {
        let mut in_flight = self.in_flight.lock().ok()?;
        if let Some((id, fetch)) = in_flight.get(topic) {
            debug!("Joining in-flight backfill for {}", topic);
            return Some((*id, fetch.clone()));
        }

        let id = self.next_fetch.fetch_add(1, Ordering::Relaxed);
        let fetch = Self::fetch(self.source.clone(), topic.clone(), self.timeout).boxed().shared();
        in_flight.insert(topic.clone(), (id, fetch.clone()));
        Some((id, fetch))
    }

    async fn fetch(source: Arc<dyn BackfillSource>, topic: Topic, timeout: Duration) -> Option<Payload> {
        let result = match tokio::time::timeout(timeout, source.fetch_bar(topic.symbol())).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        };
        match result {
            Ok(Some(bar)) => Some(Payload::for_topic(&topic, bar)),
            Ok(None) => {
                debug!("No backfill data for {}", topic);
                None
            }
            Err(e) => {
                warn!("Backfill for {} abandoned: {}", topic, e);
                None
            }
        }
    }
}

struct InFlightGuard<'a> {
    resolver: &'a QuoteFallbackResolver,
    topic: &'a Topic,
    fetch_id: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.resolver.in_flight.lock() {
            if in_flight.get(self.topic).map(|(id, _)| *id) == Some(self.fetch_id) {
                in_flight.remove(self.topic);
            }
        }
    }
}
