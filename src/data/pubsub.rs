use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use thiserror::Error;
use log::{info, debug};

use crate::data::candles::Ohlcv;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("channel table lock poisoned")]
    LockPoisoned,
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Topic name for a symbol's candle channel.
pub fn channel_topic(prefix: &str, symbol: &str) -> String {
    format!("{}{}", prefix, symbol.to_uppercase())
}

/// Per-symbol broadcast channels. Publishing to a topic nobody listens on is a no-op.
pub struct PubSubManager {
    prefix: String,
    // Topic -> broadcast channel carrying encoded Ohlcv payloads
    topic_channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    // Session ID -> topics it listens on
    session_subscriptions: Arc<Mutex<HashMap<String, HashSet<String>>>>,
    // Symbol -> last published bar
    last_bars: Arc<Mutex<HashMap<String, Ohlcv>>>,
    channel_capacity: usize,
}

impl PubSubManager {
    pub fn new(prefix: &str, channel_capacity: usize) -> Self {
        Self {
            prefix: prefix.to_string(),
            topic_channels: Arc::new(Mutex::new(HashMap::new())),
            session_subscriptions: Arc::new(Mutex::new(HashMap::new())),
            last_bars: Arc::new(Mutex::new(HashMap::new())),
            channel_capacity,
        }
    }

    pub fn topic_for(&self, symbol: &str) -> String {
        channel_topic(&self.prefix, symbol)
    }

    /// Attaches a session to a symbol's channel, creating the channel on first use.
    pub fn subscribe(&self, session_id: &str, symbol: &str) -> Result<broadcast::Receiver<String>, String> {
        let topic = self.topic_for(symbol);
        let mut channels = self.topic_channels.lock()
            .map_err(|_| "Lock poisoned".to_string())?;
        let mut sessions = self.session_subscriptions.lock()
            .map_err(|_| "Lock poisoned".to_string())?;

        let rx = channels
            .entry(topic.clone())
            .or_insert_with(|| {
                info!("Created new broadcast channel: {}", topic);
                broadcast::channel(self.channel_capacity).0
            })
            .subscribe();

        sessions.entry(session_id.to_string())
            .or_default()
            .insert(topic.clone());

        debug!("Session {} attached to {}", session_id, topic);
        Ok(rx)
    }

    /// Detaches a session from one symbol, or from everything when `symbol` is None.
    pub fn unsubscribe(&self, session_id: &str, symbol: Option<&str>) -> Vec<String> {
        let mut sessions = match self.session_subscriptions.lock() {
            Ok(sessions) => sessions,
            Err(_) => return Vec::new(),
        };

        let removed = match symbol {
            Some(symbol) => {
                let topic = self.topic_for(symbol);
                let removed = sessions
                    .get_mut(session_id)
                    .map(|topics| topics.remove(&topic))
                    .unwrap_or(false);
                if sessions.get(session_id).map(|t| t.is_empty()).unwrap_or(false) {
                    sessions.remove(session_id);
                }
                if removed { vec![topic] } else { Vec::new() }
            }
            None => sessions
                .remove(session_id)
                .map(|topics| topics.into_iter().collect())
                .unwrap_or_default(),
        };
        drop(sessions);

        self.prune_idle_channels();
        removed
    }

    /// Publishes one flushed bar. Returns the number of receivers reached.
    pub fn publish(&self, symbol: &str, bar: &Ohlcv) -> Result<usize, PublishError> {
        let payload = serde_json::to_string(bar)?;
        let topic = self.topic_for(symbol);

        self.last_bars.lock()
            .map_err(|_| PublishError::LockPoisoned)?
            .insert(symbol.to_uppercase(), *bar);

        let channels = self.topic_channels.lock()
            .map_err(|_| PublishError::LockPoisoned)?;
        match channels.get(&topic) {
            // send only fails when every receiver is gone
            Some(tx) => Ok(tx.send(payload).unwrap_or(0)),
            None => Ok(0),
        }
    }

    pub fn last_bar(&self, symbol: &str) -> Option<Ohlcv> {
        self.last_bars.lock()
            .ok()
            .and_then(|bars| bars.get(&symbol.to_uppercase()).copied())
    }

    pub fn get_subscriber_count(&self, symbol: &str) -> usize {
        self.topic_channels.lock()
            .ok()
            .and_then(|channels| channels.get(&self.topic_for(symbol)).map(|tx| tx.receiver_count()))
            .unwrap_or(0)
    }

    pub fn get_symbol_list(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.last_bars.lock()
            .map(|bars| bars.keys().cloned().collect())
            .unwrap_or_default();
        symbols.sort();
        symbols
    }

    pub fn get_stats(&self) -> (usize, usize) {
        let channel_count = self.topic_channels.lock()
            .map(|channels| channels.len())
            .unwrap_or(0);
        let session_count = self.session_subscriptions.lock()
            .map(|sessions| sessions.len())
            .unwrap_or(0);
        (channel_count, session_count)
    }

    fn prune_idle_channels(&self) {
        if let Ok(mut channels) = self.topic_channels.lock() {
            channels.retain(|_, tx| tx.receiver_count() > 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(c: f64) -> Ohlcv {
        Ohlcv { o: c, h: c, l: c, c, v: 1.0, t: 1 }
    }

    #[test]
    fn test_topic_uppercases_symbol() {
        assert_eq!(channel_topic("candles:", "aapl"), "candles:AAPL");
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let pubsub = PubSubManager::new("candles:", 16);
        assert_eq!(pubsub.publish("AAPL", &bar(1.0)).unwrap(), 0);
        assert_eq!(pubsub.last_bar("aapl"), Some(bar(1.0)));
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let pubsub = PubSubManager::new("candles:", 16);
        let mut rx = pubsub.subscribe("s1", "aapl").unwrap();
        assert_eq!(pubsub.publish("AAPL", &bar(2.0)).unwrap(), 1);

        let payload = rx.recv().await.unwrap();
        let decoded: Ohlcv = serde_json::from_str(&payload).unwrap();
        assert_eq!(decoded, bar(2.0));
    }

    #[test]
    fn test_unsubscribe_all_clears_session() {
        let pubsub = PubSubManager::new("candles:", 16);
        let rx1 = pubsub.subscribe("s1", "AAPL").unwrap();
        let rx2 = pubsub.subscribe("s1", "MSFT").unwrap();
        assert_eq!(pubsub.get_stats(), (2, 1));

        drop(rx1);
        drop(rx2);
        let mut removed = pubsub.unsubscribe("s1", None);
        removed.sort();
        assert_eq!(removed, vec!["candles:AAPL".to_string(), "candles:MSFT".to_string()]);
        assert_eq!(pubsub.get_stats(), (0, 0));
    }
}
