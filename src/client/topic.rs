use std::fmt;

use crate::data::Ohlcv;
use crate::websocket::{ClientEnvelope, ServerEnvelope};

/// A logical stream a subscriber can ask for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    Candles(String),
    Quote(String),
}

impl Topic {
    pub fn candles(symbol: &str) -> Self {
        Topic::Candles(symbol.trim().to_uppercase())
    }

    pub fn quote(symbol: &str) -> Self {
        Topic::Quote(symbol.trim().to_uppercase())
    }

    pub fn symbol(&self) -> &str {
        match self {
            Topic::Candles(symbol) | Topic::Quote(symbol) => symbol,
        }
    }

    pub fn subscribe_envelope(&self) -> ClientEnvelope {
        match self {
            Topic::Candles(symbol) => ClientEnvelope::SubscribeList { symbols: vec![symbol.clone()] },
            Topic::Quote(symbol) => ClientEnvelope::SubscribeQuote { symbol: symbol.clone() },
        }
    }

    pub fn unsubscribe_envelope(&self) -> ClientEnvelope {
        match self {
            Topic::Candles(symbol) => ClientEnvelope::UnsubscribeList { symbols: vec![symbol.clone()] },
            Topic::Quote(symbol) => ClientEnvelope::UnsubscribeQuote { symbol: symbol.clone() },
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Candles(symbol) => write!(f, "candles:{}", symbol),
            Topic::Quote(symbol) => write!(f, "quote:{}", symbol),
        }
    }
}

/// Value carried on a topic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    Bar(Ohlcv),
    Quote { price: f64, volume: f64, t: i64 },
}

impl Payload {
    /// Shapes a bar the way the topic delivers it.
    pub fn for_topic(topic: &Topic, bar: Ohlcv) -> Self {
        match topic {
            Topic::Candles(_) => Payload::Bar(bar),
            Topic::Quote(_) => Payload::Quote { price: bar.c, volume: bar.v, t: bar.t },
        }
    }
}

/// Maps a data envelope to its topic. Control envelopes return None.
pub fn route(envelope: &ServerEnvelope) -> Option<(Topic, Payload)> {
    match envelope {
        ServerEnvelope::Snapshot { symbol, data } | ServerEnvelope::Aggregate { symbol, data } => {
            Some((Topic::candles(symbol), Payload::Bar(*data)))
        }
        ServerEnvelope::Quote { symbol, price, volume, t } => Some((
            Topic::quote(symbol),
            Payload::Quote { price: *price, volume: *volume, t: *t },
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_data_and_control() {
        let bar = Ohlcv { o: 1.0, h: 1.0, l: 1.0, c: 1.0, v: 1.0, t: 1 };
        let aggregate = ServerEnvelope::Aggregate { symbol: "aapl".to_string(), data: bar };
        assert_eq!(route(&aggregate), Some((Topic::candles("AAPL"), Payload::Bar(bar))));

        let quote = ServerEnvelope::quote_from_bar("MSFT", &bar);
        assert_eq!(route(&quote).map(|(t, _)| t), Some(Topic::quote("msft")));

        assert_eq!(route(&ServerEnvelope::Pong), None);
    }

    #[test]
    fn test_topic_envelopes() {
        assert_eq!(
            Topic::quote("aapl").subscribe_envelope(),
            ClientEnvelope::SubscribeQuote { symbol: "AAPL".to_string() }
        );
        assert_eq!(
            Topic::candles("aapl").unsubscribe_envelope(),
            ClientEnvelope::UnsubscribeList { symbols: vec!["AAPL".to_string()] }
        );
    }
}
