use serde::{Deserialize, Serialize};

use crate::data::Ohlcv;

/// Close code sent when a session's token expires without being refreshed.
pub const CLOSE_TOKEN_EXPIRED: u16 = 4001;

/// Client -> server control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientEnvelope {
    SubscribeList { symbols: Vec<String> },
    UnsubscribeList { symbols: Vec<String> },
    SubscribeQuote { symbol: String },
    UnsubscribeQuote { symbol: String },
    Ping,
    RefreshToken { token: String },
}

/// Server -> client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    Connected { session_id: String, expires_at: i64 },
    Snapshot { symbol: String, data: Ohlcv },
    Aggregate { symbol: String, data: Ohlcv },
    Quote { symbol: String, price: f64, volume: f64, t: i64 },
    Pong,
    TokenRefreshed { expires_at: i64 },
    Error { message: String },
}

impl ServerEnvelope {
    pub fn quote_from_bar(symbol: &str, bar: &Ohlcv) -> Self {
        ServerEnvelope::Quote {
            symbol: symbol.to_string(),
            price: bar.c,
            volume: bar.v,
            t: bar.t,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEnvelope::Error { message: message.into() }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ClientEnvelope {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
