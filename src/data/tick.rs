use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Field names carried by every upstream log entry
pub const FIELD_SYMBOL: &str = "symbol";
pub const FIELD_PRICE: &str = "price";
pub const FIELD_SIZE: &str = "size";
pub const FIELD_TIMESTAMP: &str = "timestamp";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TickError {
    #[error("missing or empty symbol")]
    EmptySymbol,
    #[error("missing price")]
    MissingPrice,
    #[error("invalid price '{0}'")]
    InvalidPrice(String),
}

/// One executed trade as read from the upstream log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeTick {
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    pub timestamp: i64, // epoch millis
    pub entry_id: String,
}

impl TradeTick {
    /// Parses the text fields of a log entry. Only the symbol and price can
    /// reject a tick; a bad size counts as zero volume and a bad timestamp
    /// falls back to the receive time.
    pub fn from_fields(entry_id: &str, fields: &HashMap<String, String>) -> Result<Self, TickError> {
        let symbol = fields
            .get(FIELD_SYMBOL)
            .map(|s| s.trim().to_uppercase())
            .unwrap_or_default();
        if symbol.is_empty() {
            return Err(TickError::EmptySymbol);
        }

        let raw_price = fields.get(FIELD_PRICE).ok_or(TickError::MissingPrice)?;
        let price = match raw_price.trim().parse::<f64>() {
            Ok(p) if p.is_finite() && p > 0.0 => p,
            _ => return Err(TickError::InvalidPrice(raw_price.clone())),
        };

        let size = fields
            .get(FIELD_SIZE)
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|s| s.is_finite() && *s >= 0.0)
            .unwrap_or(0.0);

        let timestamp = fields
            .get(FIELD_TIMESTAMP)
            .and_then(|t| t.trim().parse::<i64>().ok())
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        Ok(Self {
            symbol,
            price,
            size,
            timestamp,
            entry_id: entry_id.to_string(),
        })
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (FIELD_SYMBOL.to_string(), self.symbol.clone()),
            (FIELD_PRICE.to_string(), self.price.to_string()),
            (FIELD_SIZE.to_string(), self.size.to_string()),
            (FIELD_TIMESTAMP.to_string(), self.timestamp.to_string()),
        ]
    }
}
