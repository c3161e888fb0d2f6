pub mod handler;
pub mod protocol;

pub use handler::{WebSocketHandler, WS_PATH};
pub use protocol::{ClientEnvelope, ServerEnvelope, CLOSE_TOKEN_EXPIRED};
