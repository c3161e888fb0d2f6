pub mod handlers;

pub use handlers::{ApiState, create_api_router, API_KEY_HEADER, QuoteResponse, TokenResponse};
