pub mod jwt;
pub mod session;

pub use jwt::{Claims, JwtGenerator, JwtValidator, extract_jwt_from_headers, extract_jwt_from_request};
pub use session::{SessionManager, ConnectionInfo};
