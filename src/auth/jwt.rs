use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use axum::http::HeaderMap;
use log::{debug, error};

// JWT Claims structure
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Claims {
    pub sub: String,        // Subject (user_id)
    pub jti: String,        // JWT ID (unique session identifier)
    pub exp: i64,           // Expiration time
    pub iat: i64,           // Issued at
    pub user_id: String,    // User identifier
    pub permissions: Vec<String>,
}

pub const DEFAULT_PERMISSIONS: [&str; 2] = ["read_data", "websocket_connect"];

pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5; // small clock skew allowance

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
            validation,
        }
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, String> {
        match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(token_data) => {
                let claims = token_data.claims;

                if claims.exp < Utc::now().timestamp() {
                    return Err("Token expired".to_string());
                }
                if claims.sub.is_empty() || claims.jti.is_empty() {
                    return Err("Invalid token claims".to_string());
                }

                Ok(claims)
            }
            Err(e) => {
                debug!("JWT validation error: {:?}", e);
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err("Token expired".to_string()),
                    _ => Err(format!("Invalid token: {}", e)),
                }
            }
        }
    }
}

/// Issues short-lived access tokens for the token endpoint.
pub struct JwtGenerator {
    encoding_key: EncodingKey,
}

impl JwtGenerator {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_ref()),
        }
    }

    pub fn issue(&self, user_id: &str, ttl_secs: i64) -> Result<(String, Claims), String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            jti: uuid::Uuid::new_v4().to_string(),
            exp: now + ttl_secs,
            iat: now,
            user_id: user_id.to_string(),
            permissions: DEFAULT_PERMISSIONS.iter().map(|p| p.to_string()).collect(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map(|token| (token, claims))
            .map_err(|e| {
                error!("Failed to sign token for {}: {}", user_id, e);
                format!("Failed to sign token: {}", e)
            })
    }
}

/// Bearer token from the Authorization header.
pub fn extract_jwt_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
}

/// Token from the handshake, header first, then the `token` query parameter
/// (browser clients cannot set headers on a WebSocket upgrade).
pub fn extract_jwt_from_request(req: &tokio_tungstenite::tungstenite::handshake::server::Request) -> Option<String> {
    if let Some(token) = extract_jwt_from_headers(req.headers()) {
        return Some(token);
    }

    req.uri().query().and_then(token_from_query)
}

pub fn token_from_query(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| *key == "token")
        .and_then(|(_, value)| urlencoding::decode(value).ok())
        .map(|token| token.into_owned())
}
