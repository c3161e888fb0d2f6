use std::sync::{Arc, Mutex};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use log::{warn, info};

use crate::auth::jwt::{Claims, JwtValidator};

// Configuration constants
pub const MAX_CONNECTIONS: usize = 1000;
pub const CONNECTION_TIMEOUT_SECS: u64 = 300; // 5 minutes

// Connection tracking with JWT metadata
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub session_id: String,     // jti of the token that opened the connection
    pub user_id: String,
    pub connected_at: Instant,
    pub last_heartbeat: Instant,
    pub expires_at: i64,        // exp of the most recent valid token
    pub permissions: Vec<String>,
}

impl ConnectionInfo {
    pub fn new(claims: &Claims) -> Self {
        let now = Instant::now();
        Self {
            session_id: claims.jti.clone(),
            user_id: claims.user_id.clone(),
            connected_at: now,
            last_heartbeat: now,
            expires_at: claims.exp,
            permissions: claims.permissions.clone(),
        }
    }

    pub fn update_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    pub fn is_stale(&self, timeout: Duration) -> bool {
        Instant::now().duration_since(self.last_heartbeat) > timeout
    }
}

#[derive(Clone)]
pub struct SessionManager {
    active_sessions: Arc<Mutex<HashMap<String, ConnectionInfo>>>,
    jwt_validator: Arc<JwtValidator>,
}

impl SessionManager {
    pub fn new(jwt_secret: &str) -> Self {
        Self {
            active_sessions: Arc::new(Mutex::new(HashMap::new())),
            jwt_validator: Arc::new(JwtValidator::new(jwt_secret)),
        }
    }

    pub fn try_acquire_session(&self, token: &str) -> Result<Claims, String> {
        let claims = self.jwt_validator.validate_token(token)?;

        let mut sessions = self.active_sessions.lock()
            .map_err(|_| "Session lock poisoned".to_string())?;

        if sessions.len() >= MAX_CONNECTIONS {
            return Err("Maximum connections reached".to_string());
        }
        if sessions.contains_key(&claims.jti) {
            return Err("Session already active".to_string());
        }

        sessions.insert(claims.jti.clone(), ConnectionInfo::new(&claims));
        Ok(claims)
    }

    /// Live credential rotation: a fresh token for the same user extends the session.
    pub fn refresh_session(&self, session_id: &str, token: &str) -> Result<Claims, String> {
        let claims = self.jwt_validator.validate_token(token)?;

        let mut sessions = self.active_sessions.lock()
            .map_err(|_| "Session lock poisoned".to_string())?;
        let session = sessions.get_mut(session_id)
            .ok_or_else(|| "Session not found".to_string())?;

        if session.user_id != claims.user_id {
            warn!("Token refresh for session {} presented a different subject", session_id);
            return Err("Token subject mismatch".to_string());
        }

        session.expires_at = claims.exp;
        session.permissions = claims.permissions.clone();
        session.update_heartbeat();
        Ok(claims)
    }

    pub fn release_session(&self, session_id: &str) -> Result<(), String> {
        let mut sessions = self.active_sessions.lock()
            .map_err(|_| "Session lock poisoned".to_string())?;
        sessions.remove(session_id);
        Ok(())
    }

    pub fn update_heartbeat(&self, session_id: &str) -> Result<(), String> {
        let mut sessions = self.active_sessions.lock()
            .map_err(|_| "Session lock poisoned".to_string())?;
        match sessions.get_mut(session_id) {
            Some(info) => {
                info.update_heartbeat();
                Ok(())
            }
            None => Err("Session not found".to_string()),
        }
    }

    pub fn cleanup_stale_sessions(&self) -> usize {
        let mut sessions = match self.active_sessions.lock() {
            Ok(sess) => sess,
            Err(_) => return 0,
        };

        let timeout = Duration::from_secs(CONNECTION_TIMEOUT_SECS);
        let initial_count = sessions.len();

        sessions.retain(|_, info: &mut ConnectionInfo| !info.is_stale(timeout));

        let cleaned_count = initial_count - sessions.len();
        if cleaned_count > 0 {
            warn!("Cleaned up {} stale sessions", cleaned_count);
        }
        cleaned_count
    }

    pub fn get_session_count(&self) -> usize {
        self.active_sessions.lock()
            .map(|sessions| sessions.len())
            .unwrap_or(0)
    }

    pub fn get_session_info(&self, session_id: &str) -> Option<ConnectionInfo> {
        self.active_sessions.lock()
            .ok()?
            .get(session_id)
            .cloned()
    }

    pub fn validate_jwt(&self, token: &str) -> Result<Claims, String> {
        self.jwt_validator.validate_token(token)
    }

    pub fn log_session_stats(&self) {
        info!("Active sessions: {}/{}", self.get_session_count(), MAX_CONNECTIONS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwt::JwtGenerator;

    const SECRET: &str = "session-test-secret-0123456789abcdef";

    #[test]
    fn test_session_manager_creation() {
        let manager = SessionManager::new(SECRET);
        assert_eq!(manager.get_session_count(), 0);
    }

    #[test]
    fn test_acquire_release_and_duplicate() {
        let manager = SessionManager::new(SECRET);
        let (token, claims) = JwtGenerator::new(SECRET).issue("bob", 60).unwrap();

        manager.try_acquire_session(&token).unwrap();
        assert_eq!(manager.try_acquire_session(&token), Err("Session already active".to_string()));
        assert_eq!(manager.get_session_count(), 1);

        manager.release_session(&claims.jti).unwrap();
        assert_eq!(manager.get_session_count(), 0);
    }

    #[test]
    fn test_refresh_extends_expiry_for_same_user() {
        let manager = SessionManager::new(SECRET);
        let generator = JwtGenerator::new(SECRET);
        let (token, claims) = generator.issue("bob", 10).unwrap();
        manager.try_acquire_session(&token).unwrap();

        let (fresh, fresh_claims) = generator.issue("bob", 120).unwrap();
        manager.refresh_session(&claims.jti, &fresh).unwrap();
        assert_eq!(manager.get_session_info(&claims.jti).unwrap().expires_at, fresh_claims.exp);

        let (other, _) = generator.issue("mallory", 120).unwrap();
        assert_eq!(
            manager.refresh_session(&claims.jti, &other),
            Err("Token subject mismatch".to_string())
        );
    }

    #[test]
    fn test_connection_info_heartbeat() {
        let claims = Claims {
            sub: "test".to_string(),
            jti: "test-session".to_string(),
            exp: 0,
            iat: 0,
            user_id: "test".to_string(),
            permissions: vec![],
        };

        let mut conn_info = ConnectionInfo::new(&claims);
        let initial_heartbeat = conn_info.last_heartbeat;

        std::thread::sleep(std::time::Duration::from_millis(1));
        conn_info.update_heartbeat();

        assert!(conn_info.last_heartbeat > initial_heartbeat);
    }
}
