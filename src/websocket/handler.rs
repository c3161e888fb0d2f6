use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use log::{info, warn, error, debug};

use crate::auth::{Claims, SessionManager, extract_jwt_from_request};
use crate::data::{Ohlcv, PubSubManager};
use crate::websocket::protocol::{ClientEnvelope, ServerEnvelope, CLOSE_TOKEN_EXPIRED};

pub const WS_PATH: &str = "/ws";
const OUTBOUND_BUFFER: usize = 256;
const WRITE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FeedKind {
    Candles,
    Quote,
}

/// Serves one client connection: authenticates the handshake, then relays the
/// per-symbol channels the client subscribes to.
pub struct WebSocketHandler {
    session_manager: SessionManager,
    pubsub: Arc<PubSubManager>,
    peer_addr: String,
}

impl WebSocketHandler {
    pub fn new(session_manager: SessionManager, pubsub: Arc<PubSubManager>, peer_addr: String) -> Self {
        Self {
            session_manager,
            pubsub,
            peer_addr,
        }
    }

    pub async fn handle_connection(self, stream: TcpStream) {
        let mut jwt_claims: Option<Claims> = None;

        let handshake = accept_hdr_async(stream, |req: &Request, response: Response| {
            let result = self.authenticate_request(req, response);
            if let Ok((_, claims)) = &result {
                jwt_claims = Some(claims.clone());
            }
            result.map(|(response, _)| response)
        })
        .await;

        let ws_stream = match handshake {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WebSocket handshake failed for {}: {}", self.peer_addr, e);
                return;
            }
        };

        match jwt_claims {
            Some(claims) => self.serve(ws_stream, claims).await,
            None => error!("No JWT claims found after successful handshake from {}", self.peer_addr),
        }
    }

    fn authenticate_request(
        &self,
        req: &Request,
        response: Response,
    ) -> Result<(Response, Claims), ErrorResponse> {
        let path = req.uri().path();
        if path != WS_PATH {
            warn!("Unknown WebSocket path '{}' from {}", path, self.peer_addr);
            return Err(error_response(StatusCode::NOT_FOUND, "Invalid WebSocket path"));
        }

        let token = match extract_jwt_from_request(req) {
            Some(t) => t,
            None => {
                warn!("Authentication failed - missing JWT token from {}", self.peer_addr);
                return Err(error_response(
                    StatusCode::UNAUTHORIZED,
                    "Missing Authorization header or token parameter",
                ));
            }
        };

        match self.session_manager.try_acquire_session(&token) {
            Ok(claims) => {
                info!("Authenticated session - User: {}, Session: {} from {}",
                      claims.user_id, short_id(&claims.jti), self.peer_addr);
                Ok((response, claims))
            }
            Err(error_msg) => {
                warn!("JWT authentication failed for {}: {}", self.peer_addr, error_msg);
                let status = match error_msg.as_str() {
                    "Session already active" => StatusCode::CONFLICT,
                    "Maximum connections reached" => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::UNAUTHORIZED,
                };
                Err(error_response(status, &error_msg))
            }
        }
    }

    async fn serve(&self, ws_stream: WebSocketStream<TcpStream>, claims: Claims) {
        let (write, read) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        let session_id = claims.jti.clone();

        let write_task = spawn_write_task(write, out_rx);

        let connected = ServerEnvelope::Connected {
            session_id: session_id.clone(),
            expires_at: claims.exp,
        };
        send_envelope(&out_tx, &connected).await;

        let mut session = ClientSession {
            session_id: session_id.clone(),
            session_manager: self.session_manager.clone(),
            pubsub: self.pubsub.clone(),
            out_tx,
            forwarders: HashMap::new(),
        };
        session.run(read, claims.exp).await;
        session.shutdown();
        // the write task ends once every sender is gone, including this one
        drop(session);

        let abort = write_task.abort_handle();
        match tokio::time::timeout(WRITE_DRAIN_TIMEOUT, write_task).await {
            Ok(Err(e)) => debug!("Write task for {} ended abnormally: {}", short_id(&session_id), e),
            Ok(Ok(())) => {}
            Err(_) => {
                debug!("Write task for {} did not drain in time", short_id(&session_id));
                abort.abort();
            }
        }

        let connected_for = self
            .session_manager
            .get_session_info(&session_id)
            .map(|info| info.connected_at.elapsed());
        self.pubsub.unsubscribe(&session_id, None);
        if let Err(e) = self.session_manager.release_session(&session_id) {
            error!("Failed to release session {}: {}", short_id(&session_id), e);
        }

        info!("WebSocket connection closed - User: {}, Session: {} from {} after {:?}",
              claims.user_id, short_id(&session_id), self.peer_addr, connected_for.unwrap_or_default());
    }
}

struct ClientSession {
    session_id: String,
    session_manager: SessionManager,
    pubsub: Arc<PubSubManager>,
    out_tx: mpsc::Sender<Message>,
    forwarders: HashMap<(FeedKind, String), JoinHandle<()>>,
}

impl ClientSession {
    async fn run(
        &mut self,
        mut read: futures::stream::SplitStream<WebSocketStream<TcpStream>>,
        expires_at: i64,
    ) {
        let expiry = tokio::time::sleep_until(deadline_for(expires_at));
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            warn!("WebSocket error for session {}: {}", short_id(&self.session_id), e);
                            break;
                        }
                        None => break,
                    };
                    let _ = self.session_manager.update_heartbeat(&self.session_id);
                    match msg {
                        Message::Text(text) => {
                            if let Some(new_expiry) = self.handle_text(&text).await {
                                expiry.as_mut().reset(deadline_for(new_expiry));
                            }
                        }
                        Message::Close(frame) => {
                            debug!("Client closed session {}: {:?}", short_id(&self.session_id), frame);
                            break;
                        }
                        _ => {}
                    }
                }
                _ = &mut expiry => {
                    warn!("Token for session {} expired without refresh", short_id(&self.session_id));
                    let frame = CloseFrame {
                        code: CloseCode::from(CLOSE_TOKEN_EXPIRED),
                        reason: "token expired".into(),
                    };
                    let _ = self.out_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    }

    /// Handles one control message. Returns the new token expiry on a successful refresh.
    async fn handle_text(&mut self, text: &str) -> Option<i64> {
        let envelope = match serde_json::from_str::<ClientEnvelope>(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Unparseable message from session {}: {}", short_id(&self.session_id), e);
                send_envelope(&self.out_tx, &ServerEnvelope::error(format!("Invalid message: {}", e))).await;
                return None;
            }
        };

        match envelope {
            ClientEnvelope::SubscribeList { symbols } => {
                for symbol in symbols {
                    self.subscribe(FeedKind::Candles, &symbol).await;
                }
            }
            ClientEnvelope::UnsubscribeList { symbols } => {
                for symbol in symbols {
                    self.unsubscribe(FeedKind::Candles, &symbol);
                }
            }
            ClientEnvelope::SubscribeQuote { symbol } => self.subscribe(FeedKind::Quote, &symbol).await,
            ClientEnvelope::UnsubscribeQuote { symbol } => self.unsubscribe(FeedKind::Quote, &symbol),
            ClientEnvelope::Ping => {
                send_envelope(&self.out_tx, &ServerEnvelope::Pong).await;
            }
            ClientEnvelope::RefreshToken { token } => {
                return match self.session_manager.refresh_session(&self.session_id, &token) {
                    Ok(claims) => {
                        info!("Session {} rotated its token", short_id(&self.session_id));
                        send_envelope(&self.out_tx, &ServerEnvelope::TokenRefreshed { expires_at: claims.exp }).await;
                        Some(claims.exp)
                    }
                    Err(e) => {
                        warn!("Token refresh rejected for session {}: {}", short_id(&self.session_id), e);
                        send_envelope(&self.out_tx, &ServerEnvelope::error(format!("Token refresh failed: {}", e))).await;
                        None
                    }
                };
            }
        }
        None
    }

    async fn subscribe(&mut self, kind: FeedKind, symbol: &str) {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            send_envelope(&self.out_tx, &ServerEnvelope::error("Empty symbol")).await;
            return;
        }
        let key = (kind, symbol.clone());
        if self.forwarders.contains_key(&key) {
            return;
        }

        let rx = match self.pubsub.subscribe(&self.session_id, &symbol) {
            Ok(rx) => rx,
            Err(e) => {
                error!("Subscribe {} failed for session {}: {}", symbol, short_id(&self.session_id), e);
                send_envelope(&self.out_tx, &ServerEnvelope::error(e)).await;
                return;
            }
        };

        // current state first so the client never starts blank
        if let Some(bar) = self.pubsub.last_bar(&symbol) {
            send_envelope(&self.out_tx, &render(kind, &symbol, &bar, true)).await;
        }

        let task = spawn_forwarder(kind, symbol, rx, self.out_tx.clone());
        self.forwarders.insert(key, task);
    }

    fn unsubscribe(&mut self, kind: FeedKind, symbol: &str) {
        let symbol = symbol.trim().to_uppercase();
        if let Some(task) = self.forwarders.remove(&(kind, symbol.clone())) {
            task.abort();
        }
        let still_used = self.forwarders.keys().any(|(_, s)| *s == symbol);
        if !still_used {
            self.pubsub.unsubscribe(&self.session_id, Some(&symbol));
        }
    }

    fn shutdown(&mut self) {
        for (_, task) in self.forwarders.drain() {
            task.abort();
        }
    }
}

fn render(kind: FeedKind, symbol: &str, bar: &Ohlcv, snapshot: bool) -> ServerEnvelope {
    match kind {
        FeedKind::Quote => ServerEnvelope::quote_from_bar(symbol, bar),
        FeedKind::Candles if snapshot => ServerEnvelope::Snapshot { symbol: symbol.to_string(), data: *bar },
        FeedKind::Candles => ServerEnvelope::Aggregate { symbol: symbol.to_string(), data: *bar },
    }
}

fn spawn_forwarder(
    kind: FeedKind,
    symbol: String,
    mut rx: broadcast::Receiver<String>,
    out_tx: mpsc::Sender<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(payload) => {
                    let bar: Ohlcv = match serde_json::from_str(&payload) {
                        Ok(bar) => bar,
                        Err(e) => {
                            error!("Bad payload on {} channel: {}", symbol, e);
                            continue;
                        }
                    };
                    if !send_envelope(&out_tx, &render(kind, &symbol, &bar, false)).await {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber for {} lagged, skipped {} updates", symbol, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_write_task(
    mut write: futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>,
    mut out_rx: mpsc::Receiver<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = write.send(message).await {
                debug!("Error sending message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = write.close().await;
    })
}

/// Returns false once the connection's writer is gone.
async fn send_envelope(out_tx: &mpsc::Sender<Message>, envelope: &ServerEnvelope) -> bool {
    match envelope.to_json() {
        Ok(json) => out_tx.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            error!("Failed to encode envelope: {}", e);
            true
        }
    }
}

fn deadline_for(expires_at: i64) -> Instant {
    let remaining = (expires_at - chrono::Utc::now().timestamp()).max(0) as u64;
    Instant::now() + Duration::from_secs(remaining)
}

fn error_response(status: StatusCode, message: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message.to_string()));
    *response.status_mut() = status;
    response
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::connect_async;
    use crate::auth::JwtGenerator;

    const SECRET: &str = "handler-test-secret-0123456789abcdef";

    async fn start_server(pubsub: Arc<PubSubManager>) -> String {
        start_server_with(pubsub, SessionManager::new(SECRET)).await
    }

    async fn start_server_with(pubsub: Arc<PubSubManager>, sessions: SessionManager) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let handler = WebSocketHandler::new(sessions.clone(), pubsub.clone(), peer.to_string());
                tokio::spawn(handler.handle_connection(stream));
            }
        });
        format!("ws://{}", addr)
    }

    async fn next_envelope(
        ws: &mut WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    ) -> ServerEnvelope {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[test]
    fn test_render_kinds() {
        let bar = Ohlcv { o: 1.0, h: 1.0, l: 1.0, c: 1.0, v: 2.0, t: 3 };
        assert!(matches!(render(FeedKind::Candles, "A", &bar, true), ServerEnvelope::Snapshot { .. }));
        assert!(matches!(render(FeedKind::Candles, "A", &bar, false), ServerEnvelope::Aggregate { .. }));
        assert!(matches!(render(FeedKind::Quote, "A", &bar, true), ServerEnvelope::Quote { .. }));
    }

    #[tokio::test]
    async fn test_rejects_missing_token() {
        let base = start_server(Arc::new(PubSubManager::new("candles:", 16))).await;
        assert!(connect_async(format!("{}/ws", base)).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_then_live_aggregate() {
        let pubsub = Arc::new(PubSubManager::new("candles:", 16));
        let bar = Ohlcv { o: 1.0, h: 2.0, l: 1.0, c: 2.0, v: 5.0, t: 10 };
        pubsub.publish("AAPL", &bar).unwrap();

        let base = start_server(pubsub.clone()).await;
        let (token, _) = JwtGenerator::new(SECRET).issue("carol", 60).unwrap();
        let (mut ws, _) = connect_async(format!("{}/ws?token={}", base, token)).await.unwrap();

        assert!(matches!(next_envelope(&mut ws).await, ServerEnvelope::Connected { .. }));

        let subscribe = ClientEnvelope::SubscribeList { symbols: vec!["aapl".to_string()] };
        ws.send(Message::Text(subscribe.to_json().unwrap())).await.unwrap();
        assert_eq!(
            next_envelope(&mut ws).await,
            ServerEnvelope::Snapshot { symbol: "AAPL".to_string(), data: bar }
        );

        let live = Ohlcv { o: 2.0, h: 3.0, l: 2.0, c: 3.0, v: 1.0, t: 11 };
        // wait until the forwarder is attached before publishing
        while pubsub.get_subscriber_count("AAPL") == 0 {
            tokio::task::yield_now().await;
        }
        pubsub.publish("AAPL", &live).unwrap();
        assert_eq!(
            next_envelope(&mut ws).await,
            ServerEnvelope::Aggregate { symbol: "AAPL".to_string(), data: live }
        );

        ws.send(Message::Text(ClientEnvelope::Ping.to_json().unwrap())).await.unwrap();
        assert_eq!(next_envelope(&mut ws).await, ServerEnvelope::Pong);
    }

    #[tokio::test]
    async fn test_refresh_token_in_band() {
        let base = start_server(Arc::new(PubSubManager::new("candles:", 16))).await;
        let generator = JwtGenerator::new(SECRET);
        let (token, _) = generator.issue("dave", 60).unwrap();
        let (mut ws, _) = connect_async(format!("{}/ws?token={}", base, token)).await.unwrap();
        next_envelope(&mut ws).await;

        let (fresh, fresh_claims) = generator.issue("dave", 600).unwrap();
        let refresh = ClientEnvelope::RefreshToken { token: fresh };
        ws.send(Message::Text(refresh.to_json().unwrap())).await.unwrap();
        assert_eq!(
            next_envelope(&mut ws).await,
            ServerEnvelope::TokenRefreshed { expires_at: fresh_claims.exp }
        );

        let bogus = ClientEnvelope::RefreshToken { token: "not-a-jwt".to_string() };
        ws.send(Message::Text(bogus.to_json().unwrap())).await.unwrap();
        assert!(matches!(next_envelope(&mut ws).await, ServerEnvelope::Error { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_releases_session_and_subscriptions() {
        let pubsub = Arc::new(PubSubManager::new("candles:", 16));
        let sessions = SessionManager::new(SECRET);
        let base = start_server_with(pubsub.clone(), sessions.clone()).await;
        let (token, _) = JwtGenerator::new(SECRET).issue("erin", 60).unwrap();
        let url = format!("{}/ws?token={}", base, token);

        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        next_envelope(&mut ws).await;
        let subscribe = ClientEnvelope::SubscribeList { symbols: vec!["AAPL".to_string()] };
        ws.send(Message::Text(subscribe.to_json().unwrap())).await.unwrap();
        while pubsub.get_subscriber_count("AAPL") == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(sessions.get_session_count(), 1);

        ws.close(None).await.unwrap();
        drop(ws);

        let released = async {
            while sessions.get_session_count() != 0 || pubsub.get_stats().1 != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), released).await.unwrap();
        assert_eq!(pubsub.get_subscriber_count("AAPL"), 0);

        // the same credential can open a new session right away
        let (mut again, _) = connect_async(url.as_str()).await.unwrap();
        assert!(matches!(next_envelope(&mut again).await, ServerEnvelope::Connected { .. }));
    }
}
