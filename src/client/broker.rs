use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use log::{info, warn, error, debug};

use crate::client::multiplexer::{Backoff, Effect, MultiplexerCore, Status};
use crate::client::topic::{route, Topic};
use crate::websocket::{ClientEnvelope, ServerEnvelope};

/// How long a reconnect waits for a fresh credential before dialing anyway.
pub const CREDENTIAL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

/// What a port receives back from the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent {
    Status(Status),
    Message(ServerEnvelope),
}

/// Raised right before a reconnect is dialed. Acknowledge once a fresh
/// credential has been handed to the multiplexer.
#[derive(Debug)]
pub struct ReconnectNotice {
    pub ack: oneshot::Sender<()>,
}

#[derive(Debug)]
enum Command {
    Attach { port: u64, events: mpsc::UnboundedSender<PortEvent> },
    Detach { port: u64 },
    Connect { url: String, token: String },
    UpdateToken { url: String, token: String },
    Subscribe { port: u64, topic: Topic },
    Unsubscribe { port: u64, topic: Topic },
    Send(ClientEnvelope),
    ReconnectReady { ticket: u64 },
}

#[derive(Debug)]
enum ConnEvent {
    Opened(u64),
    Inbound(u64, String),
    Closed(u64),
}

/// Cloneable entry point to the broker task.
#[derive(Clone)]
pub struct MultiplexerHandle {
    commands: mpsc::UnboundedSender<Command>,
    next_port: Arc<AtomicU64>,
}

impl MultiplexerHandle {
    /// Attaches a new logical consumer.
    pub fn port(&self) -> Port {
        let id = self.next_port.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.commands.send(Command::Attach { port: id, events: tx });
        Port {
            sender: PortSender { id, commands: self.commands.clone() },
            events: rx,
        }
    }

    pub fn update_token(&self, url: &str, token: &str) {
        let _ = self.commands.send(Command::UpdateToken { url: url.to_string(), token: token.to_string() });
    }
}

/// Intent half of a port. Cloneable; does not keep the port attached.
#[derive(Clone)]
pub struct PortSender {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl PortSender {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connect(&self, url: &str, token: &str) {
        let _ = self.commands.send(Command::Connect { url: url.to_string(), token: token.to_string() });
    }

    pub fn subscribe(&self, topic: Topic) {
        let _ = self.commands.send(Command::Subscribe { port: self.id, topic });
    }

    pub fn unsubscribe(&self, topic: Topic) {
        let _ = self.commands.send(Command::Unsubscribe { port: self.id, topic });
    }

    pub fn send(&self, envelope: ClientEnvelope) {
        let _ = self.commands.send(Command::Send(envelope));
    }
}

/// One logical consumer of the shared connection. Detaches on drop.
pub struct Port {
    sender: PortSender,
    events: mpsc::UnboundedReceiver<PortEvent>,
}

impl Port {
    pub fn sender(&self) -> PortSender {
        self.sender.clone()
    }

    pub async fn recv(&mut self) -> Option<PortEvent> {
        self.events.recv().await
    }
}

impl std::ops::Deref for Port {
    type Target = PortSender;

    fn deref(&self) -> &PortSender {
        &self.sender
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        let _ = self.sender.commands.send(Command::Detach { port: self.sender.id });
    }
}

struct PortEntry {
    events: mpsc::UnboundedSender<PortEvent>,
    topics: HashSet<Topic>,
}

struct Connection {
    id: u64,
    writer: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

/// Owns the single physical connection and executes the core's effects.
pub struct Broker {
    core: MultiplexerCore,
    config: MultiplexerConfig,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
    conn_tx: mpsc::UnboundedSender<ConnEvent>,
    conn_rx: mpsc::UnboundedReceiver<ConnEvent>,
    notices: mpsc::Sender<ReconnectNotice>,
    ports: HashMap<u64, PortEntry>,
    topic_refs: HashMap<Topic, usize>,
    connection: Option<Connection>,
    status: Status,
}

impl Broker {
    /// Starts the broker task. The returned receiver yields a notice before
    /// every reconnect attempt.
    pub fn spawn(config: MultiplexerConfig) -> (MultiplexerHandle, mpsc::Receiver<ReconnectNotice>, JoinHandle<()>) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (notices, notice_rx) = mpsc::channel(4);

        let broker = Broker {
            core: MultiplexerCore::new(
                Backoff::new(config.backoff_base, config.backoff_max),
                config.heartbeat_timeout,
            ),
            config,
            commands_tx: commands_tx.clone(),
            commands,
            conn_tx,
            conn_rx,
            notices,
            ports: HashMap::new(),
            topic_refs: HashMap::new(),
            connection: None,
            status: Status::Idle,
        };

        let handle = MultiplexerHandle {
            commands: commands_tx,
            next_port: Arc::new(AtomicU64::new(1)),
        };
        let task = tokio::spawn(broker.run());
        (handle, notice_rx, task)
    }

    async fn run(mut self) {
        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    // the broker keeps a sender itself, so this never yields None
                    let Some(command) = command else { break };
                    if self.handle_command(command) {
                        break;
                    }
                }
                Some(event) = self.conn_rx.recv() => self.handle_conn_event(event),
                _ = heartbeat.tick() => {
                    let effects = self.core.on_heartbeat(Instant::now());
                    self.apply(effects);
                }
            }
        }
        info!("Multiplexer disposed");
    }

    /// Returns true once the last port has detached.
    fn handle_command(&mut self, command: Command) -> bool {
        let effects = match command {
            Command::Attach { port, events } => {
                let _ = events.send(PortEvent::Status(self.status));
                self.ports.insert(port, PortEntry { events, topics: HashSet::new() });
                debug!("Port {} attached ({} total)", port, self.ports.len());
                Vec::new()
            }
            Command::Detach { port } => {
                let mut effects = Vec::new();
                if let Some(entry) = self.ports.remove(&port) {
                    for topic in entry.topics {
                        effects.extend(self.release_topic(&topic));
                    }
                }
                debug!("Port {} detached ({} left)", port, self.ports.len());
                if self.ports.is_empty() {
                    effects.extend(self.core.dispose());
                    self.apply(effects);
                    return true;
                }
                effects
            }
            Command::Connect { url, token } => self.core.connect(&url, &token),
            Command::UpdateToken { url, token } => self.core.update_token(&url, &token),
            Command::Subscribe { port, topic } => {
                let newly_added = self.ports
                    .get_mut(&port)
                    .map(|entry| entry.topics.insert(topic.clone()))
                    .unwrap_or(false);
                if newly_added {
                    let refs = self.topic_refs.entry(topic.clone()).or_insert(0);
                    *refs += 1;
                    if *refs == 1 {
                        self.core.subscribe(topic)
                    } else {
                        Vec::new()
                    }
                } else {
                    Vec::new()
                }
            }
            Command::Unsubscribe { port, topic } => {
                let removed = self.ports
                    .get_mut(&port)
                    .map(|entry| entry.topics.remove(&topic))
                    .unwrap_or(false);
                if removed {
                    self.release_topic(&topic)
                } else {
                    Vec::new()
                }
            }
            Command::Send(envelope) => self.core.send(envelope),
            Command::ReconnectReady { ticket } => self.core.reconnect_due(ticket),
        };
        self.apply(effects);
        false
    }

    fn release_topic(&mut self, topic: &Topic) -> Vec<Effect> {
        match self.topic_refs.get_mut(topic) {
            Some(refs) if *refs > 1 => {
                *refs -= 1;
                Vec::new()
            }
            Some(_) => {
                self.topic_refs.remove(topic);
                self.core.unsubscribe(topic)
            }
            None => Vec::new(),
        }
    }

    fn handle_conn_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Opened(conn) => {
                let effects = self.core.on_opened(conn, Instant::now());
                self.apply(effects);
            }
            ConnEvent::Inbound(conn, text) => {
                if conn != self.core.current_conn() {
                    return;
                }
                self.core.on_activity(conn, Instant::now());
                match serde_json::from_str::<ServerEnvelope>(&text) {
                    Ok(envelope) => self.dispatch(envelope),
                    Err(e) => warn!("Unparseable server message: {}", e),
                }
            }
            ConnEvent::Closed(conn) => {
                if self.connection.as_ref().map(|c| c.id) == Some(conn) {
                    self.connection = None;
                }
                let effects = self.core.on_closed(conn);
                self.apply(effects);
            }
        }
    }

    // data envelopes go to ports holding the topic, control envelopes to every port
    fn dispatch(&mut self, envelope: ServerEnvelope) {
        if let ServerEnvelope::Error { message } = &envelope {
            warn!("Server reported error: {}", message);
        }
        let topic = route(&envelope).map(|(topic, _)| topic);
        self.ports.retain(|_, entry| {
            let wanted = match &topic {
                Some(topic) => entry.topics.contains(topic),
                None => true,
            };
            !wanted || entry.events.send(PortEvent::Message(envelope.clone())).is_ok()
        });
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Dial { conn, url } => self.dial(conn, url),
                Effect::Close { conn } => self.close(conn),
                Effect::Send(envelope) => self.write(&envelope),
                Effect::ScheduleReconnect { ticket, delay } => self.schedule_reconnect(ticket, delay),
                Effect::Status(status) => {
                    self.status = status;
                    for entry in self.ports.values() {
                        let _ = entry.events.send(PortEvent::Status(status));
                    }
                }
            }
        }
    }

    fn dial(&mut self, conn: u64, url: String) {
        if let Some(previous) = self.connection.take() {
            previous.task.abort();
        }
        let (writer, outbound) = mpsc::unbounded_channel();
        let task = tokio::spawn(connection_task(conn, url, outbound, self.conn_tx.clone()));
        self.connection = Some(Connection { id: conn, writer, task });
    }

    fn close(&mut self, conn: u64) {
        if let Some(connection) = self.connection.take() {
            if connection.id == conn {
                connection.task.abort();
                // aborted tasks report nothing
                let _ = self.conn_tx.send(ConnEvent::Closed(conn));
            } else {
                self.connection = Some(connection);
            }
        }
    }

    fn write(&mut self, envelope: &ClientEnvelope) {
        let Some(connection) = &self.connection else {
            return;
        };
        match envelope.to_json() {
            Ok(json) => {
                if connection.writer.send(Message::Text(json)).is_err() {
                    debug!("Connection {} writer gone", connection.id);
                }
            }
            Err(e) => error!("Failed to encode {:?}: {}", envelope, e),
        }
    }

    fn schedule_reconnect(&self, ticket: u64, delay: Duration) {
        let commands = self.commands_tx.clone();
        let notices = self.notices.clone();
        let jitter_ms = (delay.as_millis() as u64) / 10;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));

        tokio::spawn(async move {
            tokio::time::sleep(delay + jitter).await;

            let (ack, acked) = oneshot::channel();
            if notices.try_send(ReconnectNotice { ack }).is_ok() {
                match tokio::time::timeout(CREDENTIAL_WAIT, acked).await {
                    Ok(Ok(())) => debug!("Credential refreshed before reconnect"),
                    Ok(Err(_)) => debug!("Reconnect notice dropped without ack"),
                    Err(_) => warn!("No credential within {:?}, reconnecting with the cached one", CREDENTIAL_WAIT),
                }
            }
            let _ = commands.send(Command::ReconnectReady { ticket });
        });
    }
}

async fn connection_task(
    conn: u64,
    url: String,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!("Connection {} failed: {}", conn, e);
            let _ = events.send(ConnEvent::Closed(conn));
            return;
        }
    };
    let _ = events.send(ConnEvent::Opened(conn));

    let (mut write, mut read) = ws_stream.split();
    loop {
        tokio::select! {
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(ConnEvent::Inbound(conn, text));
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("Connection {} closed by server: {:?}", conn, frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Connection {} error: {}", conn, e);
                    break;
                }
                None => break,
            },
            outgoing = outbound.recv() => match outgoing {
                Some(message) => {
                    if let Err(e) = write.send(message).await {
                        warn!("Connection {} write failed: {}", conn, e);
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = write.close().await;
    let _ = events.send(ConnEvent::Closed(conn));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, accept_hdr_async};
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use crate::data::Ohlcv;

    fn config() -> MultiplexerConfig {
        MultiplexerConfig {
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_millis(200),
        }
    }

    struct TestServer {
        url: String,
        accepted: Arc<AtomicU64>,
        received: Arc<Mutex<Vec<ClientEnvelope>>>,
        push: mpsc::UnboundedSender<ServerEnvelope>,
    }

    // Accepts connections, records client envelopes and pushes to the latest connection
    async fn start_server() -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicU64::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let (push, mut push_rx) = mpsc::unbounded_channel::<ServerEnvelope>();

        let (accepted_c, received_c) = (accepted.clone(), received.clone());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accepted_c.fetch_add(1, Ordering::SeqCst);
            let ws = accept_async(stream).await.unwrap();
            let (mut write, mut read) = ws.split();
            loop {
                tokio::select! {
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            received_c.lock().unwrap().push(serde_json::from_str(&text).unwrap());
                        }
                        Some(Ok(_)) => {}
                        _ => break,
                    },
                    Some(envelope) = push_rx.recv() => {
                        write.send(Message::Text(envelope.to_json().unwrap())).await.unwrap();
                    }
                }
            }
        });

        TestServer { url, accepted, received, push }
    }

    async fn wait_for_status(port: &mut Port, wanted: Status) {
        loop {
            if let Some(PortEvent::Status(status)) = port.recv().await {
                if status == wanted {
                    return;
                }
            }
        }
    }

    async fn next_message(port: &mut Port) -> ServerEnvelope {
        loop {
            if let Some(PortEvent::Message(envelope)) = port.recv().await {
                return envelope;
            }
        }
    }

    #[tokio::test]
    async fn test_ports_share_one_connection_and_route_by_topic() {
        let server = start_server().await;
        let (handle, _notices, _task) = Broker::spawn(config());

        let mut candles_port = handle.port();
        let mut quote_port = handle.port();
        candles_port.subscribe(Topic::candles("AAPL"));
        quote_port.subscribe(Topic::candles("AAPL"));
        quote_port.subscribe(Topic::quote("MSFT"));
        candles_port.connect(&server.url, "token-1");

        wait_for_status(&mut candles_port, Status::Open).await;
        wait_for_status(&mut quote_port, Status::Open).await;

        let bar = Ohlcv { o: 1.0, h: 1.0, l: 1.0, c: 1.0, v: 1.0, t: 1 };
        server.push.send(ServerEnvelope::quote_from_bar("MSFT", &bar)).unwrap();
        server.push.send(ServerEnvelope::Aggregate { symbol: "AAPL".to_string(), data: bar }).unwrap();

        // the quote is not routed to the candles-only port
        assert!(matches!(next_message(&mut candles_port).await, ServerEnvelope::Aggregate { .. }));
        assert!(matches!(next_message(&mut quote_port).await, ServerEnvelope::Quote { .. }));
        assert!(matches!(next_message(&mut quote_port).await, ServerEnvelope::Aggregate { .. }));

        assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
        for _ in 0..100 {
            if server.received.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let received = server.received.lock().unwrap().clone();
        assert_eq!(received.len(), 2);
        let aapl_subscribes = received
            .iter()
            .filter(|e| **e == ClientEnvelope::SubscribeList { symbols: vec!["AAPL".to_string()] })
            .count();
        assert_eq!(aapl_subscribes, 1);
    }

    #[tokio::test]
    async fn test_last_detach_disposes() {
        let (handle, _notices, task) = Broker::spawn(config());
        let first = handle.port();
        let second = handle.port();

        drop(first);
        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        drop(second);
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    struct DroppingServer {
        url: String,
        handshakes: Arc<Mutex<Vec<String>>>,
        received: Arc<Mutex<Vec<Vec<ClientEnvelope>>>>,
    }

    // Records every handshake URI and closes the first connection after `drop_after` messages
    async fn start_dropping_server(drop_after: usize) -> DroppingServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let handshakes = Arc::new(Mutex::new(Vec::new()));
        let received = Arc::new(Mutex::new(Vec::new()));

        let (handshakes_c, received_c) = (handshakes.clone(), received.clone());
        tokio::spawn(async move {
            let mut next_index = 0;
            while let Ok((stream, _)) = listener.accept().await {
                let index = next_index;
                next_index += 1;
                received_c.lock().unwrap().push(Vec::new());
                let (handshakes, received) = (handshakes_c.clone(), received_c.clone());

                tokio::spawn(async move {
                    let ws = accept_hdr_async(stream, |req: &Request, response: Response| {
                        handshakes.lock().unwrap().push(req.uri().to_string());
                        Ok::<Response, ErrorResponse>(response)
                    })
                    .await
                    .unwrap();
                    let (mut write, mut read) = ws.split();
                    while let Some(Ok(msg)) = read.next().await {
                        if let Message::Text(text) = msg {
                            let count = {
                                let mut per_conn = received.lock().unwrap();
                                per_conn[index].push(serde_json::from_str(&text).unwrap());
                                per_conn[index].len()
                            };
                            if index == 0 && count == drop_after {
                                break;
                            }
                        }
                    }
                    let _ = write.close().await;
                });
            }
        });

        DroppingServer { url, handshakes, received }
    }

    #[tokio::test]
    async fn test_reconnect_uses_rotated_token_and_resubscribes_once() {
        let server = start_dropping_server(2).await;
        let (handle, mut notices, _task) = Broker::spawn(config());

        let port = handle.port();
        port.subscribe(Topic::candles("AAPL"));
        port.subscribe(Topic::quote("MSFT"));
        port.connect(&server.url, "t1");

        // the server drops the first connection; rotate the credential before the redial
        let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
            .await
            .unwrap()
            .unwrap();
        handle.update_token(&server.url, "t2");
        notice.ack.send(()).unwrap();

        let resubscribed = async {
            loop {
                let done = server.received.lock().unwrap().get(1).map(|r| r.len() >= 2).unwrap_or(false);
                if done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), resubscribed).await.unwrap();
        // nothing else trickles in on the new socket
        tokio::time::sleep(Duration::from_millis(100)).await;

        let handshakes = server.handshakes.lock().unwrap().clone();
        assert_eq!(handshakes.len(), 2);
        assert!(handshakes[0].ends_with("token=t1"), "{}", handshakes[0]);
        assert!(handshakes[1].ends_with("token=t2"), "{}", handshakes[1]);

        let second = server.received.lock().unwrap()[1].clone();
        assert_eq!(second.len(), 2);
        let expected = [
            ClientEnvelope::SubscribeList { symbols: vec!["AAPL".to_string()] },
            ClientEnvelope::SubscribeQuote { symbol: "MSFT".to_string() },
        ];
        for envelope in &expected {
            assert_eq!(second.iter().filter(|e| *e == envelope).count(), 1, "{:?}", second);
        }
    }
}
