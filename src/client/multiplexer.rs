use std::collections::BTreeSet;
use std::time::Duration;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use log::{info, warn, debug};

use crate::client::topic::Topic;
use crate::websocket::ClientEnvelope;

/// Identifies the credential a physical connection was opened with.
pub fn fingerprint(token: &str) -> String {
    STANDARD.encode(Sha256::digest(token.as_bytes()))
}

/// Appends the credential as the `token` query parameter.
pub fn connect_url(url: &str, token: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}token={}", url, separator, urlencoding::encode(token))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Connecting,
    Open,
    Closing,
    Reconnecting,
    Disposed,
}

/// Exponential reconnect delay: `min(base * 2^attempt, max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.checked_pow(self.attempt).unwrap_or(u32::MAX);
        let delay = self.base.checked_mul(factor).unwrap_or(self.max).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Work the driver must carry out after a state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open physical connection `conn` to `url`.
    Dial { conn: u64, url: String },
    /// Tear down physical connection `conn`. The driver reports it closed.
    Close { conn: u64 },
    /// Write one envelope to the open connection.
    Send(ClientEnvelope),
    /// Call `reconnect_due(ticket)` after `delay`.
    ScheduleReconnect { ticket: u64, delay: Duration },
    Status(Status),
}

/// The single physical connection's state, free of I/O. Every input returns
/// the effects the driver has to execute.
#[derive(Debug)]
pub struct MultiplexerCore {
    url: Option<String>,
    credential: Option<String>,
    fingerprint: Option<String>,
    status: Status,
    backoff: Backoff,
    last_activity: Instant,
    heartbeat_timeout: Duration,
    // generation of the current physical connection
    conn: u64,
    reconnect_ticket: u64,
    topics: BTreeSet<Topic>,
}

impl MultiplexerCore {
    pub fn new(backoff: Backoff, heartbeat_timeout: Duration) -> Self {
        Self {
            url: None,
            credential: None,
            fingerprint: None,
            status: Status::Idle,
            backoff,
            last_activity: Instant::now(),
            heartbeat_timeout,
            conn: 0,
            reconnect_ticket: 0,
            topics: BTreeSet::new(),
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn current_conn(&self) -> u64 {
        self.conn
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.backoff.attempt()
    }

    pub fn topics(&self) -> impl Iterator<Item = &Topic> {
        self.topics.iter()
    }

    /// Requests a connection to `url` with `token`. A changed identity tears
    /// down the current connection and dials a new one; the topic set is kept.
    pub fn connect(&mut self, url: &str, token: &str) -> Vec<Effect> {
        let new_fingerprint = fingerprint(token);
        let same_identity = self.url.as_deref() == Some(url)
            && self.fingerprint.as_deref() == Some(new_fingerprint.as_str());
        self.set_credential(url, token, new_fingerprint);

        match self.status {
            Status::Disposed => Vec::new(),
            Status::Idle => self.dial(),
            Status::Open | Status::Connecting | Status::Closing if !same_identity => {
                info!("Connection identity changed, reopening");
                let mut effects = vec![Effect::Close { conn: self.conn }];
                effects.extend(self.dial());
                effects
            }
            // reconnect timer picks up the new credential
            _ => Vec::new(),
        }
    }

    /// Rotates the credential. While open this is an in-band refresh; otherwise
    /// only the URL used by the next connection attempt changes.
    pub fn update_token(&mut self, url: &str, token: &str) -> Vec<Effect> {
        let new_fingerprint = fingerprint(token);
        if self.url.as_deref() == Some(url) && self.fingerprint.as_deref() == Some(new_fingerprint.as_str()) {
            return Vec::new();
        }
        self.set_credential(url, token, new_fingerprint);

        match self.status {
            Status::Open => vec![Effect::Send(ClientEnvelope::RefreshToken { token: token.to_string() })],
            _ => Vec::new(),
        }
    }

    pub fn subscribe(&mut self, topic: Topic) -> Vec<Effect> {
        if self.status == Status::Disposed {
            return Vec::new();
        }
        let envelope = topic.subscribe_envelope();
        if !self.topics.insert(topic) {
            return Vec::new();
        }
        // otherwise replayed on open
        if self.status == Status::Open {
            vec![Effect::Send(envelope)]
        } else {
            Vec::new()
        }
    }

    pub fn unsubscribe(&mut self, topic: &Topic) -> Vec<Effect> {
        if !self.topics.remove(topic) {
            return Vec::new();
        }
        if self.status == Status::Open {
            vec![Effect::Send(topic.unsubscribe_envelope())]
        } else {
            Vec::new()
        }
    }

    /// Delivers only while open; anything else is dropped.
    pub fn send(&mut self, envelope: ClientEnvelope) -> Vec<Effect> {
        if self.status == Status::Open {
            vec![Effect::Send(envelope)]
        } else {
            debug!("Dropping {:?} while {:?}", envelope, self.status);
            Vec::new()
        }
    }

    pub fn on_opened(&mut self, conn: u64, now: Instant) -> Vec<Effect> {
        if conn != self.conn || self.status != Status::Connecting {
            return Vec::new();
        }
        self.status = Status::Open;
        self.backoff.reset();
        self.last_activity = now;
        info!("Connection {} open, replaying {} topics", conn, self.topics.len());

        let mut effects = vec![Effect::Status(Status::Open)];
        effects.extend(self.topics.iter().map(|topic| Effect::Send(topic.subscribe_envelope())));
        effects
    }

    pub fn on_activity(&mut self, conn: u64, now: Instant) {
        if conn == self.conn {
            self.last_activity = now;
        }
    }

    pub fn on_closed(&mut self, conn: u64) -> Vec<Effect> {
        if conn != self.conn {
            return Vec::new();
        }
        match self.status {
            Status::Open | Status::Connecting | Status::Closing => {
                let delay = self.backoff.next_delay();
                self.status = Status::Reconnecting;
                self.reconnect_ticket += 1;
                warn!("Connection {} closed, reconnecting in {:?} (attempt {})",
                      conn, delay, self.backoff.attempt());
                vec![
                    Effect::Status(Status::Reconnecting),
                    Effect::ScheduleReconnect { ticket: self.reconnect_ticket, delay },
                ]
            }
            _ => Vec::new(),
        }
    }

    /// Pings while open; silence past the timeout forces a close.
    pub fn on_heartbeat(&mut self, now: Instant) -> Vec<Effect> {
        if self.status != Status::Open {
            return Vec::new();
        }
        if now.saturating_duration_since(self.last_activity) > self.heartbeat_timeout {
            warn!("No activity on connection {} for {:?}, forcing reconnect", self.conn, self.heartbeat_timeout);
            self.status = Status::Closing;
            return vec![Effect::Status(Status::Closing), Effect::Close { conn: self.conn }];
        }
        vec![Effect::Send(ClientEnvelope::Ping)]
    }

    pub fn reconnect_due(&mut self, ticket: u64) -> Vec<Effect> {
        if ticket != self.reconnect_ticket || self.status != Status::Reconnecting {
            return Vec::new();
        }
        self.dial()
    }

    pub fn dispose(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if matches!(self.status, Status::Open | Status::Connecting | Status::Closing) {
            effects.push(Effect::Close { conn: self.conn });
        }
        self.status = Status::Disposed;
        self.topics.clear();
        effects.push(Effect::Status(Status::Disposed));
        effects
    }

    fn set_credential(&mut self, url: &str, token: &str, fingerprint: String) {
        self.url = Some(url.to_string());
        self.credential = Some(token.to_string());
        self.fingerprint = Some(fingerprint);
    }

    fn dial(&mut self) -> Vec<Effect> {
        let (url, token) = match (&self.url, &self.credential) {
            (Some(url), Some(token)) => (url, token),
            _ => return Vec::new(),
        };
        let target = connect_url(url, token);
        self.conn += 1;
        self.status = Status::Connecting;
        vec![
            Effect::Status(Status::Connecting),
            Effect::Dial { conn: self.conn, url: target },
        ]
    }
}
