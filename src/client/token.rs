use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use log::{info, warn, debug};

use crate::client::broker::{MultiplexerHandle, ReconnectNotice};
use crate::client::http::{ClientError, Credential, CredentialSource};

/// Receives rotated credentials.
pub trait TokenTarget: Send + Sync {
    fn update_token(&self, url: &str, token: &str);
}

impl TokenTarget for MultiplexerHandle {
    fn update_token(&self, url: &str, token: &str) {
        MultiplexerHandle::update_token(self, url, token);
    }
}

/// Keeps the multiplexer supplied with a valid credential: on a fixed period
/// shorter than the token lifetime, and on demand before every reconnect.
pub struct TokenLifecycleCoordinator {
    source: Arc<dyn CredentialSource>,
    target: Arc<dyn TokenTarget>,
    refresh_interval: Duration,
    current: watch::Sender<Option<Credential>>,
}

impl TokenLifecycleCoordinator {
    pub fn new(source: Arc<dyn CredentialSource>, target: Arc<dyn TokenTarget>, refresh_interval: Duration) -> Self {
        Self {
            source,
            target,
            refresh_interval,
            current: watch::channel(None).0,
        }
    }

    /// Latest credential, for collaborators that authenticate out of band.
    pub fn credentials(&self) -> watch::Receiver<Option<Credential>> {
        self.current.subscribe()
    }

    /// Fetches a credential without pushing it to the multiplexer. Used to
    /// make the very first connection.
    pub async fn fetch_initial(&self) -> Result<Credential, ClientError> {
        let credential = self.source.fetch().await?;
        self.current.send_replace(Some(credential.clone()));
        Ok(credential)
    }

    /// Fetches and hands a fresh credential to the multiplexer. A failure
    /// leaves the previous credential in place.
    pub async fn refresh_once(&self) -> bool {
        match self.source.fetch().await {
            Ok(credential) => {
                self.target.update_token(&credential.ws_url, &credential.token);
                debug!("Credential rotated, expires at {}", credential.expires_at);
                self.current.send_replace(Some(credential));
                true
            }
            Err(e) => {
                warn!("Credential refresh failed, retrying next cycle: {}", e);
                false
            }
        }
    }

    pub async fn run(self, mut notices: mpsc::Receiver<ReconnectNotice>, mut shutdown: watch::Receiver<bool>) {
        let mut timer = interval(self.refresh_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        timer.tick().await;
        info!("Token coordinator refreshing every {:?}", self.refresh_interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Token coordinator shutting down");
                    break;
                }
                _ = timer.tick() => {
                    self.refresh_once().await;
                }
                Some(notice) = notices.recv() => {
                    debug!("Reconnect pending, fetching a fresh credential");
                    self.refresh_once().await;
                    let _ = notice.ack.send(());
                }
            }
        }
    }
}
