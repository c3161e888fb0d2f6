use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use log::debug;

use crate::api::{API_KEY_HEADER, QuoteResponse, TokenResponse};
use crate::data::Ohlcv;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("no credential available yet")]
    NoCredential,
    #[error("backfill timed out")]
    Timeout,
}

/// A signed access token plus where to use it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub ws_url: String,
    pub expires_at: i64,
}

impl From<TokenResponse> for Credential {
    fn from(response: TokenResponse) -> Self {
        Self {
            token: response.token,
            ws_url: response.ws_url,
            expires_at: response.expires_at,
        }
    }
}

/// The identity boundary.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<Credential, ClientError>;
}

/// Secondary request-response source of the last known bar.
#[async_trait]
pub trait BackfillSource: Send + Sync {
    /// `Ok(None)` when the source has nothing for the symbol.
    async fn fetch_bar(&self, symbol: &str) -> Result<Option<Ohlcv>, ClientError>;
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status { status: status.as_u16(), body })
}

#[derive(Serialize)]
struct TokenRequestBody<'a> {
    user_id: &'a str,
}

/// Calls `POST /api/token` with the shared API key.
pub struct HttpCredentialSource {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    user_id: String,
}

impl HttpCredentialSource {
    pub fn new(client: reqwest::Client, api_url: &str, api_key: &str, user_id: &str) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            user_id: user_id.to_string(),
        }
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(&self) -> Result<Credential, ClientError> {
        let response = self.client
            .post(format!("{}/api/token", self.api_url))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&TokenRequestBody { user_id: &self.user_id })
            .send()
            .await?;
        let token: TokenResponse = check_status(response).await?.json().await?;
        debug!("Fetched credential expiring at {}", token.expires_at);
        Ok(token.into())
    }
}

/// Calls `GET /api/quote/:symbol`, authenticated with the current credential.
pub struct HttpBackfillSource {
    client: reqwest::Client,
    api_url: String,
    credential: watch::Receiver<Option<Credential>>,
}

impl HttpBackfillSource {
    pub fn new(client: reqwest::Client, api_url: &str, credential: watch::Receiver<Option<Credential>>) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            credential,
        }
    }
}

#[async_trait]
impl BackfillSource for HttpBackfillSource {
    async fn fetch_bar(&self, symbol: &str) -> Result<Option<Ohlcv>, ClientError> {
        let token = self.credential
            .borrow()
            .as_ref()
            .map(|c| c.token.clone())
            .ok_or(ClientError::NoCredential)?;

        let response = self.client
            .get(format!("{}/api/quote/{}", self.api_url, urlencoding::encode(symbol)))
            .bearer_auth(token)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let quote: QuoteResponse = check_status(response).await?.json().await?;
        Ok(Some(quote.data))
    }
}
