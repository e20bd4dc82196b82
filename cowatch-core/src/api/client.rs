//! HTTP clients for the room directory and auth services

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, warn};

use super::types::*;
use super::{ApiError, AuthVerifier, RoomService};

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared HTTP plumbing for one service base URL
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    api_token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(CONNECTION_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: None,
        })
    }

    /// Bearer token sent with every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.request(method, &url);

        if let Some(token) = &self.api_token {
            req = req.bearer_auth(token);
        }

        req
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        req.send().await.map_err(|e| {
            warn!("Request to {} failed: {:?}", self.base_url, e);
            if e.is_connect() || e.is_timeout() {
                ApiError::NotReachable
            } else {
                ApiError::Http(e)
            }
        })
    }
}

fn unexpected(status: StatusCode) -> ApiError {
    ApiError::Api(format!("Unexpected response (HTTP {})", status.as_u16()))
}

/// Room directory backed by `GET {base}/rooms/{id}` and
/// `GET {base}/rooms/{id}/participants`
#[derive(Debug, Clone)]
pub struct HttpRoomService {
    client: ApiClient,
}

impl HttpRoomService {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RoomService for HttpRoomService {
    #[instrument(skip(self), fields(base_url = %self.client.base_url()))]
    async fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>, ApiError> {
        let resp = self
            .client
            .send(self.client.request(reqwest::Method::GET, &format!("/rooms/{}", room_id)))
            .await?;
        debug!("Response status: {}", resp.status());

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiError::Unauthorized),
            s if s.is_success() => Ok(Some(resp.json().await?)),
            s => Err(unexpected(s)),
        }
    }

    async fn get_participants(&self, room_id: &str) -> Result<Vec<ParticipantRecord>, ApiError> {
        let resp = self
            .client
            .send(self.client.request(
                reqwest::Method::GET,
                &format!("/rooms/{}/participants", room_id),
            ))
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiError::Unauthorized),
            s if s.is_success() => Ok(resp.json().await?),
            s => Err(unexpected(s)),
        }
    }
}

/// Token verification via `POST {base}/auth/verify`
#[derive(Debug, Clone)]
pub struct HttpAuthVerifier {
    client: ApiClient,
}

impl HttpAuthVerifier {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AuthVerifier for HttpAuthVerifier {
    async fn verify_token(&self, token: &str) -> Result<String, ApiError> {
        let resp = self
            .client
            .send(
                self.client
                    .request(reqwest::Method::POST, "/auth/verify")
                    .json(&VerifyRequest { token }),
            )
            .await?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiError::Unauthorized),
            s if s.is_success() => {
                let body: VerifyResponse = resp.json().await?;
                Ok(body.user_id)
            }
            s => Err(unexpected(s)),
        }
    }
}

/// Development verifier: the token is the user id
#[derive(Debug, Clone, Copy, Default)]
pub struct InsecureTokenVerifier;

#[async_trait]
impl AuthVerifier for InsecureTokenVerifier {
    async fn verify_token(&self, token: &str) -> Result<String, ApiError> {
        let user_id = token.trim();
        if user_id.is_empty() {
            return Err(ApiError::Unauthorized);
        }
        Ok(user_id.to_string())
    }
}
