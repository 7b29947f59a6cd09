use crate::config::ApnsConfig;
use crate::domain::push::{ProviderResponse, WireMessage, token_prefix};
use crate::services::push::{PushTransport, TransportError};
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// APNs refuses provider tokens older than an hour and throttles ones refreshed more often than every 20 minutes.
const PROVIDER_TOKEN_TTL: Duration = Duration::from_secs(50 * 60);

const PROVIDER_TOKEN_REASONS: [&str; 2] = ["ExpiredProviderToken", "InvalidProviderToken"];

#[derive(Debug, Serialize)]
struct ProviderClaims<'a> {
    iss: &'a str,
    iat: i64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    reason: Option<String>,
}

#[derive(Debug)]
struct CachedToken {
    token: String,
    issued_at: Instant,
}

/// Sends notifications to APNs over HTTP/2 using token-based authentication.
pub struct ApnsTransport {
    base_url: String,
    team_id: String,
    key_id: String,
    encoding_key: EncodingKey,
    client: RwLock<Option<reqwest::Client>>,
    cached_token: Mutex<Option<CachedToken>>,
    requests: TaskTracker,
}

impl std::fmt::Debug for ApnsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApnsTransport")
            .field("base_url", &self.base_url)
            .field("team_id", &self.team_id)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl ApnsTransport {
    /// Loads the signing key and builds the HTTP/2 client.
    ///
    /// # Errors
    /// Returns `TransportError::Credentials` if the signing key is missing or not an
    /// EC private key, and `TransportError::Request` if the client cannot be built.
    pub fn new(config: &ApnsConfig) -> Result<Self, TransportError> {
        let pem = config.signing_key_pem().map_err(|e| TransportError::Credentials(e.to_string()))?;
        let encoding_key = EncodingKey::from_ec_pem(&pem).map_err(|e| TransportError::Credentials(e.to_string()))?;

        let client = reqwest::Client::builder().http2_prior_knowledge().timeout(config.request_timeout()).build()?;

        tracing::info!(
            host = %config.host(),
            team_id = %config.team_id,
            key_id = %config.key_id,
            "APNs transport initialized"
        );

        Ok(Self {
            base_url: format!("https://{}", config.host()),
            team_id: config.team_id.clone(),
            key_id: config.key_id.clone(),
            encoding_key,
            client: RwLock::new(Some(client)),
            cached_token: Mutex::new(None),
            requests: TaskTracker::new(),
        })
    }

    /// Points the transport at another gateway, such as a local mock.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn client(&self) -> Result<reqwest::Client, TransportError> {
        self.client.read().unwrap_or_else(PoisonError::into_inner).clone().ok_or(TransportError::Closed)
    }

    fn provider_token(&self) -> Result<String, TransportError> {
        let mut cached = self.cached_token.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(token) = cached.as_ref()
            && token.issued_at.elapsed() < PROVIDER_TOKEN_TTL
        {
            return Ok(token.token.clone());
        }

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.key_id.clone());
        let claims = ProviderClaims { iss: &self.team_id, iat: OffsetDateTime::now_utc().unix_timestamp() };

        let token = jsonwebtoken::encode(&header, &claims, &self.encoding_key)
            .map_err(|e| TransportError::Credentials(e.to_string()))?;
        tracing::debug!(key_id = %self.key_id, "Generated APNs provider token");

        *cached = Some(CachedToken { token: token.clone(), issued_at: Instant::now() });
        Ok(token)
    }

    fn invalidate_provider_token(&self) {
        self.cached_token.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn build_request(&self, client: &reqwest::Client, message: &WireMessage) -> Result<reqwest::Request, TransportError> {
        let token = self.provider_token()?;

        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| anyhow::anyhow!("Invalid APNs base URL {}: {e}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|()| anyhow::anyhow!("APNs base URL {} cannot carry a path", self.base_url))?
            .pop_if_empty()
            .extend(["3", "device", &message.device_token]);

        let mut builder = client
            .post(url)
            .header(AUTHORIZATION, format!("bearer {token}"))
            .header("apns-id", Uuid::new_v4().to_string())
            .header("apns-topic", &message.topic)
            .header("apns-push-type", message.push_type.as_str())
            .header("apns-priority", message.priority.code().to_string())
            .header("apns-expiration", message.expiration.unix_timestamp().to_string())
            .header(CONTENT_TYPE, "application/json")
            .body(message.payload.clone());

        if let Some(collapse_id) = &message.collapse_id {
            builder = builder.header("apns-collapse-id", collapse_id);
        }

        Ok(builder.build()?)
    }
}

fn rejection_reason(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<ErrorBody>(body).ok().and_then(|b| b.reason)
}

#[async_trait]
impl PushTransport for ApnsTransport {
    #[tracing::instrument(level = "debug", skip_all, fields(token = %token_prefix(&message.device_token), topic = %message.topic))]
    async fn submit(&self, message: WireMessage) -> Result<ProviderResponse, TransportError> {
        // Taken before the client so that close waits for this exchange.
        let _in_flight = self.requests.token();
        let client = self.client()?;
        let request = self.build_request(&client, &message)?;

        let response = client.execute(request).await?;
        let status = response.status();
        let apns_id = response.headers().get("apns-id").and_then(|v| v.to_str().ok()).map(String::from);

        if status.is_success() {
            tracing::debug!(status = status.as_u16(), apns_id = ?apns_id, "APNs accepted notification");
            return Ok(ProviderResponse::accepted().with_apns_id(apns_id));
        }

        // The provider has answered; a truncated body only loses the reason.
        let body = response.bytes().await.ok();
        let reason = body.as_deref().and_then(rejection_reason);
        tracing::debug!(status = status.as_u16(), reason = ?reason, "APNs rejected notification");

        if reason.as_deref().is_some_and(|r| PROVIDER_TOKEN_REASONS.contains(&r)) {
            tracing::warn!(reason = ?reason, "APNs refused provider token, regenerating");
            self.invalidate_provider_token();
        }

        Ok(ProviderResponse::rejected(reason).with_apns_id(apns_id))
    }

    async fn close(&self) {
        let client = self.client.write().unwrap_or_else(PoisonError::into_inner).take();
        self.requests.close();
        self.requests.wait().await;
        // Every clone of the client is gone now, so dropping this one tears the connection down.
        if client.is_some() {
            drop(client);
            tracing::info!(base_url = %self.base_url, "APNs connection released");
        }
    }
}
