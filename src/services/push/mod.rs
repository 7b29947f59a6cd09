use crate::config::{ApnsConfig, DispatcherConfig};
use crate::domain::push::{
    DeliveryPriority, INCOMING_MESSAGE_COLLAPSE_ID, NotificationType, ProviderResponse, PushNotification, PushType,
    SendPushNotificationResult, TokenType, WireMessage, max_expiration,
};
use crate::error::{DispatchError, Result};
use opentelemetry::{KeyValue, global, metrics::Counter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

pub mod executor;
pub mod transport;

pub use executor::CompletionExecutor;
pub use transport::{PushTransport, TransportError};

pub const VOIP_NOTIFICATION_PAYLOAD: &str = r#"{"aps":{"sound":"default","alert":{"loc-key":"APN_Message"}}}"#;
pub const NSE_NOTIFICATION_PAYLOAD: &str = r#"{"aps":{"mutable-content":1,"alert":{"loc-key":"APN_Message"}}}"#;

const CHALLENGE_PAYLOAD_PREFIX: &str = r#"{"aps":{"sound":"default","alert":{"loc-key":"APN_Message"}},"#;
const VOIP_TOPIC_SUFFIX: &str = ".voip";

#[derive(Clone, Debug)]
struct Metrics {
    sent: Counter<u64>,
    rejected: Counter<u64>,
    invalidated_tokens: Counter<u64>,
    errors: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("apns-dispatcher");
        Self {
            sent: meter
                .u64_counter("push_sent_total")
                .with_description("Total number of push notifications accepted by the provider")
                .build(),
            rejected: meter
                .u64_counter("push_rejected_total")
                .with_description("Total number of push notifications rejected by the provider")
                .build(),
            invalidated_tokens: meter
                .u64_counter("push_invalidated_tokens_total")
                .with_description("Total number of rejections reporting an unregistered device token")
                .build(),
            errors: meter
                .u64_counter("push_errors_total")
                .with_description("Total number of push notifications that failed before the provider answered")
                .build(),
        }
    }
}

/// Composes provider messages for push notifications and reports how each delivery went.
#[derive(Debug)]
pub struct PushDispatcher {
    bundle_id: String,
    transport: Arc<dyn PushTransport>,
    /// Runtime the provider exchanges run on.
    io: Handle,
    submissions: TaskTracker,
    executor: CompletionExecutor,
    shutdown_timeout: Duration,
    closed: AtomicBool,
    shutdown: OnceCell<()>,
    metrics: Metrics,
}

impl PushDispatcher {
    /// Submissions run on the runtime this is called from; interpretation runs on `executor`.
    ///
    /// # Panics
    /// Panics when called outside of a tokio runtime.
    pub fn new(
        bundle_id: impl Into<String>,
        transport: Arc<dyn PushTransport>,
        executor: CompletionExecutor,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            bundle_id: bundle_id.into(),
            transport,
            io: Handle::current(),
            submissions: TaskTracker::new(),
            executor,
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            closed: AtomicBool::new(false),
            shutdown: OnceCell::new(),
            metrics: Metrics::new(),
        }
    }

    /// Wires a dispatcher to APNs on the current runtime.
    ///
    /// # Errors
    /// Returns an error if the signing key cannot be loaded or the HTTP client cannot be built.
    ///
    /// # Panics
    /// Panics when called outside of a tokio runtime.
    pub fn from_config(apns: &ApnsConfig, config: &DispatcherConfig) -> anyhow::Result<Self> {
        let transport = crate::adapters::push::apns::ApnsTransport::new(apns)?;
        let executor = CompletionExecutor::current(config.worker_concurrency);
        Ok(Self::new(apns.bundle_id.clone(), Arc::new(transport), executor, config))
    }

    pub fn start(&self) {
        tracing::info!(bundle_id = %self.bundle_id, "Push dispatcher ready");
    }

    /// Stops accepting sends, drains in-flight deliveries and closes the transport.
    ///
    /// Deliveries still running after the shutdown timeout fail once the transport closes.
    /// Every caller returns only after the transport has closed.
    pub async fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.get_or_init(|| self.shutdown_once()).await;
    }

    async fn shutdown_once(&self) {
        tracing::info!(in_flight = self.submissions.len(), "Push dispatcher shutting down...");
        self.submissions.close();
        self.executor.close();

        tokio::select! {
            () = async {
                self.submissions.wait().await;
                self.executor.wait().await;
            } => {
                tracing::info!("In-flight push deliveries finished.");
            }
            () = tokio::time::sleep(self.shutdown_timeout) => {
                tracing::warn!(in_flight = self.submissions.len(), "Timeout waiting for in-flight push deliveries.");
            }
        }

        self.transport.close().await;
        tracing::info!("Push transport closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Submits a notification and returns a handle that resolves with the provider's verdict.
    ///
    /// Nothing is submitted when the notification cannot be composed or the dispatcher is stopped.
    ///
    /// # Errors
    /// Returns `DispatchError::Closed` after `stop`, and a contract violation error for
    /// unsupported token types or challenges without data.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(token = %notification.token_prefix(), token_type = %notification.token_type, notification_type = %notification.notification_type),
        err
    )]
    pub fn send(&self, notification: &PushNotification) -> Result<PendingDelivery> {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }

        let message = self.compose(notification)?;
        let transport = Arc::clone(&self.transport);
        let executor = self.executor.clone();
        let metrics = self.metrics.clone();
        let span = tracing::debug_span!("dispatch_push", token = %notification.token_prefix());

        // The exchange itself is not bounded by the executor; only interpretation waits for a worker.
        let handle = self.submissions.spawn_on(
            async move {
                let response = transport.submit(message).await.inspect_err(|e| {
                    tracing::warn!(error = %e, "Push transport failed, delivery outcome unknown");
                    metrics.errors.add(1, &[KeyValue::new("reason", "transport")]);
                })?;
                let interpretation = executor.spawn(async move { interpret(&response, &metrics) }.in_current_span());
                Ok::<_, DispatchError>(interpretation.await?)
            }
            .instrument(span),
            &self.io,
        );

        Ok(PendingDelivery { handle })
    }

    /// Builds the provider message for a notification without submitting it.
    ///
    /// # Errors
    /// Returns `DispatchError::UnsupportedTokenType` for non-APNs tokens and
    /// `DispatchError::MissingChallengeData` for challenges without a challenge token.
    pub fn compose(&self, notification: &PushNotification) -> Result<WireMessage> {
        let topic = match notification.token_type {
            TokenType::Apn => self.bundle_id.clone(),
            TokenType::ApnVoip => format!("{}{VOIP_TOPIC_SUFFIX}", self.bundle_id),
            other @ TokenType::Fcm => return Err(DispatchError::UnsupportedTokenType(other)),
        };

        let is_voip = notification.token_type == TokenType::ApnVoip;

        let payload = match (notification.notification_type, is_voip) {
            (NotificationType::Notification, true) => VOIP_NOTIFICATION_PAYLOAD.to_string(),
            (NotificationType::Notification, false) => NSE_NOTIFICATION_PAYLOAD.to_string(),
            (kind @ NotificationType::Challenge, _) => challenge_payload("challenge", kind, notification.data.as_deref())?,
            (kind @ NotificationType::RateLimitChallenge, _) => {
                challenge_payload("rateLimitChallenge", kind, notification.data.as_deref())?
            }
        };

        let collapse_id = (notification.notification_type == NotificationType::Notification && !is_voip)
            .then(|| INCOMING_MESSAGE_COLLAPSE_ID.to_string());

        Ok(WireMessage {
            device_token: notification.device_token.clone(),
            topic,
            payload,
            expiration: max_expiration(),
            priority: DeliveryPriority::Immediate,
            push_type: if is_voip { PushType::Voip } else { PushType::Alert },
            collapse_id,
        })
    }
}

fn challenge_payload(field: &str, kind: NotificationType, data: Option<&str>) -> Result<String> {
    let data = data.ok_or(DispatchError::MissingChallengeData(kind))?;
    // Serializing a str cannot fail.
    let encoded = serde_json::to_string(data).unwrap_or_default();
    Ok(format!(r#"{CHALLENGE_PAYLOAD_PREFIX}"{field}":{encoded}}}"#))
}

fn interpret(response: &ProviderResponse, metrics: &Metrics) -> SendPushNotificationResult {
    let result = SendPushNotificationResult::from_response(response);

    if result.accepted {
        tracing::debug!(apns_id = ?response.apns_id(), "Push notification accepted");
        metrics.sent.add(1, &[]);
    } else {
        let reason = result.rejection_reason.clone().unwrap_or_default();
        metrics.rejected.add(1, &[KeyValue::new("reason", reason.clone())]);
        if result.unregistered {
            tracing::info!(reason = %reason, "Device token unregistered");
            metrics.invalidated_tokens.add(1, &[]);
        } else {
            tracing::warn!(reason = %reason, apns_id = ?response.apns_id(), "Push notification rejected");
        }
    }

    result
}

/// Resolves with the outcome of one submitted notification.
#[derive(Debug)]
pub struct PendingDelivery {
    handle: JoinHandle<Result<SendPushNotificationResult>>,
}

impl Future for PendingDelivery {
    type Output = Result<SendPushNotificationResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| joined.map_err(DispatchError::from).and_then(|res| res))
    }
}
