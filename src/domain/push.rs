use std::fmt;
use time::{Duration, OffsetDateTime};

/// Reasons APNs returns when a device token is permanently invalid.
pub const UNREGISTERED_REASONS: [&str; 2] = ["Unregistered", "BadDeviceToken"];

/// Reason recorded when the provider rejects without saying why.
pub const UNKNOWN_REJECTION_REASON: &str = "unknown";

/// Collapse id attached to plain wake notifications so APNs keeps only the latest one.
pub const INCOMING_MESSAGE_COLLAPSE_ID: &str = "incoming-message";

/// Seconds since the Unix epoch of the expiration sent with every notification (`i32::MAX`).
pub const MAX_EXPIRATION_SECS: i64 = 2_147_483_647;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    Apn,
    ApnVoip,
    Fcm,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Apn => "apn",
            Self::ApnVoip => "apn_voip",
            Self::Fcm => "fcm",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationType {
    /// Wakes the client so it fetches queued messages.
    Notification,
    Challenge,
    RateLimitChallenge,
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Notification => "notification",
            Self::Challenge => "challenge",
            Self::RateLimitChallenge => "rate_limit_challenge",
        };
        f.write_str(name)
    }
}

/// A request to notify one device, built by the caller for a single send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNotification {
    pub device_token: String,
    pub token_type: TokenType,
    pub notification_type: NotificationType,
    pub data: Option<String>,
}

impl PushNotification {
    pub fn wakeup(device_token: impl Into<String>, token_type: TokenType) -> Self {
        Self {
            device_token: device_token.into(),
            token_type,
            notification_type: NotificationType::Notification,
            data: None,
        }
    }

    pub fn challenge(device_token: impl Into<String>, token_type: TokenType, challenge: impl Into<String>) -> Self {
        Self {
            device_token: device_token.into(),
            token_type,
            notification_type: NotificationType::Challenge,
            data: Some(challenge.into()),
        }
    }

    pub fn rate_limit_challenge(
        device_token: impl Into<String>,
        token_type: TokenType,
        challenge: impl Into<String>,
    ) -> Self {
        Self {
            device_token: device_token.into(),
            token_type,
            notification_type: NotificationType::RateLimitChallenge,
            data: Some(challenge.into()),
        }
    }

    /// First characters of the device token, safe to put in logs.
    pub fn token_prefix(&self) -> &str {
        token_prefix(&self.device_token)
    }
}

pub(crate) fn token_prefix(token: &str) -> &str {
    token.char_indices().nth(8).map_or(token, |(idx, _)| &token[..idx])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPriority {
    /// Deliver right away (APNs priority 10).
    Immediate,
    /// Deliver when convenient for the device's power state (APNs priority 5).
    Conserve,
}

impl DeliveryPriority {
    pub const fn code(self) -> u8 {
        match self {
            Self::Immediate => 10,
            Self::Conserve => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushType {
    Alert,
    Voip,
}

impl PushType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Alert => "alert",
            Self::Voip => "voip",
        }
    }
}

/// The provider-specific message for one in-flight submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub device_token: String,
    pub topic: String,
    pub payload: String,
    pub expiration: OffsetDateTime,
    pub priority: DeliveryPriority,
    pub push_type: PushType,
    pub collapse_id: Option<String>,
}

/// Far-future expiration so the provider keeps retrying delivery until it gives up on its own.
pub fn max_expiration() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH.saturating_add(Duration::seconds(MAX_EXPIRATION_SECS))
}

/// What the push provider said about one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResponse {
    accepted: bool,
    rejection_reason: Option<String>,
    apns_id: Option<String>,
}

impl ProviderResponse {
    pub const fn accepted() -> Self {
        Self { accepted: true, rejection_reason: None, apns_id: None }
    }

    pub const fn rejected(reason: Option<String>) -> Self {
        Self { accepted: false, rejection_reason: reason, apns_id: None }
    }

    #[must_use]
    pub fn with_apns_id(mut self, apns_id: Option<String>) -> Self {
        self.apns_id = apns_id;
        self
    }

    pub const fn is_accepted(&self) -> bool {
        self.accepted
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref()
    }

    pub fn apns_id(&self) -> Option<&str> {
        self.apns_id.as_deref()
    }
}

/// Normalized outcome of one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendPushNotificationResult {
    pub accepted: bool,
    pub rejection_reason: Option<String>,
    /// The token is permanently invalid and should be purged by the caller.
    pub unregistered: bool,
}

impl SendPushNotificationResult {
    pub fn from_response(response: &ProviderResponse) -> Self {
        if response.is_accepted() {
            return Self { accepted: true, rejection_reason: None, unregistered: false };
        }

        let reason = response.rejection_reason().unwrap_or(UNKNOWN_REJECTION_REASON);
        Self {
            accepted: false,
            unregistered: UNREGISTERED_REASONS.contains(&reason),
            rejection_reason: Some(reason.to_string()),
        }
    }
}
