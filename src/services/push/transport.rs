use crate::domain::push::{ProviderResponse, WireMessage};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request to push provider failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Transport is closed")]
    Closed,
    #[error("Invalid push credentials: {0}")]
    Credentials(String),
    #[error("External service error: {0}")]
    Other(#[from] anyhow::Error),
}

/// A long-lived, shared connection to the push provider.
#[async_trait]
pub trait PushTransport: Send + Sync + std::fmt::Debug {
    /// Submits one message and resolves with the provider's verdict.
    ///
    /// # Errors
    /// Returns a `TransportError` when the provider could not be reached or the
    /// exchange failed before the provider answered. A provider rejection is an
    /// `Ok` response, not an error.
    async fn submit(&self, message: WireMessage) -> Result<ProviderResponse, TransportError>;

    /// Waits for in-flight submissions to finish, then releases the underlying connection.
    /// Submissions made afterwards fail with `TransportError::Closed`.
    async fn close(&self);
}
