use crate::domain::push::{NotificationType, TokenType};
use crate::services::push::TransportError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Unsupported token type: {0}")]
    UnsupportedTokenType(TokenType),
    #[error("Missing challenge data for {0} notification")]
    MissingChallengeData(NotificationType),
    #[error("Dispatcher is stopped")]
    Closed,
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("Delivery task interrupted: {0}")]
    Interrupted(#[from] tokio::task::JoinError),
}

impl DispatchError {
    /// Whether the same notification may succeed if sent again later.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Interrupted(_))
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
