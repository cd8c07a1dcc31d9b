use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("signing key rejected: {0}")]
    Key(#[from] jsonwebtoken::errors::Error),
    #[error("signer unavailable: {0}")]
    Unavailable(String),
    #[error("token encoding failed: {0}")]
    Encoding(String),
    #[error("token serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("session open failed: {0}")]
    Connect(String),
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("publish rejected: {0}")]
    Publish(String),
    #[error("no open session")]
    NotConnected,
    #[error("session close failed: {0}")]
    Close(String),
}

/// Why a connect attempt failed. Never crosses the connection manager boundary;
/// it is logged and folded into the reconnect path.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("token issuance failed: {0}")]
    Signing(#[from] SigningError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
