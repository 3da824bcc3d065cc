//! Layered error types for the transport, client, and configuration surfaces.

use thiserror::Error;

/// Errors raised by the framed transport connection itself.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to establish connection: {0}")]
    ConnectFailed(String),

    #[error("connection closed")]
    Closed,

    #[error("request timed out")]
    Timeout,

    #[error("server returned status {status}: {body}")]
    BadStatus { status: u16, body: String },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("io error: {0}")]
    Io(String),
}

/// Errors surfaced on the public activity stream.
#[derive(Debug, Error, Clone)]
pub enum ClientError {
    #[error("server sent an activity set with {count} activities, expected exactly 1")]
    MalformedActivitySet { count: usize },

    #[error("bearer token could not be refreshed and no further retries remain")]
    TokenUnavailable,

    #[error("reconnection attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },

    #[error("connection ended")]
    Ended,

    #[error("could not construct connection url: {0}")]
    InvalidUrl(String),
}

/// Errors returned from a single outbound send.
#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to fetch attachment bytes: {0}")]
    AttachmentFetch(String),

    #[error("server response did not include an activity id")]
    MissingId,

    #[error("client has ended")]
    Ended,
}

/// Errors raised while validating or constructing a [`crate::config::ClientConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type TransportResult<T> = Result<T, TransportError>;
pub type SendResult<T> = Result<T, SendError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
