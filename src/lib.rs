//! A client for a streaming chat-channel protocol: a framed multi-stream
//! request/response connection tunneled over a single WebSocket, with
//! bearer-token refresh, startup-gated inbound delivery, attachment
//! upload, and bounded, jittered reconnection.
//!
//! [`DirectLineClient`] is the entry point. Construct one with a
//! [`ClientConfig`], subscribe to [`DirectLineClient::activity_stream`]
//! (this triggers the initial handshake), and post activities with
//! [`DirectLineClient::post_activity`].

pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod http;
pub mod inbound;
pub mod logging;
pub mod model;
pub mod outbound;
pub mod refresher;
pub mod state;
pub mod transport;

pub use client::DirectLineClient;
pub use config::ClientConfig;
pub use error::{ClientError, ConfigError, SendError, TransportError};
pub use model::{
    Activity, ActivityEvent, Attachment, AuthState, ConnectionStatus, ConversationCredentials,
};
