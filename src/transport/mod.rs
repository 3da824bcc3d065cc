//! The framed multi-stream transport abstraction and its WebSocket implementation.

pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransportResult;
use crate::model::{StreamRequest, StreamResponse};

/// Handles a request the server pushed to us over the transport.
#[async_trait]
pub trait InboundRequestHandler: Send + Sync {
    async fn handle_request(&self, request: StreamRequest) -> StreamResponse;
}

/// Notified exactly once, asynchronously, when the transport goes down.
#[async_trait]
pub trait DisconnectCallback: Send + Sync {
    async fn on_disconnect(&self);
}

/// A connection carrying a multi-stream request/response protocol.
///
/// Implementations own a single duplex connection; both our outbound
/// requests and the server's inbound pushes are framed over it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> TransportResult<()>;

    async fn send(&self, request: StreamRequest) -> TransportResult<StreamResponse>;

    async fn disconnect(&self);
}

/// Shared constructor arguments every `Transport` implementation takes.
pub struct TransportHandlers {
    pub inbound: Arc<dyn InboundRequestHandler>,
    pub on_disconnect: Arc<dyn DisconnectCallback>,
}

/// Builds a fresh [`Transport`] per connection attempt. Swapped out in
/// tests for an in-memory implementation so the controller's state machine
/// can be exercised without a live socket.
pub trait TransportFactory: Send + Sync {
    fn create(&self, url: String, handlers: TransportHandlers) -> Arc<dyn Transport>;
}

pub struct WsTransportFactory;

impl TransportFactory for WsTransportFactory {
    fn create(&self, url: String, handlers: TransportHandlers) -> Arc<dyn Transport> {
        Arc::new(ws::WsTransport::new(url, handlers))
    }
}
