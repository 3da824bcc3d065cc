//! WebSocket implementation of [`Transport`], framing a multi-stream
//! request/response protocol over a single duplex socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, trace, warn};

use crate::error::{TransportError, TransportResult};
use crate::model::{ContentStream, StreamRequest, StreamResponse};
use crate::transport::{DisconnectCallback, InboundRequestHandler, Transport, TransportHandlers};

const SEND_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Serialize, Deserialize)]
struct WireStream {
    content_type: String,
    data_b64: String,
}

impl From<&ContentStream> for WireStream {
    fn from(s: &ContentStream) -> Self {
        Self {
            content_type: s.content_type.clone(),
            data_b64: BASE64.encode(&s.data),
        }
    }
}

impl WireStream {
    fn into_content_stream(self) -> Result<ContentStream, TransportError> {
        let data = BASE64
            .decode(self.data_b64)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        Ok(ContentStream {
            content_type: self.content_type,
            data,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Envelope {
    Request {
        id: u64,
        method: String,
        path: String,
        streams: Vec<WireStream>,
    },
    Response {
        id: u64,
        status_code: u16,
        streams: Vec<WireStream>,
    },
}

/// A single duplex WebSocket connection carrying both our outbound requests
/// and the server's inbound pushes, correlated by request id.
///
/// Correlation mirrors the echo-tagged pending-call map pattern used to
/// match async API responses to their callers: every outbound request gets
/// a fresh id and a `oneshot` registered in `pending` before it is written
/// to the socket; the reader task resolves that oneshot when a matching
/// response frame arrives.
pub struct WsTransport {
    url: String,
    inbound: Arc<dyn InboundRequestHandler>,
    on_disconnect: Arc<dyn DisconnectCallback>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<StreamResponse>>>>,
    next_id: AtomicU64,
    outgoing: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    disconnect_fired: Arc<AtomicBool>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, handlers: TransportHandlers) -> Self {
        Self {
            url: url.into(),
            inbound: handlers.inbound,
            on_disconnect: handlers.on_disconnect,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            outgoing: Mutex::new(None),
            disconnect_fired: Arc::new(AtomicBool::new(false)),
        }
    }

    fn fire_disconnect(
        on_disconnect: Arc<dyn DisconnectCallback>,
        fired: Arc<AtomicBool>,
        pending: Arc<Mutex<HashMap<u64, oneshot::Sender<StreamResponse>>>>,
    ) {
        if fired.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return;
        }
        tokio::spawn(async move {
            pending.lock().await.clear();
            on_disconnect.on_disconnect().await;
        });
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> TransportResult<()> {
        let (ws_stream, _response) = connect_async(&self.url)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        debug!(url = %self.url, "websocket connected");

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        *self.outgoing.lock().await = Some(tx.clone());

        let pending = self.pending.clone();
        let inbound = self.inbound.clone();
        let on_disconnect = self.on_disconnect.clone();
        let disconnect_fired = self.disconnect_fired.clone();
        let writer_tx = tx.clone();

        tokio::spawn(async move { while let Some(msg) = rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }});

        tokio::spawn(async move {
            loop {
                match read.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        trace!(bytes = text.len(), "inbound frame");
                        if let Err(e) =
                            handle_frame(&text, &pending, inbound.as_ref(), &writer_tx).await
                        {
                            warn!(error = %e, "failed to handle inbound frame");
                        }
                    }
                    Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!("websocket closed by peer");
                        break;
                    }
                    Some(Ok(WsMessage::Binary(_))) | Some(Ok(WsMessage::Frame(_))) => continue,
                    Some(Err(e)) => {
                        error!(error = %e, "websocket read error");
                        break;
                    }
                }
            }
            WsTransport::fire_disconnect(on_disconnect, disconnect_fired, pending);
        });

        Ok(())
    }

    async fn send(&self, request: StreamRequest) -> TransportResult<StreamResponse> {
        let outgoing = self.outgoing.lock().await.clone().ok_or(TransportError::Closed)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(request.id, reply_tx);

        let envelope = Envelope::Request {
            id: request.id,
            method: request.method,
            path: request.path,
            streams: request.streams.iter().map(WireStream::from).collect(),
        };
        let text = serde_json::to_string(&envelope)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        if outgoing.send(WsMessage::Text(text.into())).is_err() {
            self.pending.lock().await.remove(&request.id);
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(SEND_TIMEOUT, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&request.id);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn disconnect(&self) {
        if let Some(tx) = self.outgoing.lock().await.take() {
            let _ = tx.send(WsMessage::Close(None));
        }
        WsTransport::fire_disconnect(
            self.on_disconnect.clone(),
            self.disconnect_fired.clone(),
            self.pending.clone(),
        );
    }
}

impl WsTransport {
    pub fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

async fn handle_frame(
    text: &str,
    pending: &Mutex<HashMap<u64, oneshot::Sender<StreamResponse>>>,
    inbound: &dyn InboundRequestHandler,
    writer_tx: &mpsc::UnboundedSender<WsMessage>,
) -> Result<(), TransportError> {

    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| TransportError::Malformed(e.to_string()))?;

    match envelope {
        Envelope::Response { id, status_code, streams } => {
            let streams = streams
                .into_iter()
                .map(WireStream::into_content_stream)
                .collect::<Result<Vec<_>, _>>()?;
            if let Some(sender) = pending.lock().await.remove(&id) {
                let _ = sender.send(StreamResponse { id, status_code, streams });
            }
            Ok(())
        }
        Envelope::Request { id, method, path, streams } => {
            let streams = streams
                .into_iter()
                .map(WireStream::into_content_stream)
                .collect::<Result<Vec<_>, _>>()?;
            let request = StreamRequest { id, method, path, streams };
            let response = inbound.handle_request(request).await;
            let out = Envelope::Response {
                id: response.id,
                status_code: response.status_code,
                streams: response.streams.iter().map(WireStream::from).collect(),
            };
            let text = serde_json::to_string(&out).map_err(|e| TransportError::Malformed(e.to_string()))?;
            let _ = writer_tx.send(WsMessage::Text(text.into()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StreamResponse;

    struct EchoInbound;

    #[async_trait]
    impl InboundRequestHandler for EchoInbound {
        async fn handle_request(&self, request: StreamRequest) -> StreamResponse {
            StreamResponse::ok(request.id, request.streams)
        }
    }

    #[test]
    fn wire_stream_round_trips_arbitrary_bytes() {
        let stream = ContentStream { content_type: "application/pdf".into(), data: vec![0, 159, 146, 150] };
        let wire = WireStream::from(&stream);
        let back = wire.into_content_stream().unwrap();
        assert_eq!(back.content_type, "application/pdf");
        assert_eq!(back.data, vec![0, 159, 146, 150]);
    }

    #[tokio::test]
    async fn handle_frame_resolves_pending_response_by_id() {
        let pending = Mutex::new(HashMap::new());
        let (reply_tx, reply_rx) = oneshot::channel();
        pending.lock().await.insert(7, reply_tx);
        let (writer_tx, _writer_rx) = mpsc::unbounded_channel();

        let envelope = Envelope::Response {
            id: 7,
            status_code: 200,
            streams: vec![WireStream::from(&ContentStream::json(&serde_json::json!({"Id": "abc"})))],
        };
        let text = serde_json::to_string(&envelope).unwrap();

        handle_frame(&text, &pending, &EchoInbound, &writer_tx).await.unwrap();

        let response = reply_rx.await.unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.streams.len(), 1);
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn handle_frame_routes_inbound_request_to_handler_and_writes_response() {
        let pending = Mutex::new(HashMap::new());
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel();

        let envelope = Envelope::Request {
            id: 42,
            method: "POST".into(),
            path: "/".into(),
            streams: vec![WireStream::from(&ContentStream::json(&serde_json::json!({"hello": "world"})))],
        };
        let text = serde_json::to_string(&envelope).unwrap();

        handle_frame(&text, &pending, &EchoInbound, &writer_tx).await.unwrap();

        let sent = writer_rx.recv().await.unwrap();
        let WsMessage::Text(sent_text) = sent else { panic!("expected a text frame") };
        let reply: Envelope = serde_json::from_str(&sent_text).unwrap();
        match reply {
            Envelope::Response { id, status_code, streams } => {
                assert_eq!(id, 42);
                assert_eq!(status_code, 200);
                assert_eq!(streams.len(), 1);
            }
            other => panic!("expected a response envelope, got a request: {other:?}"),
        }
    }

    #[test]
    fn malformed_frame_is_reported_as_an_error() {
        let decoded = WireStream { content_type: "x".into(), data_b64: "not-base64!!".into() }
            .into_content_stream();
        assert!(matches!(decoded, Err(TransportError::Malformed(_))));
    }
}
