//! Owns the connection state machine: handshake, status publication,
//! startup-queue flush, and bounded reconnection with jittered backoff.
//!
//! Runs as a single task reading commands off an unbounded channel so every
//! mutation of connection-machine state happens on one task; the only
//! fields touched by other tasks (`AuthState`, the startup queue) are
//! wrapped in a `tokio::sync::Mutex` with short critical sections, the same
//! shape as the shared-state guards used elsewhere in this crate.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::inbound::InboundHandler;
use crate::model::{ActivityEvent, AuthState, ConnectionStatus, ConversationCredentials, StreamRequest};
use crate::state::StartupQueue;
use crate::transport::{DisconnectCallback, Transport, TransportFactory, TransportHandlers};

pub const MAX_RETRY_COUNT: u32 = 3;
const RECONNECT_DELAY_BASE_MS: u64 = 3000;
const RECONNECT_DELAY_JITTER_MS: u64 = 12000;

pub enum ControllerCommand {
    AttemptHandshake,
    Disconnected,
    Reconnect(ConversationCredentials),
    End,
}

struct ControllerDisconnectNotifier {
    cmd_tx: mpsc::UnboundedSender<ControllerCommand>,
}

#[async_trait::async_trait]
impl DisconnectCallback for ControllerDisconnectNotifier {
    async fn on_disconnect(&self) {
        let _ = self.cmd_tx.send(ControllerCommand::Disconnected);
    }
}

pub struct Controller {
    config: ClientConfig,
    transport_factory: Arc<dyn TransportFactory>,
    auth: Arc<Mutex<AuthState>>,
    conversation_id: Mutex<Option<String>>,
    status_tx: watch::Sender<ConnectionStatus>,
    activity_tx: broadcast::Sender<ActivityEvent>,
    queue: Arc<Mutex<StartupQueue>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    retry_count: Mutex<u32>,
    cmd_tx: mpsc::UnboundedSender<ControllerCommand>,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ClientConfig,
        transport_factory: Arc<dyn TransportFactory>,
        auth: Arc<Mutex<AuthState>>,
        status_tx: watch::Sender<ConnectionStatus>,
        activity_tx: broadcast::Sender<ActivityEvent>,
        cmd_tx: mpsc::UnboundedSender<ControllerCommand>,
    ) -> Arc<Self> {
        let conversation_id = config.conversation_id.clone();
        Arc::new(Self {
            config,
            transport_factory,
            auth,
            conversation_id: Mutex::new(conversation_id),
            status_tx,
            activity_tx,
            queue: Arc::new(Mutex::new(StartupQueue::new())),
            transport: Mutex::new(None),
            retry_count: Mutex::new(MAX_RETRY_COUNT),
            cmd_tx,
        })
    }

    pub fn queue(&self) -> Arc<Mutex<StartupQueue>> {
        self.queue.clone()
    }

    pub async fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().await.clone()
    }

    pub async fn current_conversation_id(&self) -> Option<String> {
        self.conversation_id.lock().await.clone()
    }

    fn publish_status(&self, status: ConnectionStatus) {
        let _ = self.status_tx.send(status);
    }

    fn publish_error(&self, error: ClientError) {
        let _ = self.activity_tx.send(ActivityEvent::Error(error));
    }

    /// Runs the controller's command loop until [`ControllerCommand::End`].
    pub async fn run(self: Arc<Self>, mut cmd_rx: mpsc::UnboundedReceiver<ControllerCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                ControllerCommand::AttemptHandshake => self.attempt_handshake().await,
                ControllerCommand::Disconnected => self.handle_disconnect().await,
                ControllerCommand::Reconnect(creds) => self.apply_reconnect(creds).await,
                ControllerCommand::End => {
                    self.do_end().await;
                    break;
                }
            }
        }
    }

    async fn websocket_url(&self) -> Result<String, ClientError> {
        let token = match &*self.auth.lock().await {
            AuthState::Token(t) => t.clone(),
            AuthState::Exhausted => return Err(ClientError::TokenUnavailable),
        };
        let conversation_id = self.conversation_id.lock().await.clone();

        let mut url = url::Url::parse(&self.config.domain)
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        let _ = url.set_scheme(scheme);
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ClientError::TokenUnavailable)?;
            segments.pop_if_empty().push("conversations").push("connect");
        }
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("token", &token);
            if let Some(id) = &conversation_id {
                pairs.append_pair("conversationId", id);
            }
        }
        Ok(url.to_string())
    }

    async fn attempt_handshake(self: &Arc<Self>) {
        self.queue.lock().await.start_queueing();

        let url = match self.websocket_url().await {
            Ok(u) => u,
            Err(e) => {
                self.publish_error(e);
                return;
            }
        };

        let notifier = Arc::new(ControllerDisconnectNotifier { cmd_tx: self.cmd_tx.clone() });
        let handler = Arc::new(InboundHandler::new(self.queue.clone(), self.activity_tx.clone()));
        let transport = self
            .transport_factory
            .create(url, TransportHandlers { inbound: handler, on_disconnect: notifier });

        if let Err(e) = transport.connect().await {
            warn!(error = %e, "handshake transport connect failed");
            // No live transport exists yet to invoke the disconnect callback
            // asynchronously, so the failure path is driven directly here
            // to avoid ever double-counting one failed attempt.
            self.handle_disconnect().await;
            return;
        }

        // The conversationId (if resuming) already rode along in the
        // connect URL's query string; the handshake body carries nothing.
        let request = StreamRequest {
            id: 1,
            method: "POST".into(),
            path: "/v3/directline/conversations".into(),
            streams: vec![],
        };

        match transport.send(request).await {
            Ok(resp) if resp.status_code == 200 && resp.streams.len() == 1 => {
                match resp.streams[0].as_json::<serde_json::Value>() {
                    Ok(v) => {
                        if let Some(id) = v.get("conversationId").and_then(|v| v.as_str()) {
                            *self.conversation_id.lock().await = Some(id.to_string());
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "could not parse handshake response");
                        transport.disconnect().await;
                        return;
                    }
                }
            }
            Ok(_) => {
                warn!("handshake response malformed");
                transport.disconnect().await;
                return;
            }
            Err(e) => {
                warn!(error = %e, "handshake send failed");
                transport.disconnect().await;
                return;
            }
        }

        *self.transport.lock().await = Some(transport);

        // Subscribed before the send so `changed()` observes *this*
        // publish: a receiver created after the send would already see
        // Online as its initial value and never unblock on `changed()`.
        let mut status_rx = self.status_tx.subscribe();
        self.publish_status(ConnectionStatus::Online);
        info!("connection online");

        // Give the runtime the scheduling tick it needs to deliver the
        // status change to existing subscribers before the flush proceeds.
        let _ = status_rx.changed().await;
        tokio::task::yield_now().await;

        let flushed = self.queue.lock().await.flush();
        for activity in flushed {
            let _ = self.activity_tx.send(ActivityEvent::Activity(activity));
        }

        *self.retry_count.lock().await = MAX_RETRY_COUNT;
    }

    async fn handle_disconnect(self: &Arc<Self>) {
        if *self.status_tx.borrow() == ConnectionStatus::Ended {
            return;
        }

        if matches!(&*self.auth.lock().await, AuthState::Exhausted) {
            self.publish_error(ClientError::TokenUnavailable);
            return;
        }

        let mut retries = self.retry_count.lock().await;
        if *retries == 0 {
            self.publish_error(ClientError::ReconnectExhausted { attempts: MAX_RETRY_COUNT });
            return;
        }
        *retries -= 1;
        drop(retries);

        self.publish_status(ConnectionStatus::Connecting);

        let cmd_tx = self.cmd_tx.clone();
        let delay = Duration::from_millis(
            RECONNECT_DELAY_BASE_MS + rand::rng().random_range(0..RECONNECT_DELAY_JITTER_MS),
        );
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(ControllerCommand::AttemptHandshake);
        });
    }

    async fn apply_reconnect(self: &Arc<Self>, creds: ConversationCredentials) {
        *self.auth.lock().await = AuthState::Token(creds.token);
        *self.conversation_id.lock().await = creds.conversation_id;
        self.attempt_handshake().await;
    }

    async fn do_end(&self) {
        self.publish_status(ConnectionStatus::Ended);
        if let Some(transport) = self.transport.lock().await.take() {
            transport.disconnect().await;
        }
        info!("connection ended");
    }
}
