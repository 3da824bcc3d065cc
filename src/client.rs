//! Public facade tying the controller, refresher, and outbound sender
//! together into one conversation client.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::{Mutex, OnceCell, broadcast, mpsc, watch};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};

use crate::config::ClientConfig;
use crate::controller::{Controller, ControllerCommand};
use crate::error::{ConfigResult, SendError, SendResult};
use crate::http::{HttpClient, ReqwestHttpClient};
use crate::model::{Activity, ActivityEvent, AuthState, ConnectionStatus, ConversationCredentials};
use crate::outbound::OutboundSender;
use crate::refresher::TokenRefresher;
use crate::transport::{TransportFactory, WsTransportFactory};

const DIRECT_LINE_VERSION: &str = "DirectLine/3.0";

fn user_agent(config: &ClientConfig) -> String {
    match &config.bot_agent {
        Some(agent) => format!("{DIRECT_LINE_VERSION} (directlineStreaming; {agent})"),
        None => format!("{DIRECT_LINE_VERSION} (directlineStreaming)"),
    }
}

/// A single conversation: one handshake, one reconnect policy, one activity
/// feed. Constructing a client starts its refresh loop and controller task
/// but does not dial the transport until [`DirectLineClient::activity_stream`]
/// is first polled.
pub struct DirectLineClient {
    controller: Arc<Controller>,
    cmd_tx: mpsc::UnboundedSender<ControllerCommand>,
    status_rx: watch::Receiver<ConnectionStatus>,
    activity_tx: broadcast::Sender<ActivityEvent>,
    outbound: OutboundSender,
    start_once: Arc<OnceCell<()>>,
}

impl DirectLineClient {
    pub fn new(config: ClientConfig) -> ConfigResult<Self> {
        let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new());
        Self::with_http_client(config, http)
    }

    /// Constructs a client against an injected HTTP client, for testing
    /// without a live network. Dials real WebSocket transports.
    pub fn with_http_client(config: ClientConfig, http: Arc<dyn HttpClient>) -> ConfigResult<Self> {
        Self::with_collaborators(config, http, Arc::new(WsTransportFactory))
    }

    /// Constructs a client against injected HTTP and transport collaborators,
    /// for exercising the state machine without any live network at all.
    pub fn with_collaborators(
        config: ClientConfig,
        http: Arc<dyn HttpClient>,
        transport_factory: Arc<dyn TransportFactory>,
    ) -> ConfigResult<Self> {
        let config = config.validated()?;
        let auth = Arc::new(Mutex::new(AuthState::Token(config.token.clone())));
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Uninitialized);
        let (activity_tx, _) = broadcast::channel(256);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let controller = Controller::new(
            config.clone(),
            transport_factory,
            auth.clone(),
            status_tx,
            activity_tx.clone(),
            cmd_tx.clone(),
        );
        tokio::spawn(controller.clone().run(cmd_rx));

        let refresher = TokenRefresher::new(
            http.clone(),
            config.domain.clone(),
            user_agent(&config),
            auth,
            status_rx.clone(),
            cmd_tx.clone(),
        );
        tokio::spawn(refresher.run());

        Ok(Self {
            controller,
            cmd_tx,
            status_rx,
            activity_tx,
            outbound: OutboundSender::new(http),
            start_once: Arc::new(OnceCell::new()),
        })
    }

    /// A lazy, multicast stream of inbound activities and terminal errors.
    /// The first subscription triggers the initial handshake.
    pub fn activity_stream(&self) -> impl Stream<Item = ActivityEvent> + use<> {
        let receiver = self.activity_tx.subscribe();
        if self.start_once.set(()).is_ok() {
            let _ = self.cmd_tx.send(ControllerCommand::AttemptHandshake);
        }
        BroadcastStream::new(receiver).filter_map(|item| futures::future::ready(item.ok()))
    }

    /// A stream of connection status transitions, replaying the current
    /// value to each new subscriber.
    pub fn connection_status(&self) -> impl Stream<Item = ConnectionStatus> + use<> {
        WatchStream::new(self.status_rx.clone())
    }

    /// Sends an activity and resolves with the server-assigned id, or `None`
    /// if the server tolerated the request but replied with no streams at
    /// all (an upload-response quirk this crate preserves rather than
    /// surfacing as a failure).
    pub async fn post_activity(&self, activity: Activity) -> SendResult<Option<String>> {
        let transport = self.controller.current_transport().await.ok_or(SendError::Ended)?;
        let conversation_id = self
            .controller
            .current_conversation_id()
            .await
            .ok_or(SendError::MissingId)?;
        self.outbound.send(&transport, &conversation_id, activity).await
    }

    /// Replaces the conversation credentials and performs a fresh handshake.
    pub fn reconnect(&self, credentials: ConversationCredentials) {
        let _ = self.cmd_tx.send(ControllerCommand::Reconnect(credentials));
    }

    /// Terminally shuts the client down. Idempotent.
    pub fn end(&self) {
        let _ = self.cmd_tx.send(ControllerCommand::End);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClientError, TransportError};
    use crate::model::{ContentStream, StreamRequest, StreamResponse};
    use crate::transport::{DisconnectCallback, InboundRequestHandler, Transport, TransportHandlers};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    struct MockConnection {
        inbound: Arc<dyn InboundRequestHandler>,
        on_disconnect: Arc<dyn DisconnectCallback>,
    }

    #[derive(Default)]
    struct MockTransportState {
        current: Option<MockConnection>,
        sent: Vec<StreamRequest>,
        fail_connect: bool,
        disconnect_calls: u32,
        next_id: u64,
        /// Delivered as a server push the instant `connect()` succeeds, while
        /// the handshake still has `queue_activities == true`.
        push_on_connect: Option<String>,
    }

    struct MockTransport {
        state: Arc<AsyncMutex<MockTransportState>>,
        conversation_id: String,
        inbound: Arc<dyn InboundRequestHandler>,
        on_disconnect: Arc<dyn DisconnectCallback>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&self) -> crate::error::TransportResult<()> {
            let mut st = self.state.lock().await;
            if st.fail_connect {
                return Err(TransportError::ConnectFailed("mock refuses connections".into()));
            }
            let pushed = st.push_on_connect.take();
            st.current = Some(MockConnection {
                inbound: self.inbound.clone(),
                on_disconnect: self.on_disconnect.clone(),
            });
            drop(st);

            if let Some(activity_type) = pushed {
                let set = serde_json::json!({ "activities": [{ "type": activity_type }] });
                let request = StreamRequest {
                    id: u64::MAX,
                    method: "POST".into(),
                    path: "/".into(),
                    streams: vec![ContentStream::json(&set)],
                };
                self.inbound.handle_request(request).await;
            }
            Ok(())
        }

        async fn send(&self, request: StreamRequest) -> crate::error::TransportResult<StreamResponse> {
            let echo = if request.path.ends_with("/activities") {
                request.streams.first().and_then(|s| s.as_json::<Activity>().ok())
            } else {
                None
            };

            let inbound = {
                let mut st = self.state.lock().await;
                st.sent.push(request.clone());
                st.current.as_ref().map(|c| c.inbound.clone())
            };

            let response = if request.path == "/v3/directline/conversations" {
                let body = serde_json::json!({ "conversationId": self.conversation_id });
                StreamResponse::ok(request.id, vec![ContentStream::json(&body)])
            } else if request.path.ends_with("/activities") || request.path.contains("/upload") {
                let mut st = self.state.lock().await;
                st.next_id += 1;
                let id = format!("srv-{}", st.next_id);
                StreamResponse::ok(request.id, vec![ContentStream::json(&serde_json::json!({ "Id": id }))])
            } else {
                StreamResponse::error(request.id, 404)
            };

            // A real Direct Line service echoes a posted message back over
            // the stream so the sender's own UI updates; the mock mirrors
            // that so order-preservation is exercised against real code.
            if let (Some(activity), Some(inbound)) = (echo, inbound) {
                let set = serde_json::json!({ "activities": [activity] });
                let push = StreamRequest {
                    id: u64::MAX,
                    method: "POST".into(),
                    path: "/".into(),
                    streams: vec![ContentStream::json(&set)],
                };
                inbound.handle_request(push).await;
            }

            Ok(response)
        }

        async fn disconnect(&self) {
            let conn = {
                let mut st = self.state.lock().await;
                st.disconnect_calls += 1;
                st.current.take()
            };
            if let Some(conn) = conn {
                conn.on_disconnect.on_disconnect().await;
            }
        }
    }

    struct MockTransportFactory {
        state: Arc<AsyncMutex<MockTransportState>>,
        conversation_id: String,
    }

    impl TransportFactory for MockTransportFactory {
        fn create(&self, _url: String, handlers: TransportHandlers) -> Arc<dyn Transport> {
            Arc::new(MockTransport {
                state: self.state.clone(),
                conversation_id: self.conversation_id.clone(),
                inbound: handlers.inbound,
                on_disconnect: handlers.on_disconnect,
            })
        }
    }

    struct NoopHttpClient;

    #[async_trait]
    impl HttpClient for NoopHttpClient {
        async fn post_json(
            &self,
            _url: &str,
            _bearer_token: &str,
            _user_agent: &str,
        ) -> Result<(u16, serde_json::Value), TransportError> {
            Ok((200, serde_json::json!({ "token": "unused" })))
        }

        async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, TransportError> {
            Ok(format!("bytes-for:{url}").into_bytes())
        }
    }

    async fn force_close(state: &Arc<AsyncMutex<MockTransportState>>) {
        let conn = state.lock().await.current.take();
        if let Some(conn) = conn {
            conn.on_disconnect.on_disconnect().await;
        }
    }

    async fn wait_for_online(client: &DirectLineClient) {
        let mut stream = client.connection_status();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(status) = stream.next().await {
                if status == ConnectionStatus::Online {
                    return;
                }
            }
        })
        .await
        .expect("client never went online");
    }

    fn test_client(
        state: Arc<AsyncMutex<MockTransportState>>,
        conversation_id: &str,
    ) -> DirectLineClient {
        let config = ClientConfig::new("https://example.com/v3/directline", "tok");
        let factory = Arc::new(MockTransportFactory { state, conversation_id: conversation_id.into() });
        DirectLineClient::with_collaborators(config, Arc::new(NoopHttpClient), factory).unwrap()
    }

    #[tokio::test]
    async fn happy_path_delivers_posted_activities_in_order() {
        let state = Arc::new(AsyncMutex::new(MockTransportState::default()));
        let client = test_client(state, "conv-1");
        let mut activities = client.activity_stream();
        wait_for_online(&client).await;

        let id_x = client.post_activity(Activity::new("message")).await.unwrap();
        let id_y = client.post_activity(Activity::new("message")).await.unwrap();
        assert!(id_x.is_some() && id_y.is_some());
        assert_ne!(id_x, id_y);

        let first = activities.next().await.unwrap();
        let second = activities.next().await.unwrap();
        match (first, second) {
            (ActivityEvent::Activity(_), ActivityEvent::Activity(_)) => {}
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_on_close_preserves_order_and_publishes_connecting() {
        let state = Arc::new(AsyncMutex::new(MockTransportState::default()));
        let client = test_client(state.clone(), "conv-1");
        let mut activities = client.activity_stream();
        let mut statuses = client.connection_status();
        wait_for_online(&client).await;

        client.post_activity(Activity::new("message")).await.unwrap();
        assert!(matches!(activities.next().await.unwrap(), ActivityEvent::Activity(_)));

        force_close(&state).await;
        // Drain status updates until Connecting is observed, then let the
        // jittered backoff timer fire and the reconnect handshake complete.
        let mut saw_connecting = false;
        while let Some(status) = statuses.next().await {
            if status == ConnectionStatus::Connecting {
                saw_connecting = true;
                break;
            }
        }
        assert!(saw_connecting);
        tokio::time::advance(Duration::from_millis(15_000)).await;
        wait_for_online(&client).await;

        client.post_activity(Activity::new("message")).await.unwrap();
        assert!(matches!(activities.next().await.unwrap(), ActivityEvent::Activity(_)));
    }

    #[tokio::test]
    async fn queued_inbound_is_observed_only_after_online() {
        let state = Arc::new(AsyncMutex::new(MockTransportState::default()));
        state.lock().await.push_on_connect = Some("message".into());
        let client = test_client(state, "conv-1");
        let mut activities = client.activity_stream();

        match activities.next().await.unwrap() {
            ActivityEvent::Activity(a) => assert_eq!(a.activity_type, "message"),
            other => panic!("unexpected event: {other:?}"),
        }

        // By the time the queued activity is flushed, Online must already
        // have been published: the watch channel replays the latest value.
        let mut statuses = client.connection_status();
        assert_eq!(statuses.next().await.unwrap(), ConnectionStatus::Online);
    }

    #[tokio::test]
    async fn attachment_upload_frames_activity_then_bytes_and_returns_id() {
        let state = Arc::new(AsyncMutex::new(MockTransportState::default()));
        let client = test_client(state.clone(), "conv-1");
        wait_for_online(&client).await;

        let mut activity = Activity::new("message");
        activity.from = Some(crate::model::From { id: "user-1".into() });
        activity.attachments.push(crate::model::Attachment {
            content_type: "image/png".into(),
            content_url: "http://host/a.png".into(),
        });

        let id = client.post_activity(activity).await.unwrap();
        assert!(id.is_some_and(|id| !id.is_empty()));

        let sent = state.lock().await.sent.clone();
        let upload = sent.iter().find(|r| r.path.contains("/upload")).expect("upload request sent");
        assert_eq!(upload.method, "PUT");
        assert_eq!(upload.streams.len(), 2);
        assert_eq!(upload.streams[0].content_type, "application/vnd.microsoft.activity");
        assert_eq!(upload.streams[1].content_type, "image/png");
        assert_eq!(upload.streams[1].data, b"bytes-for:http://host/a.png");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_exhausts_after_max_attempts() {
        let state = Arc::new(AsyncMutex::new(MockTransportState::default()));
        let client = test_client(state.clone(), "conv-1");
        let mut activities = client.activity_stream();
        wait_for_online(&client).await;

        state.lock().await.fail_connect = true;
        force_close(&state).await;

        // Each failed reconnect attempt schedules another jittered backoff
        // timer; with the clock paused, the runtime auto-advances through
        // them whenever every task is parked on a timer.
        let event = tokio::time::timeout(Duration::from_secs(120), activities.next())
            .await
            .expect("retry budget never exhausted")
            .unwrap();
        match event {
            ActivityEvent::Error(ClientError::ReconnectExhausted { attempts }) => {
                assert_eq!(attempts, crate::controller::MAX_RETRY_COUNT);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn end_is_terminal_and_disconnects_exactly_once() {
        let state = Arc::new(AsyncMutex::new(MockTransportState::default()));
        let client = test_client(state.clone(), "conv-1");
        wait_for_online(&client).await;

        client.end();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(state.lock().await.disconnect_calls, 1);

        // A reconnect requested after end is silently dropped: the
        // controller's command loop has already exited.
        client.reconnect(ConversationCredentials { conversation_id: None, token: "new".into() });
        tokio::task::yield_now().await;
        assert!(state.lock().await.current.is_none());
    }
}
