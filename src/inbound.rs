//! Handles activity sets pushed by the server over the transport.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::{Mutex, broadcast};
use tracing::warn;

use crate::error::ClientError;
use crate::model::{Activity, ActivityEvent, ActivitySet, Attachment, StreamRequest, StreamResponse};
use crate::state::StartupQueue;
use crate::transport::InboundRequestHandler;

/// Disposable per-connection: holds only `Arc`s to state the controller
/// owns, so reconnecting simply means constructing a fresh instance rather
/// than mutating a live one in place.
pub struct InboundHandler {
    queue: Arc<Mutex<StartupQueue>>,
    sink: broadcast::Sender<ActivityEvent>,
}

impl InboundHandler {
    pub fn new(queue: Arc<Mutex<StartupQueue>>, sink: broadcast::Sender<ActivityEvent>) -> Self {
        Self { queue, sink }
    }

    fn publish(&self, event: ActivityEvent) {
        // No subscribers yet is not an error; the stream is cold until first poll.
        let _ = self.sink.send(event);
    }
}

#[async_trait]
impl InboundRequestHandler for InboundHandler {
    async fn handle_request(&self, request: StreamRequest) -> StreamResponse {
        let Some(first) = request.streams.first() else {
            self.publish(ActivityEvent::Error(ClientError::MalformedActivitySet { count: 0 }));
            return StreamResponse::error(request.id, 500);
        };

        let set: ActivitySet = match serde_json::from_slice(&first.data) {
            Ok(set) => set,
            Err(e) => {
                warn!(error = %e, "failed to parse activity set");
                self.publish(ActivityEvent::Error(ClientError::MalformedActivitySet { count: 0 }));
                return StreamResponse::error(request.id, 500);
            }
        };

        if set.activities.len() != 1 {
            self.publish(ActivityEvent::Error(ClientError::MalformedActivitySet {
                count: set.activities.len(),
            }));
            return StreamResponse::error(request.id, 500);
        }

        let mut activity: Activity = set.activities.into_iter().next().expect("checked len == 1");

        for stream in request.streams.iter().skip(1) {
            activity.attachments.push(Attachment {
                content_type: stream.content_type.clone(),
                content_url: format!("data:text/plain;base64,{}", BASE64.encode(&stream.data)),
            });
        }

        let mut queue = self.queue.lock().await;
        if queue.is_queueing() {
            queue.push(activity);
        } else {
            drop(queue);
            self.publish(ActivityEvent::Activity(activity));
        }

        StreamResponse::ok(request.id, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentStream;

    fn handler() -> (InboundHandler, Arc<Mutex<StartupQueue>>, broadcast::Receiver<ActivityEvent>) {
        let queue = Arc::new(Mutex::new(StartupQueue::new()));
        let (tx, rx) = broadcast::channel(16);
        (InboundHandler::new(queue.clone(), tx), queue, rx)
    }

    fn activity_set_stream(activities: usize) -> ContentStream {
        let activities: Vec<_> = (0..activities)
            .map(|_| serde_json::json!({"type": "message"}))
            .collect();
        ContentStream::json(&serde_json::json!({ "activities": activities }))
    }

    #[tokio::test]
    async fn queues_while_queueing() {
        let (handler, queue, _rx) = handler();
        let req = StreamRequest {
            id: 1,
            method: "POST".into(),
            path: "/".into(),
            streams: vec![activity_set_stream(1)],
        };
        let resp = handler.handle_request(req).await;
        assert_eq!(resp.status_code, 200);
        assert_eq!(queue.lock().await.flush().len(), 1);
    }

    #[tokio::test]
    async fn malformed_set_does_not_queue_and_errors() {
        let (handler, queue, mut rx) = handler();
        queue.lock().await.flush(); // stop queueing
        let req = StreamRequest {
            id: 2,
            method: "POST".into(),
            path: "/".into(),
            streams: vec![activity_set_stream(0)],
        };
        let resp = handler.handle_request(req).await;
        assert_eq!(resp.status_code, 500);
        match rx.try_recv().unwrap() {
            ActivityEvent::Error(ClientError::MalformedActivitySet { count: 0 }) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn attachments_become_data_uris() {
        let (handler, queue, mut rx) = handler();
        queue.lock().await.flush();
        let req = StreamRequest {
            id: 3,
            method: "POST".into(),
            path: "/".into(),
            streams: vec![
                activity_set_stream(1),
                ContentStream { content_type: "image/png".into(), data: vec![1, 2, 3] },
                ContentStream { content_type: "application/pdf".into(), data: vec![4, 5] },
            ],
        };
        handler.handle_request(req).await;
        match rx.try_recv().unwrap() {
            ActivityEvent::Activity(a) => {
                assert_eq!(a.attachments.len(), 2);
                assert_eq!(a.attachments[0].content_type, "image/png");
                assert!(a.attachments[0].content_url.starts_with("data:text/plain;base64,"));
                assert_eq!(a.attachments[1].content_type, "application/pdf");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
