//! Sends activities out over the transport, with or without attachments.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::error::{SendError, SendResult};
use crate::http::HttpClient;
use crate::model::{Activity, ContentStream, StreamRequest};
use crate::transport::Transport;

/// Content type of the first stream in an attachment-upload request: the
/// activity envelope, distinct from the plain `application/json` body used
/// for a send with no attachments.
const ACTIVITY_ENVELOPE_CONTENT_TYPE: &str = "application/vnd.microsoft.activity";

pub struct OutboundSender {
    http: Arc<dyn HttpClient>,
    next_id: AtomicU64,
}

impl OutboundSender {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self { http, next_id: AtomicU64::new(1_000_000) }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends `activity` and returns the server-assigned id, or `None` when
    /// the server tolerated the request but replied with no streams at all.
    pub async fn send(
        &self,
        transport: &Arc<dyn Transport>,
        conversation_id: &str,
        activity: Activity,
    ) -> SendResult<Option<String>> {
        if activity.is_message() && !activity.attachments.is_empty() {
            self.send_with_attachments(transport, conversation_id, activity).await
        } else {
            self.send_plain(transport, conversation_id, activity).await
        }
    }

    async fn send_plain(
        &self,
        transport: &Arc<dyn Transport>,
        conversation_id: &str,
        activity: Activity,
    ) -> SendResult<Option<String>> {
        let request = StreamRequest {
            id: self.next_id(),
            method: "POST".into(),
            path: format!("/v3/directline/conversations/{conversation_id}/activities"),
            streams: vec![ContentStream::json(&activity)],
        };

        let response = transport.send(request).await?;
        if response.status_code != 200 {
            transport.disconnect().await;
            return Err(SendError::Transport(crate::error::TransportError::BadStatus {
                status: response.status_code,
                body: String::new(),
            }));
        }
        extract_id(&response.streams).map(Some)
    }

    async fn send_with_attachments(
        &self,
        transport: &Arc<dyn Transport>,
        conversation_id: &str,
        mut activity: Activity,
    ) -> SendResult<Option<String>> {
        let from_id = activity
            .from
            .as_ref()
            .map(|f| f.id.clone())
            .ok_or(SendError::MissingId)?;

        let mut attachment_streams = Vec::with_capacity(activity.attachments.len());
        for attachment in &activity.attachments {
            let bytes = self
                .http
                .get_bytes(&attachment.content_url)
                .await
                .map_err(|e| SendError::AttachmentFetch(e.to_string()))?;
            attachment_streams.push(ContentStream {
                content_type: attachment.content_type.clone(),
                data: bytes,
            });
        }
        activity.attachments.clear();

        let mut streams = vec![ContentStream::json_typed(ACTIVITY_ENVELOPE_CONTENT_TYPE, &activity)];
        streams.extend(attachment_streams);

        let request = StreamRequest {
            id: self.next_id(),
            method: "PUT".into(),
            path: format!(
                "/v3/directline/conversations/{conversation_id}/users/{from_id}/upload"
            ),
            streams,
        };

        let response = transport.send(request).await?;
        if response.status_code != 200 {
            transport.disconnect().await;
            return Err(SendError::Transport(crate::error::TransportError::BadStatus {
                status: response.status_code,
                body: String::new(),
            }));
        }
        if response.streams.is_empty() {
            warn!("attachment upload response carried no streams, tolerating silently");
            return Ok(None);
        }
        extract_id(&response.streams).map(Some)
    }
}

fn extract_id(streams: &[ContentStream]) -> SendResult<String> {
    let first = streams.first().ok_or(SendError::MissingId)?;
    let value: serde_json::Value = first.as_json().map_err(|_| SendError::MissingId)?;
    value
        .get("Id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or(SendError::MissingId)
}
