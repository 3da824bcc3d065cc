//! Plain HTTP calls: token refresh and attachment byte fetch.
//!
//! Kept behind a trait, mirroring the way the transport layer wraps a
//! `reqwest::Client` behind a capability interface, so the refresher and
//! outbound sender are testable without a live network.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::error::TransportError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        bearer_token: &str,
        user_agent: &str,
    ) -> Result<(u16, Value), TransportError>;

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, TransportError>;
}

pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build http client");
        Self { client }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn post_json(
        &self,
        url: &str,
        bearer_token: &str,
        user_agent: &str,
    ) -> Result<(u16, Value), TransportError> {
        let resp = self
            .client
            .post(url)
            .bearer_auth(bearer_token)
            .header("x-ms-bot-agent", user_agent)
            .send()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Ok((status, Value::String(body)));
        }
        let body = resp
            .json::<Value>()
            .await
            .unwrap_or(Value::Null);
        Ok((status, body))
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::BadStatus {
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}
