//! Background bearer-token refresh loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tracing::{info, warn};

use crate::controller::ControllerCommand;
use crate::http::HttpClient;
use crate::model::{AuthState, ConnectionStatus};

pub const REFRESH_TOKEN_INTERVAL: Duration = Duration::from_secs(900);
const REFRESH_RETRY_BUDGET: u32 = 3;

enum RefreshOutcome {
    Refreshed,
    Retryable,
    Fatal,
}

pub struct TokenRefresher {
    http: Arc<dyn HttpClient>,
    domain: String,
    user_agent: String,
    auth: Arc<Mutex<AuthState>>,
    status_rx: watch::Receiver<ConnectionStatus>,
    cmd_tx: mpsc::UnboundedSender<ControllerCommand>,
}

impl TokenRefresher {
    pub fn new(
        http: Arc<dyn HttpClient>,
        domain: String,
        user_agent: String,
        auth: Arc<Mutex<AuthState>>,
        status_rx: watch::Receiver<ConnectionStatus>,
        cmd_tx: mpsc::UnboundedSender<ControllerCommand>,
    ) -> Self {
        Self { http, domain, user_agent, auth, status_rx, cmd_tx }
    }

    pub async fn run(mut self) {
        loop {
            if self.wait_for_online_or_end().await.is_break() {
                return;
            }

            tokio::time::sleep(REFRESH_TOKEN_INTERVAL).await;
            if *self.status_rx.borrow() == ConnectionStatus::Ended {
                return;
            }

            // Retries within one tick are immediate (no extra delay): the
            // interval sleep above only governs the *next* scheduled tick.
            let mut retries = REFRESH_RETRY_BUDGET;
            loop {
                match self.try_refresh_once().await {
                    RefreshOutcome::Refreshed => break,
                    RefreshOutcome::Fatal => return,
                    RefreshOutcome::Retryable => {
                        if retries == 0 {
                            warn!("token refresh retries exhausted, giving up");
                            *self.auth.lock().await = AuthState::Exhausted;
                            let _ = self.cmd_tx.send(ControllerCommand::Disconnected);
                            return;
                        }
                        retries -= 1;
                    }
                }
            }
        }
    }

    async fn try_refresh_once(&self) -> RefreshOutcome {
        let token = match &*self.auth.lock().await {
            AuthState::Token(t) => t.clone(),
            AuthState::Exhausted => return RefreshOutcome::Fatal,
        };
        let url = format!("{}/tokens/refresh", self.domain.trim_end_matches('/'));

        match self.http.post_json(&url, &token, &self.user_agent).await {
            Ok((200, body)) => {
                if let Some(new_token) = body.get("token").and_then(|v| v.as_str()) {
                    *self.auth.lock().await = AuthState::Token(new_token.to_string());
                }
                info!("refreshed bearer token");
                RefreshOutcome::Refreshed
            }
            Ok((403, _)) | Ok((404, _)) => {
                warn!("token refresh rejected, no further attempts");
                *self.auth.lock().await = AuthState::Exhausted;
                let _ = self.cmd_tx.send(ControllerCommand::Disconnected);
                RefreshOutcome::Fatal
            }
            Ok((status, _)) => {
                warn!(status, "token refresh returned an unexpected status");
                RefreshOutcome::Retryable
            }
            Err(e) => {
                warn!(error = %e, "token refresh request failed");
                RefreshOutcome::Retryable
            }
        }
    }

    async fn wait_for_online_or_end(&mut self) -> std::ops::ControlFlow<()> {
        loop {
            match *self.status_rx.borrow() {
                ConnectionStatus::Online => return std::ops::ControlFlow::Continue(()),
                ConnectionStatus::Ended => return std::ops::ControlFlow::Break(()),
                _ => {}
            }
            if self.status_rx.changed().await.is_err() {
                return std::ops::ControlFlow::Break(());
            }
        }
    }
}
