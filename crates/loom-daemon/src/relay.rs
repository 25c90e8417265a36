//! Reconnecting client for the signaling relay.

use crate::capabilities::CapabilityPublisher;
use crate::dedup::RequestGuard;
use crate::transport::PeerTransport;
use crate::worktree::{WorktreePipeline, WorktreeResponder};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use loom_core::ephemeral::{WorktreeCreateResponse, WorktreeProgress};
use loom_core::relay::{
    decode_message, encode_message, RegisterPayload, RelayErrorPayload, RelayMessage,
    SignalPayload,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay url not configured")]
    MissingUrl,
    #[error("relay credentials missing")]
    MissingCredentials,
}

pub struct RelayClient {
    url: Option<Url>,
    token: Option<String>,
    machine_id: String,
    transport: Arc<dyn PeerTransport>,
    pipeline: Arc<WorktreePipeline>,
    guard: RequestGuard,
    capabilities: Arc<CapabilityPublisher>,
}

/// Sends worktree progress and results back over the relay connection.
pub struct RelayResponder {
    outbound: mpsc::UnboundedSender<RelayMessage>,
}

#[async_trait]
impl WorktreeResponder for RelayResponder {
    async fn progress(&self, progress: WorktreeProgress) {
        let _ = self
            .outbound
            .send(RelayMessage::WorktreeCreateProgress(progress));
    }

    async fn finish(&self, response: WorktreeCreateResponse) {
        let _ = self
            .outbound
            .send(RelayMessage::WorktreeCreateResult(response));
    }
}

impl RelayClient {
    pub fn new(
        url: Option<Url>,
        token: Option<String>,
        machine_id: &str,
        transport: Arc<dyn PeerTransport>,
        pipeline: Arc<WorktreePipeline>,
        guard: RequestGuard,
        capabilities: Arc<CapabilityPublisher>,
    ) -> Self {
        Self {
            url,
            token,
            machine_id: machine_id.to_string(),
            transport,
            pipeline,
            guard,
            capabilities,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
        let url = self.url.clone().ok_or(RelayError::MissingUrl)?;
        let token = self
            .token
            .clone()
            .filter(|token| !token.trim().is_empty())
            .ok_or(RelayError::MissingCredentials)?;

        let mut backoff = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let connect = tokio::select! {
                result = connect_async(url.clone()) => result,
                _ = shutdown.changed() => return Ok(()),
            };
            let (ws, _) = match connect {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "relay_connect_error", error = %err, retry_in_ms = backoff.as_millis() as u64);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => return Ok(()),
                    }
                    backoff = next_backoff(backoff);
                    continue;
                }
            };
            backoff = Duration::from_secs(1);
            info!(event = "relay_connected", url = %url);
            let (mut sink, mut stream) = ws.split();

            let register = RelayMessage::Register(RegisterPayload {
                machine_id: self.machine_id.clone(),
                token: token.clone(),
                capabilities: Some(self.capabilities.detect().await),
            });
            match encode_message(&register) {
                Ok(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        warn!(event = "relay_register_error");
                        continue;
                    }
                }
                Err(err) => {
                    warn!(event = "relay_register_error", error = %err);
                    continue;
                }
            }

            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<RelayMessage>();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        let _ = sink.close().await;
                        return Ok(());
                    }
                    msg = stream.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => match decode_message(&text) {
                                Ok(message) => self.handle_message(message, &outbound_tx).await,
                                Err(err) => {
                                    warn!(event = "relay_message_malformed", error = %err);
                                }
                            },
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!(event = "relay_read_error", error = %err);
                                break;
                            }
                        }
                    }
                    Some(out) = outbound_rx.recv() => {
                        let text = match encode_message(&out) {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(event = "relay_encode_error", error = %err);
                                continue;
                            }
                        };
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
            info!(event = "relay_disconnected");
        }
    }

    pub async fn handle_message(
        &self,
        message: RelayMessage,
        outbound: &mpsc::UnboundedSender<RelayMessage>,
    ) {
        match message {
            RelayMessage::WebrtcOffer(signal) => {
                match self
                    .transport
                    .handle_offer(&signal.peer_id, signal.payload)
                    .await
                {
                    Ok(answer) => {
                        let _ = outbound.send(RelayMessage::WebrtcAnswer(SignalPayload {
                            peer_id: signal.peer_id,
                            payload: answer,
                        }));
                    }
                    Err(err) => {
                        warn!(event = "webrtc_offer_failed", peer_id = %signal.peer_id, error = %err);
                        let _ = outbound.send(RelayMessage::Error(RelayErrorPayload {
                            code: "webrtc_offer_failed".to_string(),
                            message: err.to_string(),
                        }));
                    }
                }
            }
            RelayMessage::WebrtcAnswer(signal) => {
                if let Err(err) = self
                    .transport
                    .handle_answer(&signal.peer_id, signal.payload)
                    .await
                {
                    warn!(event = "webrtc_answer_failed", peer_id = %signal.peer_id, error = %err);
                }
            }
            RelayMessage::WebrtcIce(signal) => {
                if let Err(err) = self
                    .transport
                    .handle_ice(&signal.peer_id, signal.payload)
                    .await
                {
                    debug!(event = "webrtc_ice_failed", peer_id = %signal.peer_id, error = %err);
                }
            }
            RelayMessage::WorktreeCreateRequest(request) => {
                let pipeline = self.pipeline.clone();
                let guard = self.guard.clone();
                let responder = RelayResponder {
                    outbound: outbound.clone(),
                };
                tokio::spawn(async move {
                    pipeline.serve(&guard, &request, &responder).await;
                });
            }
            RelayMessage::Error(payload) => {
                warn!(event = "relay_error", code = %payload.code, message = %payload.message);
            }
            RelayMessage::Register(_)
            | RelayMessage::WorktreeCreateProgress(_)
            | RelayMessage::WorktreeCreateResult(_) => {
                warn!(event = "relay_unexpected_message");
            }
        }
    }
}

pub fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > MAX_BACKOFF {
        MAX_BACKOFF
    } else {
        next
    }
}
