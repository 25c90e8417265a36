use crate::control_frame::FrameError;
use crate::ephemeral::{
    MachineCapabilities, WorktreeCreateRequest, WorktreeCreateResponse, WorktreeProgress,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MAX_RELAY_MESSAGE_BYTES: usize = 1024 * 1024;

/// Messages exchanged with the signaling relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayMessage {
    Register(RegisterPayload),
    WebrtcOffer(SignalPayload),
    WebrtcAnswer(SignalPayload),
    WebrtcIce(SignalPayload),
    WorktreeCreateRequest(WorktreeCreateRequest),
    WorktreeCreateProgress(WorktreeProgress),
    WorktreeCreateResult(WorktreeCreateResponse),
    Error(RelayErrorPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub machine_id: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<MachineCapabilities>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    pub peer_id: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelayErrorPayload {
    pub code: String,
    pub message: String,
}

pub fn encode_message(message: &RelayMessage) -> Result<String, FrameError> {
    serde_json::to_string(message).map_err(|err| FrameError::Encode(err.to_string()))
}

pub fn decode_message(text: &str) -> Result<RelayMessage, FrameError> {
    if text.len() > MAX_RELAY_MESSAGE_BYTES {
        return Err(FrameError::OversizedFrame {
            size: text.len(),
            max: MAX_RELAY_MESSAGE_BYTES,
        });
    }
    serde_json::from_str(text).map_err(|err| FrameError::Decode(err.to_string()))
}
