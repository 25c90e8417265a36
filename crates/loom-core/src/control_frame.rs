//! Terminal data-channel framing.
//!
//! Every inbound message is either raw keyboard input or a JSON control frame.
//! Control frames start with [`CONTROL_PREFIX`]; the prefix bytes can never
//! begin valid UTF-8 text, so typed input never collides with it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONTROL_PREFIX: [u8; 3] = [0xFF, 0x00, 0xFE];
pub const MAX_CONTROL_FRAME_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    Cwd { path: String },
    Resize { cols: u16, rows: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame<'a> {
    Control(ControlFrame),
    Input(&'a [u8]),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("frame encode failed: {0}")]
    Encode(String),
}

pub fn encode_control(frame: &ControlFrame) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(frame).map_err(|err| FrameError::Encode(err.to_string()))?;
    let mut out = Vec::with_capacity(CONTROL_PREFIX.len() + body.len());
    out.extend_from_slice(&CONTROL_PREFIX);
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode_inbound(data: &[u8]) -> Result<InboundFrame<'_>, FrameError> {
    let Some(body) = data.strip_prefix(&CONTROL_PREFIX[..]) else {
        return Ok(InboundFrame::Input(data));
    };
    if body.len() > MAX_CONTROL_FRAME_BYTES {
        return Err(FrameError::OversizedFrame {
            size: body.len(),
            max: MAX_CONTROL_FRAME_BYTES,
        });
    }
    serde_json::from_slice(body)
        .map(InboundFrame::Control)
        .map_err(|err| FrameError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_input_passes_through() {
        let frame = decode_inbound(b"ls -la\r").expect("decode");
        assert_eq!(frame, InboundFrame::Input(b"ls -la\r"));
    }

    #[test]
    fn control_frames_decode() {
        let cwd = encode_control(&ControlFrame::Cwd {
            path: "/repo".to_string(),
        })
        .expect("encode");
        assert_eq!(
            decode_inbound(&cwd).expect("decode"),
            InboundFrame::Control(ControlFrame::Cwd {
                path: "/repo".to_string()
            })
        );

        let mut resize = CONTROL_PREFIX.to_vec();
        resize.extend_from_slice(br#"{"type":"resize","cols":120,"rows":40}"#);
        assert_eq!(
            decode_inbound(&resize).expect("decode"),
            InboundFrame::Control(ControlFrame::Resize { cols: 120, rows: 40 })
        );
    }

    #[test]
    fn malformed_control_frame_is_an_error() {
        let mut bad = CONTROL_PREFIX.to_vec();
        bad.extend_from_slice(br#"{"type":"teleport"}"#);
        assert!(matches!(decode_inbound(&bad), Err(FrameError::Decode(_))));

        let mut huge = CONTROL_PREFIX.to_vec();
        huge.extend(std::iter::repeat(b' ').take(MAX_CONTROL_FRAME_BYTES + 1));
        assert!(matches!(
            decode_inbound(&huge),
            Err(FrameError::OversizedFrame { .. })
        ));
    }
}
