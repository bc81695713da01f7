//! Device event messages
//!
//! Devices push event messages (alarms, state changes) as frames of object
//! type message. The payload layout is fixed: `u32 pending count, u16 message
//! id, u32 source address, u32 timestamp, 4 bytes value`.
//!
//! Message texts ship as a JSON list next to the datapoint catalog and are
//! loaded into an [`XcomMessageSet`].

use bytes::Buf;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{Result, XcomError};
use crate::frame::Frame;
use crate::types::{ObjectType, XcomLevel};

const MESSAGE_LEN: usize = 4 + 2 + 4 + 4 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMessage {
    /// Messages still queued on the device
    pub pending: u32,
    pub message_id: u16,
    pub src: u32,
    /// Seconds since 1970 in the installation's local time
    pub timestamp: u32,
    pub value: [u8; 4],
}

impl DeviceMessage {
    pub fn unpack(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < MESSAGE_LEN {
            return Err(XcomError::malformed_payload(format!(
                "message payload of {} bytes, need {MESSAGE_LEN}",
                buf.len()
            )));
        }
        let pending = buf.get_u32_le();
        let message_id = buf.get_u16_le();
        let src = buf.get_u32_le();
        let timestamp = buf.get_u32_le();
        let mut value = [0u8; 4];
        buf.copy_to_slice(&mut value);

        Ok(Self {
            pending,
            message_id,
            src,
            timestamp,
            value,
        })
    }

    /// Decode the message carried by a frame, `None` for other object types
    pub fn from_frame(frame: &Frame) -> Option<Result<Self>> {
        (frame.object_type == ObjectType::Message).then(|| Self::unpack(&frame.payload))
    }

    /// Human-readable text, or a placeholder naming the number
    pub fn text(&self, messages: &XcomMessageSet) -> String {
        messages
            .text(self.message_id)
            .map(str::to_string)
            .unwrap_or_else(|_| format!("({}): unknown message", self.message_id))
    }
}

/// Text of one message number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDef {
    #[serde(rename = "lvl")]
    pub level: XcomLevel,
    pub nr: u16,
    #[serde(rename = "msg")]
    pub text: String,
}

/// Message texts keyed by number
#[derive(Debug, Clone, Default)]
pub struct XcomMessageSet {
    messages: HashMap<u16, MessageDef>,
}

impl XcomMessageSet {
    pub fn new(messages: Vec<MessageDef>) -> Self {
        Self {
            messages: messages.into_iter().map(|m| (m.nr, m)).collect(),
        }
    }

    /// Parse the JSON list, skipping entries without level, number or text
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: Vec<serde_json::Value> = serde_json::from_str(text)?;
        let total = raw.len();

        let messages: Vec<MessageDef> = raw
            .into_iter()
            .filter_map(|v| match serde_json::from_value::<MessageDef>(v) {
                Ok(mut m) => {
                    m.text = m.text.trim().to_string();
                    Some(m)
                },
                Err(e) => {
                    debug!("Skipping message entry: {}", e);
                    None
                },
            })
            .collect();

        if messages.len() < total {
            debug!(skipped = total - messages.len(), "Incomplete message entries");
        }
        Ok(Self::new(messages))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let set = Self::from_json(&text)?;
        info!("Loaded {} device messages", set.len());
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, nr: u16) -> Result<&MessageDef> {
        self.messages.get(&nr).ok_or(XcomError::UnknownMessage(nr))
    }

    pub fn text(&self, nr: u16) -> Result<&str> {
        self.get(nr).map(|m| m.text.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::types::{FrameType, PropertyId, ServiceId};
    use bytes::{BufMut, Bytes, BytesMut};

    #[test]
    fn test_unpack_broadcast_message() {
        let mut payload = BytesMut::new();
        payload.put_u32_le(2);
        payload.put_u16_le(24);
        payload.put_u32_le(101);
        payload.put_u32_le(1_700_000_000);
        payload.put_slice(&[1, 0, 0, 0]);

        let frame = Frame {
            frame_type: FrameType::Broadcast,
            service: ServiceId::Read,
            src: 101,
            dst: 0,
            object_type: ObjectType::Message,
            object_id: 0,
            property_id: PropertyId::None,
            payload: payload.freeze(),
        };

        let msg = DeviceMessage::from_frame(&frame).unwrap().unwrap();
        assert_eq!(msg.pending, 2);
        assert_eq!(msg.message_id, 24);
        assert_eq!(msg.src, 101);
        assert_eq!(msg.value, [1, 0, 0, 0]);
    }

    #[test]
    fn test_other_object_types_ignored() {
        let frame = Frame::read_request(1, 101, ObjectType::Info, 3000, PropertyId::Value)
            .response(ServiceId::Read, Bytes::from_static(&[0, 0, 0, 0]));
        assert!(DeviceMessage::from_frame(&frame).is_none());
    }

    #[test]
    fn test_short_message() {
        assert!(DeviceMessage::unpack(&[0u8; 10]).is_err());
    }

    const MESSAGES: &str = r#"[
        {"lvl": "V.O.", "nr": 0, "msg": "Warning (000): Battery low "},
        {"lvl": "V.O.", "nr": 24, "msg": "Message (024): Input transfer relay opened"},
        {"lvl": "V.O.", "nr": 235, "msg": "Error (235): Overtemperature"},
        {"lvl": "V.O.", "msg": "no number"},
        {"lvl": "V.O.", "nr": "x", "msg": "bad number"},
        {"nr": 12, "msg": "no level"}
    ]"#;

    #[test]
    fn test_message_set_lookup() {
        let set = XcomMessageSet::from_json(MESSAGES).unwrap();
        assert_eq!(set.len(), 3);

        let def = set.get(0).unwrap();
        assert_eq!(def.level, XcomLevel::ViewOnly);
        assert_eq!(def.text, "Warning (000): Battery low");
        assert_eq!(set.text(235).unwrap(), "Error (235): Overtemperature");

        assert_eq!(set.get(236).unwrap_err(), XcomError::UnknownMessage(236));
        assert!(set.text(12).is_err());
    }

    #[test]
    fn test_device_message_text() {
        let set = XcomMessageSet::from_json(MESSAGES).unwrap();
        let mut msg = DeviceMessage {
            pending: 0,
            message_id: 24,
            src: 101,
            timestamp: 0,
            value: [0; 4],
        };
        assert_eq!(msg.text(&set), "Message (024): Input transfer relay opened");

        msg.message_id = 999;
        assert_eq!(msg.text(&set), "(999): unknown message");
    }

    #[test]
    fn test_message_set_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages_en.json");
        std::fs::write(&path, MESSAGES).unwrap();

        let set = XcomMessageSet::load(&path).unwrap();
        assert_eq!(set.len(), 3);
        assert!(XcomMessageSet::load(dir.path().join("missing.json")).is_err());
    }
}
