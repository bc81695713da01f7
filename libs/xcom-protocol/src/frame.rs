//! Xcom frame codec
//!
//! Wire layout (all multi-byte integers little-endian):
//!
//! ```text
//! [0xAA][length u32][frame type u8][service u8][src u16][dst u16]
//! [object type u8][object id u16][property u8][payload ...][checksum a,b]
//! ```
//!
//! `length` counts frame type through payload. The checksum covers the same
//! span.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::constants::{
    BODY_HEADER_LEN, CHECKSUM_LEN, MAX_BODY_LEN, MAX_PAYLOAD_LEN, PREFIX_LEN, START_BYTE,
};
use crate::error::{FrameDefect, Result, XcomError};
use crate::types::{FrameType, ObjectType, PropertyId, ScomErrorCode, ServiceId};

/// Checksum used for the frame body
///
/// Two running sums: `a` starts at 0xFF and accumulates bytes, `b`
/// accumulates `a`. Written on the wire as `[a, b]`.
pub fn checksum(data: &[u8]) -> u16 {
    let mut a: u8 = 0xFF;
    let mut b: u8 = 0x00;
    for &byte in data {
        a = a.wrapping_add(byte);
        b = b.wrapping_add(a);
    }
    u16::from_le_bytes([a, b])
}

/// A single Xcom protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub service: ServiceId,
    pub src: u16,
    pub dst: u16,
    pub object_type: ObjectType,
    pub object_id: u16,
    pub property_id: PropertyId,
    pub payload: Bytes,
}

/// Frame boundaries located in a buffer, checksum not yet judged
#[derive(Debug)]
pub(crate) struct RawFrame<'a> {
    pub body: &'a [u8],
    /// Checksum computed over `body`
    pub computed: u16,
    /// Checksum carried by the frame
    pub carried: u16,
    /// Total bytes occupied, marker through checksum
    pub total_len: usize,
}

impl Frame {
    /// Build a request frame
    pub fn request(
        service: ServiceId,
        src: u16,
        dst: u16,
        object_type: ObjectType,
        object_id: u16,
        property_id: PropertyId,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            frame_type: FrameType::Request,
            service,
            src,
            dst,
            object_type,
            object_id,
            property_id,
            payload: payload.into(),
        }
    }

    /// Read request without payload
    pub fn read_request(
        src: u16,
        dst: u16,
        object_type: ObjectType,
        object_id: u16,
        property_id: PropertyId,
    ) -> Self {
        Self::request(
            ServiceId::Read,
            src,
            dst,
            object_type,
            object_id,
            property_id,
            Bytes::new(),
        )
    }

    /// Write of a parameter's RAM value
    pub fn write_request(src: u16, dst: u16, object_id: u16, payload: impl Into<Bytes>) -> Self {
        Self::request(
            ServiceId::Write,
            src,
            dst,
            ObjectType::Parameter,
            object_id,
            PropertyId::UnsavedValue,
            payload,
        )
    }

    /// Response a device would send back for this request
    pub fn response(&self, service: ServiceId, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type: FrameType::Response,
            service,
            src: self.dst,
            dst: self.src,
            object_type: self.object_type,
            object_id: self.object_id,
            property_id: self.property_id,
            payload: payload.into(),
        }
    }

    /// Error response carrying a device error code
    pub fn error_response(&self, code: ScomErrorCode) -> Self {
        self.response(
            ServiceId::Error,
            Bytes::copy_from_slice(&code.code().to_le_bytes()),
        )
    }

    pub fn is_response(&self) -> bool {
        self.frame_type == FrameType::Response
    }

    pub fn is_error(&self) -> bool {
        self.service == ServiceId::Error
    }

    /// Device error code of an error-service frame
    pub fn error_code(&self) -> Option<ScomErrorCode> {
        if !self.is_error() {
            return None;
        }
        match self.payload.as_ref() {
            [lo, hi, ..] => Some(ScomErrorCode::from(u16::from_le_bytes([*lo, *hi]))),
            _ => Some(ScomErrorCode::Other(0xFFFF)),
        }
    }

    /// Value of the length field for this frame
    pub fn body_len(&self) -> usize {
        BODY_HEADER_LEN + self.payload.len()
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Result<Bytes> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(XcomError::encoding(format!(
                "payload of {} bytes exceeds maximum {}",
                self.payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }

        let body_len = self.body_len();
        let mut buf = BytesMut::with_capacity(PREFIX_LEN + body_len + CHECKSUM_LEN);

        buf.put_u8(START_BYTE);
        buf.put_u32_le(body_len as u32);

        buf.put_u8(self.frame_type.code());
        buf.put_u8(self.service.code());
        buf.put_u16_le(self.src);
        buf.put_u16_le(self.dst);
        buf.put_u8(self.object_type.code());
        buf.put_u16_le(self.object_id);
        buf.put_u8(self.property_id.code());
        buf.put_slice(&self.payload);

        let crc = checksum(&buf[PREFIX_LEN..]);
        buf.put_u16_le(crc);

        Ok(buf.freeze())
    }

    /// Decode one frame from the start of `buf`
    ///
    /// Trailing bytes after the frame are ignored. Use [`Frame::wire_len`]
    /// to find out how many bytes the frame occupied.
    pub fn decode(buf: &[u8]) -> Result<Frame> {
        let raw = Self::split(buf)?;
        if raw.computed != raw.carried {
            return Err(XcomError::Checksum {
                expected: raw.computed,
                actual: raw.carried,
            });
        }
        Self::parse_body(raw.body)
    }

    /// Total bytes this frame occupies on the wire
    pub fn wire_len(&self) -> usize {
        PREFIX_LEN + self.body_len() + CHECKSUM_LEN
    }

    /// Locate frame boundaries at the start of `buf`
    pub(crate) fn split(buf: &[u8]) -> Result<RawFrame<'_>> {
        if buf.len() < PREFIX_LEN {
            return Err(XcomError::MalformedFrame(FrameDefect::Truncated {
                needed: PREFIX_LEN,
                available: buf.len(),
            }));
        }
        if buf[0] != START_BYTE {
            return Err(XcomError::MalformedFrame(FrameDefect::BadStartMarker(buf[0])));
        }

        let declared = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let body_len = declared as usize;
        if !(BODY_HEADER_LEN..=MAX_BODY_LEN).contains(&body_len) {
            return Err(XcomError::MalformedFrame(FrameDefect::BadLength(declared)));
        }

        let total_len = PREFIX_LEN + body_len + CHECKSUM_LEN;
        if buf.len() < total_len {
            return Err(XcomError::MalformedFrame(FrameDefect::Truncated {
                needed: total_len,
                available: buf.len(),
            }));
        }

        let body = &buf[PREFIX_LEN..PREFIX_LEN + body_len];
        let tail = &buf[PREFIX_LEN + body_len..total_len];

        Ok(RawFrame {
            body,
            computed: checksum(body),
            carried: u16::from_le_bytes([tail[0], tail[1]]),
            total_len,
        })
    }

    /// Parse the checksummed span into fields
    pub(crate) fn parse_body(body: &[u8]) -> Result<Frame> {
        if body.len() < BODY_HEADER_LEN {
            return Err(XcomError::MalformedFrame(FrameDefect::Truncated {
                needed: BODY_HEADER_LEN,
                available: body.len(),
            }));
        }

        let mut cur = body;
        let frame_type = FrameType::try_from(cur.get_u8())?;
        let service = ServiceId::try_from(cur.get_u8())?;
        let src = cur.get_u16_le();
        let dst = cur.get_u16_le();
        let object_type = ObjectType::try_from(cur.get_u8())?;
        let object_id = cur.get_u16_le();
        let property_id = PropertyId::try_from(cur.get_u8())?;

        Ok(Frame {
            frame_type,
            service,
            src,
            dst,
            object_type,
            object_id,
            property_id,
            payload: Bytes::copy_from_slice(cur),
        })
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?} {}->{} {:?}:{} {:?} [{}B]",
            self.frame_type,
            self.service,
            self.src,
            self.dst,
            self.object_type,
            self.object_id,
            self.property_id,
            self.payload.len()
        )
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn info_request() -> Frame {
        Frame::read_request(1, 101, ObjectType::Info, 3023, PropertyId::Value)
    }

    fn write_request() -> Frame {
        Frame::write_request(1, 101, 1107, vec![0x00, 0x00, 0x80, 0x40])
    }

    #[test]
    fn test_checksum_known_values() {
        // a starts at 0xFF, so the empty span yields [0xFF, 0x00]
        assert_eq!(checksum(&[]).to_le_bytes(), [0xFF, 0x00]);
        // 0xFF + 0x01 = 0x00, b = 0x00
        assert_eq!(checksum(&[0x01]).to_le_bytes(), [0x00, 0x00]);
        // a: 0x01, 0x03 ; b: 0x01, 0x04
        assert_eq!(checksum(&[0x02, 0x02]).to_le_bytes(), [0x03, 0x04]);
    }

    #[test]
    fn test_encode_layout() {
        let bytes = info_request().encode().unwrap();

        assert_eq!(bytes.len(), 17);
        assert_eq!(bytes[0], START_BYTE);
        assert_eq!(u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]), 10);
        assert_eq!(bytes[5], 0x00); // request
        assert_eq!(bytes[6], 0x01); // read
        assert_eq!(u16::from_le_bytes([bytes[7], bytes[8]]), 1);
        assert_eq!(u16::from_le_bytes([bytes[9], bytes[10]]), 101);
        assert_eq!(bytes[11], 0x01); // info
        assert_eq!(u16::from_le_bytes([bytes[12], bytes[13]]), 3023);
        assert_eq!(bytes[14], 0x05); // value
        let crc = checksum(&bytes[5..15]);
        assert_eq!(&bytes[15..17], &crc.to_le_bytes());
    }

    #[test]
    fn test_length_field_counts_payload() {
        let frame = write_request();
        let bytes = frame.encode().unwrap();
        assert_eq!(u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]), 14);
        assert_eq!(bytes.len(), frame.wire_len());
    }

    #[test]
    fn test_roundtrip() {
        for frame in [
            info_request(),
            write_request(),
            info_request().response(ServiceId::Read, vec![0xDC, 0x05, 0x00, 0x00]),
            write_request().error_response(ScomErrorCode::AccessDenied),
            Frame {
                frame_type: FrameType::Broadcast,
                service: ServiceId::Read,
                src: 501,
                dst: 0,
                object_type: ObjectType::Message,
                object_id: 0,
                property_id: PropertyId::None,
                payload: Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]),
            },
        ] {
            let bytes = frame.encode().unwrap();
            assert_eq!(Frame::decode(&bytes).unwrap(), frame);
        }
    }

    #[test]
    fn test_multi_info_property_codes_decode() {
        for (property, code) in [(PropertyId::MultiInfo, 0x01), (PropertyId::None, 0x00)] {
            let request = Frame::request(
                ServiceId::Read,
                1,
                501,
                ObjectType::MultiInfo,
                0x0001,
                property,
                vec![0xB8, 0x0B, 0x00],
            );
            let response = request.response(ServiceId::Read, vec![0u8; 8]);
            let bytes = response.encode().unwrap();
            assert_eq!(bytes[14], code);

            let decoded = Frame::decode(&bytes).unwrap();
            assert_eq!(decoded.property_id, property);
            assert_eq!(decoded.object_type, ObjectType::MultiInfo);
        }
    }

    #[test]
    fn test_payload_byte_flip_is_checksum_error() {
        let bytes = write_request().encode().unwrap();
        let payload_start = PREFIX_LEN + BODY_HEADER_LEN;

        for i in payload_start..payload_start + 4 {
            let mut corrupted = bytes.to_vec();
            corrupted[i] ^= 0x01;
            let err = Frame::decode(&corrupted).unwrap_err();
            assert!(
                matches!(err, XcomError::Checksum { .. }),
                "byte {i}: {err:?}"
            );
        }
    }

    #[test]
    fn test_truncated_is_incomplete() {
        let bytes = write_request().encode().unwrap();
        for cut in 0..bytes.len() {
            let err = Frame::decode(&bytes[..cut]).unwrap_err();
            assert!(err.is_incomplete(), "cut at {cut}: {err:?}");
        }
    }

    #[test]
    fn test_bad_marker_and_length() {
        let mut bytes = info_request().encode().unwrap().to_vec();
        bytes[0] = 0xFF;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(XcomError::MalformedFrame(FrameDefect::BadStartMarker(0xFF)))
        ));

        let mut bytes = info_request().encode().unwrap().to_vec();
        bytes[1..5].copy_from_slice(&5u32.to_le_bytes());
        assert!(matches!(
            Frame::decode(&bytes),
            Err(XcomError::MalformedFrame(FrameDefect::BadLength(5)))
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let frame = Frame::write_request(1, 101, 1107, vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(frame.encode(), Err(XcomError::Encoding(_))));

        let frame = Frame::write_request(1, 101, 1107, vec![0u8; MAX_PAYLOAD_LEN]);
        assert!(frame.encode().is_ok());
    }

    #[test]
    fn test_error_code_extraction() {
        let rsp = info_request().error_response(ScomErrorCode::ObjectIdNotFound);
        assert!(rsp.is_response());
        assert_eq!(rsp.src, 101);
        assert_eq!(rsp.dst, 1);
        assert_eq!(rsp.error_code(), Some(ScomErrorCode::ObjectIdNotFound));
        assert_eq!(info_request().error_code(), None);
    }
}
