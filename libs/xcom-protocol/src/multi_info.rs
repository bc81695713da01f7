//! Multi-info payloads
//!
//! One multi-info read returns up to [`MULTI_INFO_REQ_MAX`] info values in a
//! single round trip. Request items are `(u16 nr, u8 aggregation)`, response
//! items `(u16 nr, u8 aggregation, f32 value)` after an 8-byte header.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::MULTI_INFO_REQ_MAX;
use crate::error::{Result, XcomError};
use crate::types::AggregationType;

const REQ_ITEM_LEN: usize = 2 + 1;
const RSP_HEADER_LEN: usize = 4 + 4;
const RSP_ITEM_LEN: usize = 2 + 1 + 4;

/// Bits of the response flags word
pub mod flags {
    /// Set for Xcom-GSM, clear for Xcom-LAN
    pub const XCOM_GSM: u32 = 0x0000_0010;
    pub const XT_PRESENT: u32 = 0x0000_0020;
    pub const BSP_PRESENT: u32 = 0x0000_0040;
    pub const VT_PRESENT: u32 = 0x0000_0080;
    pub const VS_PRESENT: u32 = 0x0000_0100;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiInfoItem {
    pub nr: u16,
    pub aggregation: AggregationType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiInfoRequest {
    pub items: Vec<MultiInfoItem>,
}

impl MultiInfoRequest {
    pub fn new(items: Vec<MultiInfoItem>) -> Result<Self> {
        if items.is_empty() {
            return Err(XcomError::invalid_request("multi-info request without items"));
        }
        if items.len() > MULTI_INFO_REQ_MAX {
            return Err(XcomError::invalid_request(format!(
                "{} multi-info items, maximum is {MULTI_INFO_REQ_MAX}",
                items.len()
            )));
        }
        Ok(Self { items })
    }

    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.items.len() * REQ_ITEM_LEN);
        for item in &self.items {
            buf.put_u16_le(item.nr);
            buf.put_u8(item.aggregation.code());
        }
        buf.freeze()
    }

    /// Parse a request payload; a trailing partial item is ignored
    pub fn unpack(mut buf: &[u8]) -> Result<Self> {
        let mut items = Vec::with_capacity(buf.len() / REQ_ITEM_LEN);
        while buf.remaining() >= REQ_ITEM_LEN {
            let nr = buf.get_u16_le();
            let aggregation = AggregationType::try_from(buf.get_u8())?;
            items.push(MultiInfoItem { nr, aggregation });
        }
        Ok(Self { items })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultiInfoValue {
    pub nr: u16,
    pub aggregation: AggregationType,
    pub value: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultiInfoResponse {
    pub flags: u32,
    pub datetime: u32,
    pub items: Vec<MultiInfoValue>,
}

impl MultiInfoResponse {
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RSP_HEADER_LEN + self.items.len() * RSP_ITEM_LEN);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.datetime);
        for item in &self.items {
            buf.put_u16_le(item.nr);
            buf.put_u8(item.aggregation.code());
            buf.put_f32_le(item.value);
        }
        buf.freeze()
    }

    pub fn unpack(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < RSP_HEADER_LEN {
            return Err(XcomError::malformed_payload(format!(
                "multi-info response of {} bytes, header needs {RSP_HEADER_LEN}",
                buf.len()
            )));
        }
        let flags = buf.get_u32_le();
        let datetime = buf.get_u32_le();

        let mut items = Vec::with_capacity(buf.remaining() / RSP_ITEM_LEN);
        while buf.remaining() >= RSP_ITEM_LEN {
            let nr = buf.get_u16_le();
            let aggregation = AggregationType::try_from(buf.get_u8())?;
            let value = buf.get_f32_le();
            items.push(MultiInfoValue {
                nr,
                aggregation,
                value,
            });
        }

        Ok(Self {
            flags,
            datetime,
            items,
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn item(nr: u16, aggregation: AggregationType) -> MultiInfoItem {
        MultiInfoItem { nr, aggregation }
    }

    #[test]
    fn test_request_layout() {
        let req = MultiInfoRequest::new(vec![
            item(3000, AggregationType::Master),
            item(3032, AggregationType::Device(2)),
            item(7002, AggregationType::Sum),
        ])
        .unwrap();

        let bytes = req.pack();
        assert_eq!(
            bytes.as_ref(),
            &[0xB8, 0x0B, 0x00, 0xD8, 0x0B, 0x02, 0x5A, 0x1B, 0xFE]
        );
        assert_eq!(MultiInfoRequest::unpack(&bytes).unwrap(), req);
    }

    #[test]
    fn test_request_item_limits() {
        assert!(MultiInfoRequest::new(Vec::new()).is_err());

        let many = vec![item(3000, AggregationType::Master); MULTI_INFO_REQ_MAX];
        assert!(MultiInfoRequest::new(many.clone()).is_ok());

        let mut too_many = many;
        too_many.push(item(3001, AggregationType::Master));
        let err = MultiInfoRequest::new(too_many).unwrap_err();
        assert!(err.is_caller_error());
    }

    #[test]
    fn test_response_unpack() {
        let rsp = MultiInfoResponse {
            flags: flags::XT_PRESENT | flags::BSP_PRESENT,
            datetime: 1_700_000_000,
            items: vec![
                MultiInfoValue {
                    nr: 3000,
                    aggregation: AggregationType::Average,
                    value: 52.5,
                },
                MultiInfoValue {
                    nr: 7002,
                    aggregation: AggregationType::Device(1),
                    value: 95.0,
                },
            ],
        };
        let bytes = rsp.pack();
        assert_eq!(bytes.len(), 8 + 2 * 7);

        let parsed = MultiInfoResponse::unpack(&bytes).unwrap();
        assert_eq!(parsed, rsp);
        assert!(parsed.has_flag(flags::BSP_PRESENT));
        assert!(!parsed.has_flag(flags::VT_PRESENT));
    }

    #[test]
    fn test_response_short_header() {
        let err = MultiInfoResponse::unpack(&[0, 0, 0]).unwrap_err();
        assert!(matches!(err, XcomError::MalformedPayload(_)));
    }
}
