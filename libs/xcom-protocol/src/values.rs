//! Value coder
//!
//! Converts between logical values and the payload bytes of a frame, driven
//! by the datapoint's format and scale.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::fmt;
use tracing::trace;
use uuid::Uuid;

use crate::datapoint::Datapoint;
use crate::error::{Result, XcomError};
use crate::types::XcomFormat;

/// A decoded datapoint value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum XcomValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Enum(u32),
    String(String),
    Guid(Uuid),
    Bytes(Vec<u8>),
}

impl XcomValue {
    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            XcomValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            XcomValue::Int(i) => Some(*i as f64),
            XcomValue::Float(f) => Some(*f),
            XcomValue::Enum(e) => Some(f64::from(*e)),
            _ => None,
        }
    }

    fn shape(&self) -> &'static str {
        match self {
            XcomValue::Bool(_) => "bool",
            XcomValue::Int(_) => "integer",
            XcomValue::Float(_) => "float",
            XcomValue::Enum(_) => "enum",
            XcomValue::String(_) => "string",
            XcomValue::Guid(_) => "guid",
            XcomValue::Bytes(_) => "bytes",
        }
    }
}

impl fmt::Display for XcomValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XcomValue::Bool(b) => write!(f, "{b}"),
            XcomValue::Int(i) => write!(f, "{i}"),
            XcomValue::Float(v) => write!(f, "{v}"),
            XcomValue::Enum(e) => write!(f, "{e}"),
            XcomValue::String(s) => write!(f, "{s}"),
            XcomValue::Guid(g) => write!(f, "{g}"),
            XcomValue::Bytes(b) => write!(f, "{b:02X?}"),
        }
    }
}

impl From<bool> for XcomValue {
    fn from(v: bool) -> Self {
        XcomValue::Bool(v)
    }
}

impl From<i64> for XcomValue {
    fn from(v: i64) -> Self {
        XcomValue::Int(v)
    }
}

impl From<f64> for XcomValue {
    fn from(v: f64) -> Self {
        XcomValue::Float(v)
    }
}

impl From<&str> for XcomValue {
    fn from(v: &str) -> Self {
        XcomValue::String(v.to_string())
    }
}

fn mismatch(dp: &Datapoint, value: &XcomValue) -> XcomError {
    XcomError::type_mismatch(format!(
        "{} value for {} datapoint {}",
        value.shape(),
        dp.format,
        dp.nr
    ))
}

/// Logical number to scaled wire integer within `[min, max]`
fn scaled_integer(dp: &Datapoint, value: &XcomValue, min: f64, max: f64) -> Result<i64> {
    let logical = match value {
        XcomValue::Int(i) => *i as f64,
        XcomValue::Float(f) => *f,
        other => return Err(mismatch(dp, other)),
    };
    let wire = (logical * dp.scale).round();
    if !wire.is_finite() || wire < min || wire > max {
        return Err(XcomError::value_out_of_range(format!(
            "{logical} x {} does not fit {} for datapoint {}",
            dp.scale, dp.format, dp.nr
        )));
    }
    Ok(wire as i64)
}

/// Enumeration value within `[0, max]`
fn enum_value(dp: &Datapoint, value: &XcomValue, max: u32) -> Result<u32> {
    let raw = match value {
        XcomValue::Enum(e) => i64::from(*e),
        XcomValue::Int(i) => *i,
        other => return Err(mismatch(dp, other)),
    };
    if raw < 0 || raw > i64::from(max) {
        return Err(XcomError::value_out_of_range(format!(
            "{raw} is not a valid {} for datapoint {}",
            dp.format, dp.nr
        )));
    }
    Ok(raw as u32)
}

/// Encode a logical value into payload bytes
pub fn encode(dp: &Datapoint, value: &XcomValue) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(dp.format.fixed_width().unwrap_or(16));

    match dp.format {
        XcomFormat::Bool => {
            let b = match value {
                XcomValue::Bool(b) => *b,
                XcomValue::Int(0) => false,
                XcomValue::Int(1) => true,
                XcomValue::Int(i) => {
                    return Err(XcomError::value_out_of_range(format!(
                        "{i} is not a boolean for datapoint {}",
                        dp.nr
                    )))
                },
                other => return Err(mismatch(dp, other)),
            };
            buf.put_u8(u8::from(b));
        },
        XcomFormat::Format => {
            let wire = scaled_integer(dp, value, 0.0, f64::from(u16::MAX))?;
            buf.put_u16_le(wire as u16);
        },
        XcomFormat::Int32 => {
            let wire = scaled_integer(dp, value, f64::from(i32::MIN), f64::from(i32::MAX))?;
            buf.put_i32_le(wire as i32);
        },
        XcomFormat::Float => {
            let f = match value {
                XcomValue::Float(f) => *f,
                XcomValue::Int(i) => *i as f64,
                other => return Err(mismatch(dp, other)),
            };
            if !f.is_finite() || f.abs() > f64::from(f32::MAX) {
                return Err(XcomError::value_out_of_range(format!(
                    "{f} does not fit FLOAT for datapoint {}",
                    dp.nr
                )));
            }
            buf.put_f32_le(f as f32);
        },
        XcomFormat::ShortEnum | XcomFormat::Error => {
            let e = enum_value(dp, value, u32::from(u16::MAX))?;
            buf.put_u16_le(e as u16);
        },
        XcomFormat::LongEnum => {
            let e = enum_value(dp, value, u32::MAX)?;
            buf.put_u32_le(e);
        },
        XcomFormat::Guid => {
            let guid = match value {
                XcomValue::Guid(g) => *g,
                XcomValue::String(s) => Uuid::parse_str(s).map_err(|e| {
                    XcomError::type_mismatch(format!("invalid guid '{s}': {e}"))
                })?,
                other => return Err(mismatch(dp, other)),
            };
            buf.put_slice(&guid.as_u128().to_le_bytes());
        },
        XcomFormat::String => {
            let XcomValue::String(s) = value else {
                return Err(mismatch(dp, value));
            };
            let mut bytes = iso8859_15::encode(s).ok_or_else(|| {
                XcomError::value_out_of_range(format!(
                    "'{s}' is not representable in ISO-8859-15"
                ))
            })?;
            if let Some(width) = dp.len {
                if bytes.len() > width {
                    return Err(XcomError::value_out_of_range(format!(
                        "string of {} bytes exceeds width {width} of datapoint {}",
                        bytes.len(),
                        dp.nr
                    )));
                }
                bytes.resize(width, 0);
            }
            buf.put_slice(&bytes);
        },
        XcomFormat::Dynamic | XcomFormat::Bytes => match value {
            XcomValue::Bytes(b) => buf.put_slice(b),
            other => return Err(mismatch(dp, other)),
        },
        XcomFormat::Menu | XcomFormat::Invalid => {
            return Err(XcomError::type_mismatch(format!(
                "datapoint {} of format {} carries no value",
                dp.nr, dp.format
            )))
        },
    }

    Ok(buf.freeze())
}

fn scaled(dp: &Datapoint, wire: i64) -> XcomValue {
    if dp.scale == 1.0 {
        XcomValue::Int(wire)
    } else {
        XcomValue::Float(wire as f64 / dp.scale)
    }
}

/// Decode payload bytes into a logical value
pub fn decode(dp: &Datapoint, payload: &[u8]) -> Result<XcomValue> {
    if let Some(width) = dp.format.fixed_width() {
        if payload.len() < width {
            return Err(XcomError::malformed_payload(format!(
                "{} needs {width} bytes, got {} for datapoint {}",
                dp.format,
                payload.len(),
                dp.nr
            )));
        }
        if payload.len() > width {
            trace!(
                nr = dp.nr,
                extra = payload.len() - width,
                "Ignoring trailing payload bytes"
            );
        }
    }

    let le2 = |p: &[u8]| [p[0], p[1]];
    let le4 = |p: &[u8]| [p[0], p[1], p[2], p[3]];

    Ok(match dp.format {
        XcomFormat::Bool => XcomValue::Bool(payload[0] != 0),
        XcomFormat::Format => scaled(dp, i64::from(u16::from_le_bytes(le2(payload)))),
        XcomFormat::Int32 => scaled(dp, i64::from(i32::from_le_bytes(le4(payload)))),
        XcomFormat::Float => XcomValue::Float(f64::from(f32::from_le_bytes(le4(payload)))),
        XcomFormat::ShortEnum | XcomFormat::Error => {
            XcomValue::Enum(u32::from(u16::from_le_bytes(le2(payload))))
        },
        XcomFormat::LongEnum => XcomValue::Enum(u32::from_le_bytes(le4(payload))),
        XcomFormat::Guid => {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&payload[..16]);
            XcomValue::Guid(Uuid::from_u128(u128::from_le_bytes(raw)))
        },
        XcomFormat::String => {
            let end = payload
                .iter()
                .rposition(|&b| b != 0)
                .map_or(0, |pos| pos + 1);
            XcomValue::String(iso8859_15::decode(&payload[..end]))
        },
        XcomFormat::Dynamic | XcomFormat::Bytes => XcomValue::Bytes(payload.to_vec()),
        XcomFormat::Menu | XcomFormat::Invalid => {
            return Err(XcomError::type_mismatch(format!(
                "datapoint {} of format {} carries no value",
                dp.nr, dp.format
            )))
        },
    })
}

/// Convert a float reported by a multi-info response to the datapoint's shape
pub fn cast_float(dp: &Datapoint, value: f32) -> Result<XcomValue> {
    let v = f64::from(value);
    Ok(match dp.format {
        XcomFormat::Bool => XcomValue::Bool(v != 0.0),
        XcomFormat::Format | XcomFormat::Int32 => XcomValue::Int(v as i64),
        XcomFormat::ShortEnum | XcomFormat::Error | XcomFormat::LongEnum => {
            XcomValue::Enum(v as u32)
        },
        XcomFormat::Float => XcomValue::Float(v),
        other => {
            return Err(XcomError::type_mismatch(format!(
                "{other} datapoint {} cannot come from a float",
                dp.nr
            )))
        },
    })
}

/// ISO-8859-15: Latin-1 with eight code points replaced
mod iso8859_15 {
    const REPLACED: [(u8, char); 8] = [
        (0xA4, '\u{20AC}'),
        (0xA6, '\u{0160}'),
        (0xA8, '\u{0161}'),
        (0xB4, '\u{017D}'),
        (0xB8, '\u{017E}'),
        (0xBC, '\u{0152}'),
        (0xBD, '\u{0153}'),
        (0xBE, '\u{0178}'),
    ];

    pub fn decode(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|&b| {
                REPLACED
                    .iter()
                    .find(|(code, _)| *code == b)
                    .map_or(char::from(b), |(_, c)| *c)
            })
            .collect()
    }

    pub fn encode(s: &str) -> Option<Vec<u8>> {
        s.chars()
            .map(|c| {
                if let Some((code, _)) = REPLACED.iter().find(|(_, r)| *r == c) {
                    return Some(*code);
                }
                let cp = u32::from(c);
                if cp > 0xFF {
                    return None;
                }
                let b = cp as u8;
                // Latin-1 characters displaced by the replacements
                if REPLACED.iter().any(|(code, _)| *code == b) {
                    return None;
                }
                Some(b)
            })
            .collect()
    }
}
