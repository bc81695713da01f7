//! Xcom protocol code tables
//!
//! Numeric codes carried in frame headers and payloads, plus the catalog-level
//! enumerations (access level, value format) they are derived from.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{FrameDefect, XcomError};

// ============================================================================
// Frame header codes
// ============================================================================

/// Frame type (direction of the message)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Request,
    Response,
    Broadcast,
}

impl FrameType {
    pub fn code(self) -> u8 {
        match self {
            FrameType::Request => 0x00,
            FrameType::Response => 0x02,
            FrameType::Broadcast => 0x04,
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = XcomError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameType::Request),
            0x02 => Ok(FrameType::Response),
            0x04 => Ok(FrameType::Broadcast),
            _ => Err(XcomError::MalformedFrame(FrameDefect::UnknownCode {
                field: "frame type",
                value,
            })),
        }
    }
}

/// Service identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceId {
    Read,
    Write,
    Ack,
    Error,
}

impl ServiceId {
    pub fn code(self) -> u8 {
        match self {
            ServiceId::Read => 0x01,
            ServiceId::Write => 0x02,
            ServiceId::Ack => 0x03,
            ServiceId::Error => 0x04,
        }
    }
}

impl TryFrom<u8> for ServiceId {
    type Error = XcomError;

    fn try_from(value: u8) -> Result<Self, XcomError> {
        match value {
            0x01 => Ok(ServiceId::Read),
            0x02 => Ok(ServiceId::Write),
            0x03 => Ok(ServiceId::Ack),
            0x04 => Ok(ServiceId::Error),
            _ => Err(XcomError::MalformedFrame(FrameDefect::UnknownCode {
                field: "service",
                value,
            })),
        }
    }
}

/// Object type addressed by a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Info,
    Parameter,
    Message,
    Guid,
    Datalog,
    MultiInfo,
}

impl ObjectType {
    pub fn code(self) -> u8 {
        match self {
            ObjectType::Info => 0x01,
            ObjectType::Parameter => 0x02,
            ObjectType::Message => 0x03,
            ObjectType::Guid => 0x04,
            ObjectType::Datalog => 0x05,
            ObjectType::MultiInfo => 0x0A,
        }
    }
}

impl TryFrom<u8> for ObjectType {
    type Error = XcomError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ObjectType::Info),
            0x02 => Ok(ObjectType::Parameter),
            0x03 => Ok(ObjectType::Message),
            0x04 => Ok(ObjectType::Guid),
            0x05 => Ok(ObjectType::Datalog),
            0x0A => Ok(ObjectType::MultiInfo),
            _ => Err(XcomError::MalformedFrame(FrameDefect::UnknownCode {
                field: "object type",
                value,
            })),
        }
    }
}

/// Property of the addressed object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyId {
    None,
    /// Property of multi-info reads; older gateways also accept `None`
    MultiInfo,
    Value,
    Min,
    Max,
    Level,
    Default,
    UnsavedValue,
}

impl PropertyId {
    pub fn code(self) -> u8 {
        match self {
            PropertyId::None => 0x00,
            PropertyId::MultiInfo => 0x01,
            PropertyId::Value => 0x05,
            PropertyId::Min => 0x06,
            PropertyId::Max => 0x07,
            PropertyId::Level => 0x08,
            PropertyId::Default => 0x09,
            PropertyId::UnsavedValue => 0x0D,
        }
    }
}

impl TryFrom<u8> for PropertyId {
    type Error = XcomError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PropertyId::None),
            0x01 => Ok(PropertyId::MultiInfo),
            0x05 => Ok(PropertyId::Value),
            0x06 => Ok(PropertyId::Min),
            0x07 => Ok(PropertyId::Max),
            0x08 => Ok(PropertyId::Level),
            0x09 => Ok(PropertyId::Default),
            0x0D => Ok(PropertyId::UnsavedValue),
            _ => Err(XcomError::MalformedFrame(FrameDefect::UnknownCode {
                field: "property",
                value,
            })),
        }
    }
}

// ============================================================================
// Device error codes
// ============================================================================

/// Error code carried in the payload of an error-service response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScomErrorCode {
    NoError,
    InvalidFrame,
    DeviceNotFound,
    ResponseTimeout,
    ServiceNotSupported,
    InvalidServiceArgument,
    GatewayBusy,
    TypeNotSupported,
    ObjectIdNotFound,
    PropertyNotSupported,
    InvalidDataLength,
    PropertyIsReadOnly,
    InvalidData,
    DataTooSmall,
    DataTooBig,
    WritePropertyFailed,
    ReadPropertyFailed,
    AccessDenied,
    ObjectNotSupported,
    MulticastReadNotSupported,
    ObjectPropertyInvalid,
    FileOrDirNotPresent,
    FileCorrupted,
    InvalidShellArg,
    Other(u16),
}

impl From<u16> for ScomErrorCode {
    fn from(code: u16) -> Self {
        match code {
            0x0000 => Self::NoError,
            0x0001 => Self::InvalidFrame,
            0x0002 => Self::DeviceNotFound,
            0x0003 => Self::ResponseTimeout,
            0x0011 => Self::ServiceNotSupported,
            0x0012 => Self::InvalidServiceArgument,
            0x0013 => Self::GatewayBusy,
            0x0021 => Self::TypeNotSupported,
            0x0022 => Self::ObjectIdNotFound,
            0x0023 => Self::PropertyNotSupported,
            0x0024 => Self::InvalidDataLength,
            0x0025 => Self::PropertyIsReadOnly,
            0x0026 => Self::InvalidData,
            0x0027 => Self::DataTooSmall,
            0x0028 => Self::DataTooBig,
            0x0029 => Self::WritePropertyFailed,
            0x002A => Self::ReadPropertyFailed,
            0x002B => Self::AccessDenied,
            0x002C => Self::ObjectNotSupported,
            0x002D => Self::MulticastReadNotSupported,
            0x002E => Self::ObjectPropertyInvalid,
            0x002F => Self::FileOrDirNotPresent,
            0x0030 => Self::FileCorrupted,
            0x0081 => Self::InvalidShellArg,
            other => Self::Other(other),
        }
    }
}

impl ScomErrorCode {
    pub fn code(self) -> u16 {
        match self {
            Self::NoError => 0x0000,
            Self::InvalidFrame => 0x0001,
            Self::DeviceNotFound => 0x0002,
            Self::ResponseTimeout => 0x0003,
            Self::ServiceNotSupported => 0x0011,
            Self::InvalidServiceArgument => 0x0012,
            Self::GatewayBusy => 0x0013,
            Self::TypeNotSupported => 0x0021,
            Self::ObjectIdNotFound => 0x0022,
            Self::PropertyNotSupported => 0x0023,
            Self::InvalidDataLength => 0x0024,
            Self::PropertyIsReadOnly => 0x0025,
            Self::InvalidData => 0x0026,
            Self::DataTooSmall => 0x0027,
            Self::DataTooBig => 0x0028,
            Self::WritePropertyFailed => 0x0029,
            Self::ReadPropertyFailed => 0x002A,
            Self::AccessDenied => 0x002B,
            Self::ObjectNotSupported => 0x002C,
            Self::MulticastReadNotSupported => 0x002D,
            Self::ObjectPropertyInvalid => 0x002E,
            Self::FileOrDirNotPresent => 0x002F,
            Self::FileCorrupted => 0x0030,
            Self::InvalidShellArg => 0x0081,
            Self::Other(code) => code,
        }
    }

    /// Device reports that the addressed object does not exist on it
    pub fn is_absent(self) -> bool {
        matches!(
            self,
            Self::ObjectIdNotFound
                | Self::ObjectNotSupported
                | Self::PropertyNotSupported
                | Self::TypeNotSupported
        )
    }
}

impl fmt::Display for ScomErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "unknown error 0x{code:04X}"),
            known => write!(f, "{known:?} (0x{:04X})", known.code()),
        }
    }
}

// ============================================================================
// Catalog enumerations
// ============================================================================

/// Access level of a datapoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum XcomLevel {
    Info,
    ViewOnly,
    Basic,
    Expert,
    Installer,
    Qsp,
}

impl XcomLevel {
    /// Level code as reported by the level property
    pub fn code(self) -> u16 {
        match self {
            XcomLevel::Info => 0x0001,
            XcomLevel::ViewOnly => 0x0000,
            XcomLevel::Basic => 0x0010,
            XcomLevel::Expert => 0x0020,
            XcomLevel::Installer => 0x0030,
            XcomLevel::Qsp => 0x0040,
        }
    }
}

impl FromStr for XcomLevel {
    type Err = XcomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "INFO" => Ok(XcomLevel::Info),
            "VO" | "V.O." => Ok(XcomLevel::ViewOnly),
            "BASIC" => Ok(XcomLevel::Basic),
            "EXPERT" => Ok(XcomLevel::Expert),
            "INST" | "INST." => Ok(XcomLevel::Installer),
            "QSP" => Ok(XcomLevel::Qsp),
            other => Err(XcomError::config(format!("Unknown level: '{other}'"))),
        }
    }
}

impl TryFrom<String> for XcomLevel {
    type Error = XcomError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<XcomLevel> for String {
    fn from(level: XcomLevel) -> Self {
        level.to_string()
    }
}

impl fmt::Display for XcomLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            XcomLevel::Info => "INFO",
            XcomLevel::ViewOnly => "V.O.",
            XcomLevel::Basic => "BASIC",
            XcomLevel::Expert => "EXPERT",
            XcomLevel::Installer => "INST.",
            XcomLevel::Qsp => "QSP",
        };
        write!(f, "{}", s)
    }
}

/// Value format of a datapoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum XcomFormat {
    Bool,
    Format,
    ShortEnum,
    Error,
    Int32,
    Float,
    LongEnum,
    Guid,
    String,
    Dynamic,
    Bytes,
    Menu,
    Invalid,
}

impl XcomFormat {
    /// Fixed wire width, `None` for variable-length and value-less formats
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            Self::Bool => Some(1),
            Self::Format | Self::ShortEnum | Self::Error => Some(2),
            Self::Int32 | Self::Float | Self::LongEnum => Some(4),
            Self::Guid => Some(16),
            Self::String | Self::Dynamic | Self::Bytes | Self::Menu | Self::Invalid => None,
        }
    }

    /// Integer formats the scale factor applies to
    pub fn is_scaled(&self) -> bool {
        matches!(self, Self::Format | Self::Int32)
    }

    pub fn is_enum(&self) -> bool {
        matches!(self, Self::ShortEnum | Self::LongEnum | Self::Error)
    }

    /// Formats that carry no value at all
    pub fn is_valueless(&self) -> bool {
        matches!(self, Self::Menu | Self::Invalid)
    }
}

impl FromStr for XcomFormat {
    type Err = XcomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BOOL" => Ok(Self::Bool),
            "FORMAT" => Ok(Self::Format),
            "SHORT_ENUM" | "SHORT ENUM" => Ok(Self::ShortEnum),
            "ERROR" => Ok(Self::Error),
            "INT32" => Ok(Self::Int32),
            "FLOAT" => Ok(Self::Float),
            "LONG_ENUM" | "LONG ENUM" => Ok(Self::LongEnum),
            "GUID" => Ok(Self::Guid),
            "STRING" => Ok(Self::String),
            "DYNAMIC" => Ok(Self::Dynamic),
            "BYTES" => Ok(Self::Bytes),
            "MENU" | "ONLY_LEVEL" | "ONLY LEVEL" => Ok(Self::Menu),
            "NOT SUPPORTED" | "INVALID" => Ok(Self::Invalid),
            other => Err(XcomError::config(format!("Unknown format: '{other}'"))),
        }
    }
}

impl TryFrom<String> for XcomFormat {
    type Error = XcomError;

    fn try_from(value: String) -> Result<Self, XcomError> {
        value.parse()
    }
}

impl From<XcomFormat> for String {
    fn from(format: XcomFormat) -> Self {
        format.to_string()
    }
}

impl fmt::Display for XcomFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bool => "BOOL",
            Self::Format => "FORMAT",
            Self::ShortEnum => "SHORT ENUM",
            Self::Error => "ERROR",
            Self::Int32 => "INT32",
            Self::Float => "FLOAT",
            Self::LongEnum => "LONG ENUM",
            Self::Guid => "GUID",
            Self::String => "STRING",
            Self::Dynamic => "DYNAMIC",
            Self::Bytes => "BYTES",
            Self::Menu => "MENU",
            Self::Invalid => "INVALID",
        };
        write!(f, "{}", s)
    }
}

/// Aggregation selector used by multi-info requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregationType {
    Master,
    /// Single device, 1-based index (1..=15)
    Device(u8),
    Average,
    Sum,
}

impl AggregationType {
    pub fn code(self) -> u8 {
        match self {
            AggregationType::Master => 0x00,
            AggregationType::Device(idx) => idx,
            AggregationType::Average => 0xFD,
            AggregationType::Sum => 0xFE,
        }
    }
}

impl TryFrom<u8> for AggregationType {
    type Error = XcomError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(AggregationType::Master),
            0x01..=0x0F => Ok(AggregationType::Device(value)),
            0xFD => Ok(AggregationType::Average),
            0xFE => Ok(AggregationType::Sum),
            _ => Err(XcomError::malformed_payload(format!(
                "unknown aggregation type 0x{value:02X}"
            ))),
        }
    }
}
