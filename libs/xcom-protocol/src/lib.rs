//! Xcom protocol core
//!
//! Pure, I/O-free pieces of the Studer Xcom protocol:
//!
//! - frame codec with checksum ([`frame`])
//! - stream reassembly ([`frame_buffer`])
//! - device families and wire addresses ([`address`])
//! - datapoint catalog ([`datapoint`]) and value coder ([`values`])
//! - multi-info and device message payloads, message texts
//!
//! The transport lives in `xcom-link`.

pub mod address;
pub mod constants;
pub mod datapoint;
pub mod error;
pub mod frame;
pub mod frame_buffer;
pub mod message;
pub mod multi_info;
pub mod types;
pub mod values;

pub use address::{standard_families, AddressBook, BatteryKind, DeviceFamily, DeviceInstance};
pub use datapoint::{Datapoint, DatapointCatalog, XcomDataset, XcomVoltage};
pub use error::{FrameDefect, Result, XcomError};
pub use frame::{checksum, Frame};
pub use frame_buffer::{FrameBuffer, Inbound};
pub use message::{DeviceMessage, MessageDef, XcomMessageSet};
pub use multi_info::{MultiInfoItem, MultiInfoRequest, MultiInfoResponse, MultiInfoValue};
pub use types::{
    AggregationType, FrameType, ObjectType, PropertyId, ScomErrorCode, ServiceId, XcomFormat,
    XcomLevel,
};
pub use values::XcomValue;
