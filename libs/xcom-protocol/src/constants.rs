//! Xcom protocol constants

/// First byte of every frame
pub const START_BYTE: u8 = 0xAA;

/// Start marker + length field
pub const PREFIX_LEN: usize = 1 + 4;

/// Trailing checksum
pub const CHECKSUM_LEN: usize = 2;

/// Frame type through property id (the fixed part of the checksummed span)
pub const BODY_HEADER_LEN: usize = 1 + 1 + 2 + 2 + 1 + 2 + 1;

/// Largest accepted length field
pub const MAX_BODY_LEN: usize = 1024;

/// Largest payload that fits a frame
pub const MAX_PAYLOAD_LEN: usize = MAX_BODY_LEN - BODY_HEADER_LEN;

/// Smallest possible frame on the wire
pub const MIN_FRAME_LEN: usize = PREFIX_LEN + BODY_HEADER_LEN + CHECKSUM_LEN;

/// Address used by this engine as frame source
pub const DEFAULT_SOURCE_ADDRESS: u16 = 1;

/// Broadcast destination
pub const BROADCAST_ADDRESS: u16 = 0;

/// Gateway TCP port (Xcom-LAN / Moxa default)
pub const DEFAULT_PORT: u16 = 4001;

/// Object id of the multi-info object
pub const MULTI_INFO_OBJECT_ID: u16 = 0x0001;

/// Maximum number of items in one multi-info request
pub const MULTI_INFO_REQ_MAX: usize = 76;

/// Menu root
pub const MENU_ROOT: u16 = 0;
