//! Protocol constants
//!
//! These constants define the framing bytes, message type codes, device
//! status codes, and size limits used on the VScope serial link.

// ============================================================================
// Framing
// ============================================================================

/// Sync byte that opens every frame.
pub const SYNC_BYTE: u8 = 0xC8;

/// Maximum payload bytes per frame (63 f32 values).
pub const MAX_PAYLOAD: usize = 252;

/// Smallest legal LEN field value: TYPE + CRC with an empty payload.
pub const MIN_LEN_FIELD: usize = 2;

/// Largest legal LEN field value: TYPE + MAX_PAYLOAD + CRC.
pub const MAX_LEN_FIELD: usize = MAX_PAYLOAD + 2;

/// Fixed frame overhead: sync, len, type, crc.
pub const FRAME_OVERHEAD: usize = 4;

// ============================================================================
// Message Types (host → device, echoed back on success)
// ============================================================================

/// Query static device information. First request after connecting.
pub const MSG_GET_INFO: u8 = 0x01;
/// Read the acquisition timing (divider, pre-trigger).
pub const MSG_GET_TIMING: u8 = 0x02;
/// Write the acquisition timing. Only legal while stopped.
pub const MSG_SET_TIMING: u8 = 0x03;
/// Read the device run state.
pub const MSG_GET_STATE: u8 = 0x04;
/// Request a run state change.
pub const MSG_SET_STATE: u8 = 0x05;
/// Manually fire the acquisition trigger.
pub const MSG_TRIGGER: u8 = 0x06;
/// Read one live sample frame (all channels).
pub const MSG_GET_FRAME: u8 = 0x07;
/// Read the metadata of the last completed acquisition.
pub const MSG_GET_SNAPSHOT_HEADER: u8 = 0x08;
/// Read a window of captured samples.
pub const MSG_GET_SNAPSHOT_DATA: u8 = 0x09;
/// Read a page of the variable catalog.
pub const MSG_GET_VAR_LIST: u8 = 0x0A;
/// Read the channel→variable map.
pub const MSG_GET_CHANNEL_MAP: u8 = 0x0B;
/// Write the channel→variable map.
pub const MSG_SET_CHANNEL_MAP: u8 = 0x0C;
/// Read the labels of the currently mapped channels.
pub const MSG_GET_CHANNEL_LABELS: u8 = 0x0D;
/// Read a page of the RT register catalog.
pub const MSG_GET_RT_LABELS: u8 = 0x0E;
/// Read one RT register value.
pub const MSG_GET_RT_BUFFER: u8 = 0x0F;
/// Write one RT register value.
pub const MSG_SET_RT_BUFFER: u8 = 0x10;
/// Read the trigger configuration.
pub const MSG_GET_TRIGGER: u8 = 0x11;
/// Write the trigger configuration.
pub const MSG_SET_TRIGGER: u8 = 0x12;
/// Device-reported error; payload is a single status code byte.
pub const MSG_ERROR: u8 = 0xFF;

// ============================================================================
// Device Status Codes (payload of MSG_ERROR)
// ============================================================================

/// Request payload length did not match the operation.
pub const STATUS_BAD_LEN: u8 = 1;
/// A parameter value was rejected.
pub const STATUS_BAD_PARAM: u8 = 2;
/// An index was out of range.
pub const STATUS_RANGE: u8 = 4;
/// The requested data does not exist yet (e.g. snapshot mid-acquisition).
pub const STATUS_NOT_READY: u8 = 5;

// ============================================================================
// DeviceInfo flags
// ============================================================================

/// Set when the device speaks big-endian on multi-byte payload fields.
pub const INFO_FLAG_BIG_ENDIAN: u8 = 0x01;

// ============================================================================
// Catalog paging
// ============================================================================

/// Request `count` meaning "as many entries as fit in one response".
pub const CATALOG_COUNT_ALL: u8 = 0xFF;
