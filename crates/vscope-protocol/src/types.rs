//! Common types shared by commands and responses.

use crate::constants::*;
use crate::error::ProtocolError;
use crate::wire::ByteOrder;

/// Device run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceState {
    /// Sampling halted; configuration changes are accepted.
    Stopped = 0,
    /// Free-running capture into the ring buffer.
    Running = 1,
    /// Trigger fired; filling the post-trigger window.
    Acquiring = 2,
    /// Device-side registration was incomplete at init. Reported by the
    /// device, never requestable.
    Misconfigured = 3,
}

impl DeviceState {
    /// Decode a state byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(DeviceState::Stopped),
            1 => Ok(DeviceState::Running),
            2 => Ok(DeviceState::Acquiring),
            3 => Ok(DeviceState::Misconfigured),
            other => Err(ProtocolError::decode(format!("unknown state {other}"))),
        }
    }
}

/// Trigger edge mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TriggerMode {
    /// Automatic triggering disabled; only manual triggers fire.
    #[default]
    Disabled = 0,
    /// Fire on a rising threshold crossing.
    Rising = 1,
    /// Fire on a falling threshold crossing.
    Falling = 2,
    /// Fire on any threshold crossing.
    Both = 3,
}

impl TriggerMode {
    /// Decode a mode byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(TriggerMode::Disabled),
            1 => Ok(TriggerMode::Rising),
            2 => Ok(TriggerMode::Falling),
            3 => Ok(TriggerMode::Both),
            other => Err(ProtocolError::decode(format!("unknown trigger mode {other}"))),
        }
    }
}

/// Acquisition timing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimingConfig {
    /// Sample-tick divider applied to the device's acquisition clock.
    /// Zero is rejected by the device.
    pub divider: u32,
    /// Samples kept from before the trigger point.
    pub pre_trig: u32,
}

/// Trigger configuration.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TriggerConfig {
    /// Threshold the watched channel is compared against.
    pub threshold: f32,
    /// Channel index the trigger watches.
    pub channel: u8,
    /// Edge mode.
    pub mode: TriggerMode,
}

/// Static device information, fetched once per connection.
///
/// Immutable until the device resets; everything the host needs to size and
/// decode later responses, including the byte order the device speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Byte order for multi-byte payload fields.
    pub order: ByteOrder,
    /// Number of capture channels.
    pub channels: u8,
    /// Capture buffer depth in samples.
    pub depth: u16,
    /// Acquisition tick rate in kHz.
    pub tick_khz: u16,
    /// Number of registered acquisition variables.
    pub var_count: u8,
    /// Number of registered RT registers.
    pub rt_count: u8,
    /// RT register slots available on the device.
    pub rt_capacity: u8,
    /// Width of every fixed name slot, in bytes.
    pub name_len: u8,
    /// Device name.
    pub name: String,
}

impl DeviceInfo {
    /// Context needed to decode responses sized by this device's geometry.
    pub fn decode_ctx(&self) -> DecodeCtx {
        DecodeCtx {
            order: self.order,
            channels: self.channels,
            name_len: self.name_len,
        }
    }

    /// Samples per GetSnapshotData response for this device.
    pub fn snapshot_chunk_samples(&self) -> u16 {
        if self.channels == 0 {
            return 0;
        }
        (MAX_PAYLOAD / (self.channels as usize * 4)) as u16
    }
}

/// Per-device decode context derived from [`DeviceInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeCtx {
    /// Byte order for multi-byte fields.
    pub order: ByteOrder,
    /// Number of capture channels.
    pub channels: u8,
    /// Width of fixed name slots.
    pub name_len: u8,
}

/// One named catalog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Device-local index.
    pub index: u8,
    /// Entry name.
    pub name: String,
}

/// One page of a paged catalog response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogPage {
    /// Total entries the device currently declares.
    pub total: u8,
    /// Index of the first entry in this page.
    pub start: u8,
    /// Entries carried by this page.
    pub entries: Vec<CatalogEntry>,
}

/// Metadata of a completed acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotHeader {
    /// Channel→variable map at capture time.
    pub channel_map: Vec<u8>,
    /// Timing at capture time.
    pub timing: TimingConfig,
    /// Trigger configuration at capture time.
    pub trigger: TriggerConfig,
    /// RT register values latched when the acquisition armed.
    pub rt_values: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_decode_bounds() {
        assert_eq!(DeviceState::from_u8(0).unwrap(), DeviceState::Stopped);
        assert_eq!(DeviceState::from_u8(3).unwrap(), DeviceState::Misconfigured);
        assert!(DeviceState::from_u8(4).is_err());
    }

    #[test]
    fn snapshot_chunk_sizing() {
        let info = DeviceInfo {
            order: ByteOrder::Little,
            channels: 5,
            depth: 1000,
            tick_khz: 20,
            var_count: 8,
            rt_count: 4,
            rt_capacity: 16,
            name_len: 16,
            name: "bench".into(),
        };
        // 252 / (5 * 4) = 12 samples per chunk.
        assert_eq!(info.snapshot_chunk_samples(), 12);
    }
}
