//! Requests that can be sent to a device.

use crate::constants::*;
use crate::types::{DeviceState, TriggerConfig, TimingConfig};
use crate::wire::ByteOrder;

/// Requests understood by the device.
///
/// `encode` produces the TYPE+PAYLOAD bytes; framing (sync, length, CRC) is
/// added by the frame codec. Multi-byte fields are written in the device's
/// negotiated byte order.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Query static device information. First request after connecting.
    GetInfo,

    /// Read the acquisition timing.
    GetTiming,

    /// Write the acquisition timing. Only legal while the device is stopped.
    SetTiming(TimingConfig),

    /// Read the run state.
    GetState,

    /// Request a run state change.
    SetState {
        /// Requested state. Acquiring arms an acquisition from Running.
        state: DeviceState,
    },

    /// Manually fire the acquisition trigger.
    Trigger,

    /// Read one live sample frame (all channels).
    GetFrame,

    /// Read the metadata of the last completed acquisition.
    GetSnapshotHeader,

    /// Read a window of captured samples.
    GetSnapshotData {
        /// First sample index.
        start: u16,
        /// Number of samples (bounded by what fits in one response).
        count: u8,
    },

    /// Read a page of the variable catalog.
    GetVarList {
        /// First entry index.
        start: u8,
        /// Entry count; [`CATALOG_COUNT_ALL`] means "as many as fit".
        count: u8,
    },

    /// Read the channel→variable map.
    GetChannelMap,

    /// Write the channel→variable map (one variable index per channel).
    SetChannelMap {
        /// Variable index for each channel, in channel order.
        map: Vec<u8>,
    },

    /// Read the labels of the currently mapped channels.
    GetChannelLabels,

    /// Read a page of the RT register catalog.
    GetRtLabels {
        /// First entry index.
        start: u8,
        /// Entry count; [`CATALOG_COUNT_ALL`] means "as many as fit".
        count: u8,
    },

    /// Read one RT register value.
    GetRtBuffer {
        /// Register index.
        index: u8,
    },

    /// Write one RT register value.
    SetRtBuffer {
        /// Register index.
        index: u8,
        /// Value to store.
        value: f32,
    },

    /// Read the trigger configuration.
    GetTrigger,

    /// Write the trigger configuration.
    SetTrigger(TriggerConfig),
}

impl Command {
    /// Get the message type code for this command.
    pub fn code(&self) -> u8 {
        match self {
            Command::GetInfo => MSG_GET_INFO,
            Command::GetTiming => MSG_GET_TIMING,
            Command::SetTiming(_) => MSG_SET_TIMING,
            Command::GetState => MSG_GET_STATE,
            Command::SetState { .. } => MSG_SET_STATE,
            Command::Trigger => MSG_TRIGGER,
            Command::GetFrame => MSG_GET_FRAME,
            Command::GetSnapshotHeader => MSG_GET_SNAPSHOT_HEADER,
            Command::GetSnapshotData { .. } => MSG_GET_SNAPSHOT_DATA,
            Command::GetVarList { .. } => MSG_GET_VAR_LIST,
            Command::GetChannelMap => MSG_GET_CHANNEL_MAP,
            Command::SetChannelMap { .. } => MSG_SET_CHANNEL_MAP,
            Command::GetChannelLabels => MSG_GET_CHANNEL_LABELS,
            Command::GetRtLabels { .. } => MSG_GET_RT_LABELS,
            Command::GetRtBuffer { .. } => MSG_GET_RT_BUFFER,
            Command::SetRtBuffer { .. } => MSG_SET_RT_BUFFER,
            Command::GetTrigger => MSG_GET_TRIGGER,
            Command::SetTrigger(_) => MSG_SET_TRIGGER,
        }
    }

    /// Whether this command changes device state.
    ///
    /// State-changing commands are not assumed idempotent: after a timeout
    /// their effect is unconfirmed and callers must not blindly reissue them.
    pub fn is_state_changing(&self) -> bool {
        matches!(
            self,
            Command::SetTiming(_)
                | Command::SetState { .. }
                | Command::Trigger
                | Command::SetChannelMap { .. }
                | Command::SetRtBuffer { .. }
                | Command::SetTrigger(_)
        )
    }

    /// Encode the command into TYPE+PAYLOAD bytes.
    pub fn encode(&self, order: ByteOrder) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_PAYLOAD + 1);
        buf.push(self.code());

        match self {
            Command::GetInfo
            | Command::GetTiming
            | Command::GetState
            | Command::Trigger
            | Command::GetFrame
            | Command::GetSnapshotHeader
            | Command::GetChannelMap
            | Command::GetChannelLabels
            | Command::GetTrigger => {}

            Command::SetTiming(timing) => {
                order.put_u32(&mut buf, timing.divider);
                order.put_u32(&mut buf, timing.pre_trig);
            }

            Command::SetState { state } => {
                buf.push(*state as u8);
            }

            Command::GetSnapshotData { start, count } => {
                order.put_u16(&mut buf, *start);
                buf.push(*count);
            }

            Command::GetVarList { start, count } | Command::GetRtLabels { start, count } => {
                buf.push(*start);
                buf.push(*count);
            }

            Command::SetChannelMap { map } => {
                buf.extend_from_slice(map);
            }

            Command::GetRtBuffer { index } => {
                buf.push(*index);
            }

            Command::SetRtBuffer { index, value } => {
                buf.push(*index);
                order.put_f32(&mut buf, *value);
            }

            Command::SetTrigger(trigger) => {
                order.put_f32(&mut buf, trigger.threshold);
                buf.push(trigger.channel);
                buf.push(trigger.mode as u8);
            }
        }

        buf
    }
}
