//! Decoding of device responses.
//!
//! A response buffer is TYPE+PAYLOAD with framing already stripped and CRC
//! already verified. The leading byte is either the echoed request type or
//! [`MSG_ERROR`](crate::constants::MSG_ERROR) carrying a one-byte status
//! code, so every decode goes through [`response_payload`] first.

use log::error;

use crate::constants::*;
use crate::error::{DeviceStatus, ProtocolError};
use crate::types::*;
use crate::wire::{read_name, ByteOrder};

/// Split a response into its payload after checking for a device error.
///
/// Returns the payload bytes when the leading TYPE byte matches `expected`.
/// A device error frame decodes into [`ProtocolError::Device`]; any other
/// type mismatch is a protocol violation.
pub fn response_payload(expected: u8, response: &[u8]) -> Result<&[u8], ProtocolError> {
    let (&msg_type, payload) = response.split_first().ok_or(ProtocolError::TooShort {
        expected: 1,
        actual: 0,
    })?;

    if msg_type == MSG_ERROR {
        let code = payload.first().copied().ok_or(ProtocolError::TooShort {
            expected: 2,
            actual: response.len(),
        })?;
        return Err(ProtocolError::Device(DeviceStatus::from(code)));
    }

    if msg_type != expected {
        return Err(ProtocolError::UnexpectedType {
            expected,
            actual: msg_type,
        });
    }

    Ok(payload)
}

fn require_len(payload: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if payload.len() < expected {
        return Err(ProtocolError::TooShort {
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn require_exact(payload: &[u8], expected: usize, what: &str) -> Result<(), ProtocolError> {
    if payload.len() != expected {
        let err = ProtocolError::decode(format!(
            "{what}: expected {expected} bytes, got {}",
            payload.len()
        ));
        error!("structural decode failure: {err}");
        return Err(err);
    }
    Ok(())
}

/// Decode a GetInfo response payload.
///
/// Self-describing: the flags byte at offset 0 declares the byte order used
/// for the rest of this payload and for every later transaction, so no
/// context is needed.
pub fn decode_info(payload: &[u8]) -> Result<DeviceInfo, ProtocolError> {
    require_len(payload, 10)?;

    let flags = payload[0];
    let order = if flags & INFO_FLAG_BIG_ENDIAN != 0 {
        ByteOrder::Big
    } else {
        ByteOrder::Little
    };

    let name_len = payload[9] as usize;
    require_exact(payload, 10 + name_len, "device info")?;

    Ok(DeviceInfo {
        order,
        channels: payload[1],
        depth: order.read_u16(&payload[2..]),
        tick_khz: order.read_u16(&payload[4..]),
        var_count: payload[6],
        rt_count: payload[7],
        rt_capacity: payload[8],
        name_len: payload[9],
        name: read_name(&payload[10..], name_len)?,
    })
}

/// Decode a GetTiming/SetTiming response payload.
pub fn decode_timing(payload: &[u8], ctx: DecodeCtx) -> Result<TimingConfig, ProtocolError> {
    require_exact(payload, 8, "timing")?;
    Ok(TimingConfig {
        divider: ctx.order.read_u32(&payload[0..]),
        pre_trig: ctx.order.read_u32(&payload[4..]),
    })
}

/// Decode a GetState/SetState response payload.
pub fn decode_state(payload: &[u8]) -> Result<DeviceState, ProtocolError> {
    require_exact(payload, 1, "state")?;
    DeviceState::from_u8(payload[0])
}

/// Decode a GetFrame response payload into one sample per channel.
pub fn decode_live_frame(payload: &[u8], ctx: DecodeCtx) -> Result<Vec<f32>, ProtocolError> {
    let expected = ctx.channels as usize * 4;
    require_exact(payload, expected, "live frame")?;
    Ok(payload
        .chunks_exact(4)
        .map(|chunk| ctx.order.read_f32(chunk))
        .collect())
}

/// Decode a GetSnapshotHeader response payload.
///
/// The RT value block is the trailing remainder; its length (a multiple of
/// four) tells how many registers were latched.
pub fn decode_snapshot_header(
    payload: &[u8],
    ctx: DecodeCtx,
) -> Result<SnapshotHeader, ProtocolError> {
    let channels = ctx.channels as usize;
    let fixed = channels + 4 + 4 + 4 + 1 + 1;
    require_len(payload, fixed)?;

    let rt_block = &payload[fixed..];
    if rt_block.len() % 4 != 0 {
        let err = ProtocolError::decode(format!(
            "snapshot header: trailing {} bytes is not an rt value block",
            rt_block.len()
        ));
        error!("structural decode failure: {err}");
        return Err(err);
    }

    let channel_map = payload[..channels].to_vec();
    let mut offset = channels;
    let divider = ctx.order.read_u32(&payload[offset..]);
    offset += 4;
    let pre_trig = ctx.order.read_u32(&payload[offset..]);
    offset += 4;
    let threshold = ctx.order.read_f32(&payload[offset..]);
    offset += 4;
    let channel = payload[offset];
    let mode = TriggerMode::from_u8(payload[offset + 1])?;

    Ok(SnapshotHeader {
        channel_map,
        timing: TimingConfig { divider, pre_trig },
        trigger: TriggerConfig {
            threshold,
            channel,
            mode,
        },
        rt_values: rt_block
            .chunks_exact(4)
            .map(|chunk| ctx.order.read_f32(chunk))
            .collect(),
    })
}

/// Decode a GetSnapshotData response payload into sample-major f32s.
///
/// The result holds `count × channels` values: all channels of the first
/// sample, then the next sample, and so on.
pub fn decode_snapshot_data(payload: &[u8], ctx: DecodeCtx) -> Result<Vec<f32>, ProtocolError> {
    let stride = ctx.channels as usize * 4;
    if stride == 0 || payload.len() % stride != 0 {
        let err = ProtocolError::decode(format!(
            "snapshot data: {} bytes is not a whole number of {}-channel samples",
            payload.len(),
            ctx.channels
        ));
        error!("structural decode failure: {err}");
        return Err(err);
    }
    Ok(payload
        .chunks_exact(4)
        .map(|chunk| ctx.order.read_f32(chunk))
        .collect())
}

/// Decode a GetVarList/GetRtLabels response payload.
pub fn decode_catalog_page(payload: &[u8], ctx: DecodeCtx) -> Result<CatalogPage, ProtocolError> {
    require_len(payload, 3)?;
    let total = payload[0];
    let start = payload[1];
    let count = payload[2] as usize;

    let entry_size = 1 + ctx.name_len as usize;
    require_exact(payload, 3 + count * entry_size, "catalog page")?;

    let mut entries = Vec::with_capacity(count);
    for chunk in payload[3..].chunks_exact(entry_size) {
        entries.push(CatalogEntry {
            index: chunk[0],
            name: read_name(&chunk[1..], ctx.name_len as usize)?,
        });
    }

    Ok(CatalogPage {
        total,
        start,
        entries,
    })
}

/// Decode a GetChannelMap/SetChannelMap response payload.
pub fn decode_channel_map(payload: &[u8], ctx: DecodeCtx) -> Result<Vec<u8>, ProtocolError> {
    require_exact(payload, ctx.channels as usize, "channel map")?;
    Ok(payload.to_vec())
}

/// Decode a GetChannelLabels response payload.
pub fn decode_channel_labels(
    payload: &[u8],
    ctx: DecodeCtx,
) -> Result<Vec<String>, ProtocolError> {
    let width = ctx.name_len as usize;
    require_exact(payload, ctx.channels as usize * width, "channel labels")?;
    payload.chunks_exact(width).map(|c| read_name(c, width)).collect()
}

/// Decode a GetRtBuffer/SetRtBuffer response payload.
pub fn decode_rt_value(payload: &[u8], ctx: DecodeCtx) -> Result<f32, ProtocolError> {
    require_exact(payload, 4, "rt value")?;
    Ok(ctx.order.read_f32(payload))
}

/// Decode a GetTrigger/SetTrigger response payload.
pub fn decode_trigger(payload: &[u8], ctx: DecodeCtx) -> Result<TriggerConfig, ProtocolError> {
    require_exact(payload, 6, "trigger")?;
    Ok(TriggerConfig {
        threshold: ctx.order.read_f32(&payload[0..]),
        channel: payload[4],
        mode: TriggerMode::from_u8(payload[5])?,
    })
}

/// Decode a Trigger (manual fire) acknowledgement payload.
pub fn decode_trigger_ack(payload: &[u8]) -> Result<(), ProtocolError> {
    require_exact(payload, 0, "trigger ack")?;
    Ok(())
}
