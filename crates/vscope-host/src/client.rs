//! Typed request client.
//!
//! One method per protocol operation: encode in the device's byte order,
//! exchange through the transport, check for a device-reported error, then
//! decode the remaining bytes into a typed response.
//!
//! CRC-failure retry lives here (the transport performs exactly one
//! transaction per call). Timeouts are never retried for state-changing
//! commands: their effect is unconfirmed and they are not assumed
//! idempotent.

use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};
use thiserror::Error;
use vscope_protocol::{
    decode_catalog_page, decode_channel_labels, decode_channel_map, decode_info, decode_live_frame,
    decode_rt_value, decode_snapshot_data, decode_snapshot_header, decode_state, decode_timing,
    decode_trigger, decode_trigger_ack, response_payload, ByteOrder, CatalogPage, Command,
    DecodeCtx, DeviceInfo, DeviceState, DeviceStatus, ProtocolError, SnapshotHeader, TimingConfig,
    TriggerConfig, CATALOG_COUNT_ALL,
};

use crate::transport::{DeviceHandle, Transport, TransportError};

/// A failed request: either the line failed or the bytes did not decode.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The transaction failed at the transport layer.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The device answered, but the answer was an error or did not decode.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl RequestError {
    /// Whether this failure was a transport timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestError::Transport(TransportError::Timeout))
    }

    /// Whether the device reported "not ready".
    pub fn is_not_ready(&self) -> bool {
        matches!(
            self,
            RequestError::Protocol(ProtocolError::Device(DeviceStatus::NotReady))
        )
    }
}

/// Typed protocol client for one connected device.
pub struct DeviceClient {
    transport: Arc<Transport>,
    handle: DeviceHandle,
    timeout: Duration,
    crc_retry_attempts: u32,
    info: Option<DeviceInfo>,
}

impl DeviceClient {
    /// Create a client over an open handle.
    ///
    /// Until [`fetch_info`](Self::fetch_info) succeeds the client assumes
    /// little-endian, which is all GetInfo itself needs: the info payload
    /// declares the device's actual byte order before any multi-byte field.
    pub fn new(
        transport: Arc<Transport>,
        handle: DeviceHandle,
        timeout: Duration,
        crc_retry_attempts: u32,
    ) -> Self {
        DeviceClient {
            transport,
            handle,
            timeout,
            crc_retry_attempts,
            info: None,
        }
    }

    /// The device info from the last successful [`fetch_info`](Self::fetch_info).
    pub fn info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    /// The transport handle this client speaks through.
    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    fn order(&self) -> ByteOrder {
        self.info.as_ref().map(|i| i.order).unwrap_or_default()
    }

    fn ctx(&self) -> Result<DecodeCtx, RequestError> {
        self.info
            .as_ref()
            .map(DeviceInfo::decode_ctx)
            .ok_or_else(|| {
                RequestError::Transport(TransportError::InvalidConfig {
                    message: "device info not fetched yet".to_string(),
                })
            })
    }

    /// Exchange one command, retrying CRC failures up to the configured
    /// attempt count. Returns the response TYPE+PAYLOAD.
    fn exchange(&self, cmd: &Command) -> Result<Vec<u8>, RequestError> {
        let request = cmd.encode(self.order());

        let mut attempt = 0;
        loop {
            match self
                .transport
                .send_request(self.handle, &request, self.timeout)
            {
                Err(TransportError::CrcMismatch) if attempt < self.crc_retry_attempts => {
                    attempt += 1;
                    warn!(
                        "crc failure on {} (attempt {attempt}/{}), retrying",
                        self.handle, self.crc_retry_attempts
                    );
                }
                Err(err) => return Err(err.into()),
                Ok(response) => return Ok(response),
            }
        }
    }

    fn request(&self, cmd: &Command) -> Result<Vec<u8>, RequestError> {
        let response = self.exchange(cmd)?;
        let payload = response_payload(cmd.code(), &response).map_err(|err| {
            if let ProtocolError::UnexpectedType { .. } = err {
                error!("protocol violation from {}: {err}", self.handle);
            }
            err
        })?;
        Ok(payload.to_vec())
    }

    /// Fetch device info and adopt its byte order and geometry for every
    /// later request. The first request of every session.
    pub fn fetch_info(&mut self) -> Result<DeviceInfo, RequestError> {
        let payload = self.request(&Command::GetInfo)?;
        let info = decode_info(&payload)?;
        self.info = Some(info.clone());
        Ok(info)
    }

    /// Read the acquisition timing.
    pub fn get_timing(&self) -> Result<TimingConfig, RequestError> {
        let payload = self.request(&Command::GetTiming)?;
        Ok(decode_timing(&payload, self.ctx()?)?)
    }

    /// Write the acquisition timing. Not retried on timeout.
    pub fn set_timing(&self, timing: TimingConfig) -> Result<TimingConfig, RequestError> {
        let payload = self.request(&Command::SetTiming(timing))?;
        Ok(decode_timing(&payload, self.ctx()?)?)
    }

    /// Read the run state.
    pub fn get_state(&self) -> Result<DeviceState, RequestError> {
        let payload = self.request(&Command::GetState)?;
        Ok(decode_state(&payload)?)
    }

    /// Request a run state change. The device echoes its state at the time
    /// of the request; the change itself lands on its next acquisition tick.
    pub fn set_state(&self, state: DeviceState) -> Result<DeviceState, RequestError> {
        let payload = self.request(&Command::SetState { state })?;
        Ok(decode_state(&payload)?)
    }

    /// Manually fire the trigger.
    pub fn trigger(&self) -> Result<(), RequestError> {
        let payload = self.request(&Command::Trigger)?;
        Ok(decode_trigger_ack(&payload)?)
    }

    /// Read one live sample frame.
    pub fn get_frame(&self) -> Result<Vec<f32>, RequestError> {
        let payload = self.request(&Command::GetFrame)?;
        Ok(decode_live_frame(&payload, self.ctx()?)?)
    }

    /// Read a page of the variable catalog.
    pub fn get_var_list(&self, start: u8, count: u8) -> Result<CatalogPage, RequestError> {
        let payload = self.request(&Command::GetVarList { start, count })?;
        Ok(decode_catalog_page(&payload, self.ctx()?)?)
    }

    /// Read a page of the RT register catalog.
    pub fn get_rt_labels(&self, start: u8, count: u8) -> Result<CatalogPage, RequestError> {
        let payload = self.request(&Command::GetRtLabels { start, count })?;
        Ok(decode_catalog_page(&payload, self.ctx()?)?)
    }

    /// Read the whole variable catalog in as few pages as possible.
    pub fn get_var_list_all(&self) -> Result<CatalogPage, RequestError> {
        self.get_var_list(0, CATALOG_COUNT_ALL)
    }

    /// Read the channel→variable map.
    pub fn get_channel_map(&self) -> Result<Vec<u8>, RequestError> {
        let payload = self.request(&Command::GetChannelMap)?;
        Ok(decode_channel_map(&payload, self.ctx()?)?)
    }

    /// Write the channel→variable map. Not retried on timeout.
    pub fn set_channel_map(&self, map: Vec<u8>) -> Result<Vec<u8>, RequestError> {
        let payload = self.request(&Command::SetChannelMap { map })?;
        Ok(decode_channel_map(&payload, self.ctx()?)?)
    }

    /// Read the labels of the currently mapped channels.
    pub fn get_channel_labels(&self) -> Result<Vec<String>, RequestError> {
        let payload = self.request(&Command::GetChannelLabels)?;
        Ok(decode_channel_labels(&payload, self.ctx()?)?)
    }

    /// Read one RT register.
    pub fn get_rt_buffer(&self, index: u8) -> Result<f32, RequestError> {
        let payload = self.request(&Command::GetRtBuffer { index })?;
        Ok(decode_rt_value(&payload, self.ctx()?)?)
    }

    /// Write one RT register; returns the stored value. Not retried on
    /// timeout.
    pub fn set_rt_buffer(&self, index: u8, value: f32) -> Result<f32, RequestError> {
        let payload = self.request(&Command::SetRtBuffer { index, value })?;
        Ok(decode_rt_value(&payload, self.ctx()?)?)
    }

    /// Read the trigger configuration.
    pub fn get_trigger(&self) -> Result<TriggerConfig, RequestError> {
        let payload = self.request(&Command::GetTrigger)?;
        Ok(decode_trigger(&payload, self.ctx()?)?)
    }

    /// Write the trigger configuration. Not retried on timeout.
    pub fn set_trigger(&self, trigger: TriggerConfig) -> Result<TriggerConfig, RequestError> {
        let payload = self.request(&Command::SetTrigger(trigger))?;
        Ok(decode_trigger(&payload, self.ctx()?)?)
    }

    /// Read the snapshot header.
    ///
    /// `Ok(None)` means the snapshot is not valid yet (no completed
    /// acquisition); an expected condition, not a fault.
    pub fn get_snapshot_header(&self) -> Result<Option<SnapshotHeader>, RequestError> {
        match self.request(&Command::GetSnapshotHeader) {
            Ok(payload) => Ok(Some(decode_snapshot_header(&payload, self.ctx()?)?)),
            Err(err) if err.is_not_ready() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Read a window of captured samples (sample-major f32s).
    ///
    /// `Ok(None)` means the snapshot is not valid yet.
    pub fn get_snapshot_data(
        &self,
        start: u16,
        count: u8,
    ) -> Result<Option<Vec<f32>>, RequestError> {
        match self.request(&Command::GetSnapshotData { start, count }) {
            Ok(payload) => Ok(Some(decode_snapshot_data(&payload, self.ctx()?)?)),
            Err(err) if err.is_not_ready() => Ok(None),
            Err(err) => Err(err),
        }
    }
}
