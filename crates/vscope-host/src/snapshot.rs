//! Snapshot assembly and storage interface.
//!
//! A snapshot is the fixed-length multi-channel capture produced by one
//! completed acquisition cycle. The device serves it as a header plus
//! windows of samples; this module pages the windows together into one
//! buffer and hands finished snapshots to a storage collaborator.

use log::debug;
use thiserror::Error;
use vscope_protocol::SnapshotHeader;

use crate::client::{DeviceClient, RequestError};

/// One assembled capture.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Capture metadata.
    pub header: SnapshotHeader,
    /// Sample-major data: all channels of sample 0, then sample 1, …
    pub samples: Vec<f32>,
    /// Channels per sample.
    pub channels: u8,
}

impl Snapshot {
    /// Number of samples per channel.
    pub fn depth(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// One channel's samples in time order.
    pub fn channel(&self, channel: u8) -> impl Iterator<Item = f32> + '_ {
        self.samples
            .iter()
            .skip(channel as usize)
            .step_by(self.channels.max(1) as usize)
            .copied()
    }
}

/// Identifier assigned by a snapshot store.
pub type SnapshotId = u64;

/// Failure inside a snapshot store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("snapshot store error: {message}")]
pub struct StoreError {
    /// Description of the failure.
    pub message: String,
}

/// Storage collaborator for finished snapshots.
///
/// Persistence itself (database, files) lives outside this crate; anything
/// that can accept a header and a sample buffer and answer with an id fits.
pub trait SnapshotStore: Send {
    /// Persist one snapshot, returning its stored id.
    fn store(&mut self, header: &SnapshotHeader, samples: &[f32]) -> Result<SnapshotId, StoreError>;
}

/// In-memory store, for tests and demos.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: Vec<(SnapshotHeader, Vec<f32>)>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored snapshots, in insertion order.
    pub fn snapshots(&self) -> &[(SnapshotHeader, Vec<f32>)] {
        &self.snapshots
    }
}

impl SnapshotStore for MemoryStore {
    fn store(&mut self, header: &SnapshotHeader, samples: &[f32]) -> Result<SnapshotId, StoreError> {
        self.snapshots.push((header.clone(), samples.to_vec()));
        Ok(self.snapshots.len() as SnapshotId - 1)
    }
}

/// Fetch the full snapshot from a device.
///
/// `Ok(None)` means the device has no valid snapshot yet (for instance,
/// mid-ACQUIRING): "snapshot not valid yet", not an error. The caller
/// retries after the acquisition completes.
pub fn fetch_snapshot(client: &DeviceClient) -> Result<Option<Snapshot>, RequestError> {
    let info = match client.info() {
        Some(info) => info.clone(),
        None => return Ok(None),
    };

    let header = match client.get_snapshot_header()? {
        Some(header) => header,
        None => return Ok(None),
    };

    let depth = info.depth;
    let chunk = info.snapshot_chunk_samples().max(1);
    let mut samples = Vec::with_capacity(depth as usize * info.channels as usize);

    let mut start: u16 = 0;
    while start < depth {
        let count = chunk.min(depth - start) as u8;
        match client.get_snapshot_data(start, count)? {
            Some(window) => samples.extend_from_slice(&window),
            // The device invalidated the snapshot between windows (a new
            // acquisition armed); report not-valid rather than a torn
            // buffer.
            None => {
                debug!("snapshot invalidated mid-fetch at sample {start}");
                return Ok(None);
            }
        }
        start += count as u16;
    }

    Ok(Some(Snapshot {
        header,
        samples,
        channels: info.channels,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vscope_protocol::{TimingConfig, TriggerConfig};

    fn header() -> SnapshotHeader {
        SnapshotHeader {
            channel_map: vec![0, 1],
            timing: TimingConfig {
                divider: 1,
                pre_trig: 0,
            },
            trigger: TriggerConfig::default(),
            rt_values: vec![],
        }
    }

    #[test]
    fn channel_view_deinterleaves() {
        let snapshot = Snapshot {
            header: header(),
            samples: vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0],
            channels: 2,
        };
        assert_eq!(snapshot.depth(), 3);
        assert_eq!(snapshot.channel(0).collect::<Vec<_>>(), vec![1.0, 2.0, 3.0]);
        assert_eq!(
            snapshot.channel(1).collect::<Vec<_>>(),
            vec![10.0, 20.0, 30.0]
        );
    }

    #[test]
    fn memory_store_assigns_sequential_ids() {
        let mut store = MemoryStore::new();
        let id0 = store.store(&header(), &[0.0]).unwrap();
        let id1 = store.store(&header(), &[1.0]).unwrap();
        assert_eq!((id0, id1), (0, 1));
        assert_eq!(store.snapshots().len(), 2);
    }
}
