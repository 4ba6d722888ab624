//! End-to-end tests: transport + client against the simulated device.

use std::sync::Arc;
use std::time::{Duration, Instant};

use vscope_host::session::{fetch_paged_catalog_with, CatalogKind};
use vscope_host::{DeviceClient, Transport, TransportError};
use vscope_protocol::{
    crc8, ByteOrder, DeviceState, FrameDecoder, TimingConfig, SYNC_BYTE,
};
use vscope_sim::{SimConfig, SimDevice};

fn connect(device: &SimDevice, timeout_ms: u64, retries: u32) -> (Arc<Transport>, DeviceClient) {
    let transport = Arc::new(Transport::new());
    let handle = transport.register(Box::new(device.link())).unwrap();
    let client = DeviceClient::new(
        Arc::clone(&transport),
        handle,
        Duration::from_millis(timeout_ms),
        retries,
    );
    (transport, client)
}

#[test]
fn open_get_info_set_timing_get_timing() {
    let device = SimDevice::with_counts(SimConfig::default(), 8, 2);
    let (_transport, mut client) = connect(&device, 100, 3);

    let info = client.fetch_info().unwrap();
    assert_eq!(info.order, ByteOrder::Little);
    assert_eq!(info.channels, 5);
    assert_eq!(info.var_count, 8);

    let set = client
        .set_timing(TimingConfig {
            divider: 10,
            pre_trig: 256,
        })
        .unwrap();
    assert_eq!(set.divider, 10);
    assert_eq!(set.pre_trig, 256);

    let read_back = client.get_timing().unwrap();
    assert_eq!(
        read_back,
        TimingConfig {
            divider: 10,
            pre_trig: 256
        }
    );
}

#[test]
fn big_endian_device_round_trip() {
    let config = SimConfig {
        order: ByteOrder::Big,
        ..SimConfig::default()
    };
    let device = SimDevice::with_counts(config, 6, 1);
    let (_transport, mut client) = connect(&device, 100, 3);

    let info = client.fetch_info().unwrap();
    assert_eq!(info.order, ByteOrder::Big);
    assert_eq!(info.depth, 1000);

    // Multi-byte fields survive the round trip in the device's byte order.
    let set = client
        .set_timing(TimingConfig {
            divider: 0x0102_0304,
            pre_trig: 7,
        })
        .unwrap();
    assert_eq!(set.divider, 0x0102_0304);
    assert_eq!(client.get_timing().unwrap().divider, 0x0102_0304);
}

#[test]
fn timeout_is_bounded_for_silent_device() {
    let device = SimDevice::with_counts(SimConfig::default(), 5, 0);
    device.set_muted(true);
    let transport = Arc::new(Transport::new());
    let handle = transport.register(Box::new(device.link())).unwrap();

    for deadline_ms in [10u64, 100, 1000] {
        let deadline = Duration::from_millis(deadline_ms);
        let started = Instant::now();
        let result = transport.send_request(handle, &[0x04], deadline);
        let elapsed = started.elapsed();

        assert_eq!(result, Err(TransportError::Timeout), "deadline {deadline_ms}ms");
        assert!(elapsed >= deadline, "{deadline_ms}ms deadline returned early");
        assert!(
            elapsed < deadline + Duration::from_millis(100),
            "{deadline_ms}ms deadline overran: {elapsed:?}"
        );
    }
}

#[test]
fn concurrent_requests_never_interleave_on_the_wire() {
    let device = SimDevice::with_counts(SimConfig::default(), 5, 0);
    let delay = Duration::from_millis(60);
    device.set_response_delay(delay);

    let transport = Arc::new(Transport::new());
    let handle = transport.register(Box::new(device.link())).unwrap();

    let started = Instant::now();
    let threads: Vec<_> = (0..2)
        .map(|_| {
            let transport = Arc::clone(&transport);
            std::thread::spawn(move || {
                transport
                    .send_request(handle, &[0x04], Duration::from_secs(2))
                    .unwrap()
            })
        })
        .collect();
    for thread in threads {
        let response = thread.join().unwrap();
        assert_eq!(response[0], 0x04);
    }

    // Serialized transactions cannot finish faster than the sum of the
    // device's per-request delays.
    assert!(
        started.elapsed() >= delay * 2,
        "requests overlapped: {:?}",
        started.elapsed()
    );

    // And the bytes on the wire parse as exactly two clean frames.
    let mut decoder = FrameDecoder::new();
    decoder.push(&device.wire_log());
    let mut frames = 0;
    while let Some(frame) = decoder.try_decode().unwrap() {
        assert_eq!(frame.msg_type, 0x04);
        frames += 1;
    }
    assert_eq!(frames, 2);
    assert_eq!(decoder.buffered_len(), 0);
}

#[test]
fn crc_failure_is_retried_to_success() {
    let device = SimDevice::with_counts(SimConfig::default(), 5, 0);
    let (_transport, mut client) = connect(&device, 100, 3);
    client.fetch_info().unwrap();

    device.corrupt_next_crc();
    let state = client.get_state().unwrap();
    assert_eq!(state, DeviceState::Stopped);
}

#[test]
fn crc_retries_exhaust_into_a_fault() {
    let device = SimDevice::with_counts(SimConfig::default(), 5, 0);
    let (_transport, mut client) = connect(&device, 100, 0);
    client.fetch_info().unwrap();

    device.corrupt_next_crc();
    let err = client.get_state().unwrap_err();
    assert!(matches!(
        err,
        vscope_host::RequestError::Transport(TransportError::CrcMismatch)
    ));
}

#[test]
fn state_changing_command_is_not_reissued_after_timeout() {
    let device = SimDevice::with_counts(SimConfig::default(), 5, 0);
    let (_transport, mut client) = connect(&device, 50, 3);
    client.fetch_info().unwrap();
    let frames_before = count_frames(&device.wire_log());

    device.set_muted(true);
    let err = client.set_state(DeviceState::Running).unwrap_err();
    assert!(err.is_timeout());

    // Exactly one SetState frame went out despite retries being configured.
    let frames_after = count_frames(&device.wire_log());
    assert_eq!(frames_after - frames_before, 1);
}

fn count_frames(wire: &[u8]) -> usize {
    let mut decoder = FrameDecoder::new();
    decoder.push(wire);
    let mut frames = 0;
    while let Ok(Some(_)) = decoder.try_decode() {
        frames += 1;
    }
    frames
}

/// Answers the first request with half a frame and then goes quiet; answers
/// the second request completely.
struct TruncatingLink {
    requests: u32,
    pending: Vec<u8>,
}

impl vscope_host::SerialLink for TruncatingLink {
    fn write_all(&mut self, _data: &[u8]) -> std::io::Result<()> {
        self.requests += 1;
        let full = vscope_protocol::encode_frame(0x04, &[0]).unwrap();
        if self.requests == 1 {
            self.pending.extend_from_slice(&full[..2]);
        } else {
            self.pending.extend_from_slice(&full);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pending.is_empty() {
            std::thread::sleep(Duration::from_millis(1));
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "quiet"));
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn set_read_timeout(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        self.pending.clear();
        Ok(())
    }
}

#[test]
fn partial_frame_is_not_carried_into_the_next_attempt() {
    let transport = Arc::new(Transport::new());
    let handle = transport
        .register(Box::new(TruncatingLink {
            requests: 0,
            pending: Vec::new(),
        }))
        .unwrap();

    // The half frame never completes: timeout, and the fragment is gone.
    let result = transport.send_request(handle, &[0x04], Duration::from_millis(30));
    assert_eq!(result, Err(TransportError::Timeout));

    // The next transaction decodes cleanly from a fresh frame boundary.
    let response = transport
        .send_request(handle, &[0x04], Duration::from_millis(200))
        .unwrap();
    assert_eq!(response, vec![0x04, 0]);
}

#[test]
fn catalog_paging_converges_for_boundary_sizes() {
    let page = 3u8;
    for total in [0u8, 1, page - 1, page, page + 1, 2 * page] {
        let device = SimDevice::with_counts(SimConfig::default(), total, 0);
        let (_transport, mut client) = connect(&device, 100, 3);
        client.fetch_info().unwrap();

        let catalog =
            fetch_paged_catalog_with(&client, CatalogKind::Variables, page).unwrap();
        assert_eq!(catalog.len(), total as usize, "total {total}");
        for (i, entry) in catalog.entries().iter().enumerate() {
            assert_eq!(entry.index, i as u8);
            assert_eq!(entry.name, format!("var{i}"));
        }
    }
}

#[test]
fn rt_catalog_and_values_round_trip() {
    let device = SimDevice::with_counts(SimConfig::default(), 5, 4);
    let (_transport, mut client) = connect(&device, 100, 3);
    client.fetch_info().unwrap();

    let catalog = fetch_paged_catalog_with(&client, CatalogKind::RtLabels, 2).unwrap();
    assert_eq!(catalog.len(), 4);
    assert_eq!(catalog.index_of("rt2"), Some(2));

    let stored = client.set_rt_buffer(2, 42.5).unwrap();
    assert_eq!(stored, 42.5);
    assert_eq!(client.get_rt_buffer(2).unwrap(), 42.5);
    assert_eq!(device.rt_value(2), Some(42.5));

    // Out-of-range index is a typed device fault.
    let err = client.get_rt_buffer(9).unwrap_err();
    assert!(matches!(
        err,
        vscope_host::RequestError::Protocol(vscope_protocol::ProtocolError::Device(
            vscope_protocol::DeviceStatus::Range
        ))
    ));
}

#[test]
fn snapshot_not_ready_then_fetched_after_acquisition() {
    let config = SimConfig {
        depth: 20,
        ..SimConfig::default()
    };
    let device = SimDevice::with_counts(config, 5, 2);
    let (_transport, mut client) = connect(&device, 100, 3);
    client.fetch_info().unwrap();

    // Nothing acquired yet: snapshot is "not valid yet", not an error.
    assert_eq!(vscope_host::fetch_snapshot(&client).unwrap(), None);

    client
        .set_timing(TimingConfig {
            divider: 1,
            pre_trig: 5,
        })
        .unwrap();
    client.set_state(DeviceState::Running).unwrap();
    device.set_var(0, 3.25);
    device.tick(10);

    // Mid-run, still nothing.
    assert_eq!(client.get_snapshot_header().unwrap(), None);

    client.trigger().unwrap();
    device.tick(20);

    let snapshot = vscope_host::fetch_snapshot(&client).unwrap().expect("snapshot valid");
    assert_eq!(snapshot.channels, 5);
    assert_eq!(snapshot.depth(), 20);
    assert_eq!(snapshot.header.timing.pre_trig, 5);
    // Channel 0 was mapped to var0, which held 3.25 while sampling.
    assert!(snapshot.channel(0).any(|v| v == 3.25));

    // Assembled snapshots can be handed to a storage collaborator.
    let mut store = vscope_host::MemoryStore::new();
    use vscope_host::SnapshotStore;
    let id = store.store(&snapshot.header, &snapshot.samples).unwrap();
    assert_eq!(id, 0);
}

#[test]
fn device_error_frames_carry_typed_status() {
    let device = SimDevice::with_counts(SimConfig::default(), 5, 0);
    let (_transport, mut client) = connect(&device, 100, 3);
    client.fetch_info().unwrap();

    // divider == 0 is rejected by the device.
    let err = client
        .set_timing(TimingConfig {
            divider: 0,
            pre_trig: 0,
        })
        .unwrap_err();
    assert!(matches!(
        err,
        vscope_host::RequestError::Protocol(vscope_protocol::ProtocolError::Device(
            vscope_protocol::DeviceStatus::BadParam
        ))
    ));
}

#[test]
fn hand_built_frame_matches_the_wire_format() {
    // GetState request as raw bytes: SYNC, LEN=2, TYPE, CRC over TYPE.
    let expected = vec![SYNC_BYTE, 2, 0x04, crc8(&[0x04])];
    let encoded = vscope_protocol::encode_frame(0x04, &[]).unwrap();
    assert_eq!(encoded, expected);
}
