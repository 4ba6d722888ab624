//! Session and fleet tests against simulated devices.

use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use vscope_host::{
    ConnectionState, FieldConsensus, Fleet, SessionEvent, Settings,
};
use vscope_protocol::{ByteOrder, DeviceState, TimingConfig};
use vscope_sim::{SimConfig, SimDevice};

fn fast_settings() -> Settings {
    Settings {
        state_polling_hz: 50.0,
        frame_polling_hz: 25.0,
        frame_timeout_ms: 50,
        crc_retry_attempts: 2,
    }
}

fn wait_for(
    events: &Receiver<SessionEvent>,
    deadline: Duration,
    mut predicate: impl FnMut(&SessionEvent) -> bool,
) -> bool {
    let expiry = Instant::now() + deadline;
    while let Some(remaining) = expiry.checked_duration_since(Instant::now()) {
        match events.recv_timeout(remaining) {
            Ok(event) => {
                if predicate(&event) {
                    return true;
                }
            }
            Err(_) => break,
        }
    }
    false
}

#[test]
fn session_connects_and_polls_state() {
    let device = SimDevice::with_counts(SimConfig::default(), 6, 2);
    let mut fleet = Fleet::new(fast_settings());
    let events = fleet.events();

    fleet.connect_link(Box::new(device.link()), "sim0").unwrap();
    assert!(
        wait_for(&events, Duration::from_secs(2), |event| matches!(
            event,
            SessionEvent::Connected { path } if path == "sim0"
        )),
        "session never connected"
    );

    // Wait until every state-poll field has landed at least once.
    let expiry = Instant::now() + Duration::from_secs(2);
    let state = loop {
        let state = fleet.session("sim0").unwrap().state();
        if state.state.is_some()
            && state.timing.is_some()
            && state.trigger.is_some()
            && state.channel_map.is_some()
        {
            break state;
        }
        assert!(Instant::now() < expiry, "state poll never completed");
        std::thread::sleep(Duration::from_millis(10));
    };

    assert!(matches!(state.connection, ConnectionState::Connected(_)));
    let info = state.info.expect("info fetched");
    assert_eq!(info.var_count, 6);
    assert_eq!(state.variables.expect("variables catalog").value.len(), 6);
    assert_eq!(state.rt_labels.expect("rt catalog").value.len(), 2);
    assert_eq!(
        state.channel_labels.expect("channel labels").value.len(),
        5
    );
}

#[test]
fn commands_flow_through_the_session_thread() {
    let device = SimDevice::with_counts(SimConfig::default(), 5, 2);
    let mut fleet = Fleet::new(fast_settings());
    let events = fleet.events();
    fleet.connect_link(Box::new(device.link()), "sim0").unwrap();
    wait_for(&events, Duration::from_secs(2), |event| {
        matches!(event, SessionEvent::Connected { .. })
    });

    let session = fleet.session("sim0").unwrap();
    let timing = session
        .set_timing(TimingConfig {
            divider: 10,
            pre_trig: 256,
        })
        .unwrap();
    assert_eq!(timing.divider, 10);

    let stored = session.write_rt_buffer(1, 2.5).unwrap();
    assert_eq!(stored, 2.5);
    assert_eq!(device.rt_value(1), Some(2.5));

    // The session records what it wrote.
    let state = session.state();
    assert_eq!(state.timing.unwrap().value.divider, 10);
    assert_eq!(state.rt_values[&1].value, 2.5);
}

#[test]
fn live_frames_only_flow_while_running() {
    let device = SimDevice::with_counts(SimConfig::default(), 5, 0);
    let mut fleet = Fleet::new(fast_settings());
    let events = fleet.events();
    fleet.connect_link(Box::new(device.link()), "sim0").unwrap();
    wait_for(&events, Duration::from_secs(2), |event| {
        matches!(event, SessionEvent::Connected { .. })
    });

    std::thread::sleep(Duration::from_millis(200));
    assert!(fleet.session("sim0").unwrap().state().live_frame.is_none());

    device.set_var(0, 1.5);
    fleet
        .session("sim0")
        .unwrap()
        .set_state(DeviceState::Running)
        .unwrap();
    device.tick(1);

    let expiry = Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(frame) = fleet.session("sim0").unwrap().state().live_frame {
            assert_eq!(frame.value.len(), 5);
            assert_eq!(frame.value[0], 1.5);
            break;
        }
        assert!(Instant::now() < expiry, "no live frame arrived");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn repeated_timeouts_infer_disconnection() {
    let device = SimDevice::with_counts(SimConfig::default(), 5, 0);
    let mut fleet = Fleet::new(fast_settings());
    let events = fleet.events();
    fleet.connect_link(Box::new(device.link()), "sim0").unwrap();
    wait_for(&events, Duration::from_secs(2), |event| {
        matches!(event, SessionEvent::Connected { .. })
    });

    // Unplug the device.
    device.set_muted(true);

    assert!(
        wait_for(&events, Duration::from_secs(10), |event| matches!(
            event,
            SessionEvent::Disconnected { path } if path == "sim0"
        )),
        "session never inferred disconnection"
    );
    assert_eq!(
        fleet.session("sim0").unwrap().state().connection,
        ConnectionState::Disconnected
    );
}

#[test]
fn two_identical_devices_reach_consensus() {
    let dev_a = SimDevice::with_counts(SimConfig::default(), 5, 2);
    let dev_b = SimDevice::with_counts(SimConfig::default(), 5, 2);
    let mut fleet = Fleet::new(fast_settings());
    let events = fleet.events();
    fleet.connect_link(Box::new(dev_a.link()), "simA").unwrap();
    fleet.connect_link(Box::new(dev_b.link()), "simB").unwrap();

    let mut connected = 0;
    wait_for(&events, Duration::from_secs(2), |event| {
        if matches!(event, SessionEvent::Connected { .. }) {
            connected += 1;
        }
        connected == 2
    });

    for path in ["simA", "simB"] {
        fleet
            .session(path)
            .unwrap()
            .set_timing(TimingConfig {
                divider: 4,
                pre_trig: 100,
            })
            .unwrap();
    }

    // Wait for both sessions to poll the agreed state.
    let expiry = Instant::now() + Duration::from_secs(2);
    loop {
        let view = fleet.consensus();
        if view.completeness.command_gate() {
            assert_eq!(view.device_count, 2);
            assert_eq!(
                view.timing.agreed(),
                Some(&TimingConfig {
                    divider: 4,
                    pre_trig: 100
                })
            );
            assert!(view.variables.complete);
            assert!(view.rt.complete);
            break;
        }
        assert!(Instant::now() < expiry, "fleet never reached consensus");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn divergent_timing_breaks_the_command_gate() {
    let dev_a = SimDevice::with_counts(SimConfig::default(), 5, 0);
    let dev_b = SimDevice::with_counts(SimConfig::default(), 5, 0);
    let mut fleet = Fleet::new(fast_settings());
    let events = fleet.events();
    fleet.connect_link(Box::new(dev_a.link()), "simA").unwrap();
    fleet.connect_link(Box::new(dev_b.link()), "simB").unwrap();

    let mut connected = 0;
    wait_for(&events, Duration::from_secs(2), |event| {
        if matches!(event, SessionEvent::Connected { .. }) {
            connected += 1;
        }
        connected == 2
    });

    fleet
        .session("simA")
        .unwrap()
        .set_timing(TimingConfig {
            divider: 2,
            pre_trig: 0,
        })
        .unwrap();
    fleet
        .session("simB")
        .unwrap()
        .set_timing(TimingConfig {
            divider: 8,
            pre_trig: 0,
        })
        .unwrap();

    let expiry = Instant::now() + Duration::from_secs(2);
    loop {
        let view = fleet.consensus();
        if let FieldConsensus::Mismatch(values) = &view.timing {
            assert_eq!(values["simA"].divider, 2);
            assert_eq!(values["simB"].divider, 8);
            assert!(!view.completeness.timing);
            assert!(!view.completeness.command_gate());
            break;
        }
        assert!(Instant::now() < expiry, "mismatch never observed");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn big_and_little_endian_devices_coexist_in_one_fleet() {
    let dev_le = SimDevice::with_counts(SimConfig::default(), 5, 0);
    let dev_be = SimDevice::with_counts(
        SimConfig {
            order: ByteOrder::Big,
            ..SimConfig::default()
        },
        5,
        0,
    );
    let mut fleet = Fleet::new(fast_settings());
    let events = fleet.events();
    fleet.connect_link(Box::new(dev_le.link()), "simLE").unwrap();
    fleet.connect_link(Box::new(dev_be.link()), "simBE").unwrap();

    let mut connected = 0;
    wait_for(&events, Duration::from_secs(2), |event| {
        if matches!(event, SessionEvent::Connected { .. }) {
            connected += 1;
        }
        connected == 2
    });

    // Same logical timing decodes identically regardless of byte order.
    for path in ["simLE", "simBE"] {
        fleet
            .session(path)
            .unwrap()
            .set_timing(TimingConfig {
                divider: 10,
                pre_trig: 256,
            })
            .unwrap();
    }

    let expiry = Instant::now() + Duration::from_secs(2);
    loop {
        let view = fleet.consensus();
        if view.timing.is_agreed() {
            assert_eq!(view.timing.agreed().unwrap().divider, 10);
            break;
        }
        assert!(Instant::now() < expiry, "endian-mixed fleet never agreed");
        std::thread::sleep(Duration::from_millis(20));
    }
}
