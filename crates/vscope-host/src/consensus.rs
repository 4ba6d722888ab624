//! Multi-device consensus.
//!
//! A pure function over the current session states: it never talks to a
//! device and never mutates a session. The resulting [`ConsensusView`] is
//! recomputed on any session mutation and read by display code and by
//! command gating; mismatch and incompleteness are first-class view
//! states, not errors.
//!
//! Agreement on scalar fields means bit-for-bit equal decoded values across
//! every connected session. Name-keyed concerns (variables, RT registers,
//! channel labels) additionally require identical name sets across devices;
//! catalogs that diverge mark the concern incomplete rather than adopting
//! one device's indexing, because the same name may live at different
//! indices on different devices.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use vscope_protocol::{DeviceState, TimingConfig, TriggerConfig};

use crate::catalog::Catalog;
use crate::session::{ConnectionState, SessionState, Stamped};

/// Cross-device agreement on one field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldConsensus<T> {
    /// Every connected device reports the same value.
    Agreed(T),
    /// Devices disagree; each divergent value keyed by device path.
    Mismatch(BTreeMap<String, T>),
    /// Some device has no (fresh) value yet; no consensus can be stated.
    Incomplete,
}

impl<T> FieldConsensus<T> {
    /// Whether every device agrees.
    pub fn is_agreed(&self) -> bool {
        matches!(self, FieldConsensus::Agreed(_))
    }

    /// The agreed value, if any.
    pub fn agreed(&self) -> Option<&T> {
        match self {
            FieldConsensus::Agreed(value) => Some(value),
            _ => None,
        }
    }
}

/// Device-independent static numeric info.
///
/// The device name is per-device identity and the catalog counts are
/// covered by catalog consensus, so neither participates here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticInfo {
    /// Capture channels.
    pub channels: u8,
    /// Capture buffer depth.
    pub depth: u16,
    /// Acquisition tick rate in kHz.
    pub tick_khz: u16,
    /// Name slot width.
    pub name_len: u8,
    /// RT register slots.
    pub rt_capacity: u8,
}

/// Cross-device agreement on one name-keyed catalog.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CatalogConsensus {
    /// Per-device name→index maps; always populated for devices that have
    /// the catalog, even without cross-device agreement.
    pub per_device: BTreeMap<String, BTreeMap<String, u8>>,
    /// The common name set, when every connected device reports an
    /// identical set.
    pub agreed_names: Option<BTreeSet<String>>,
    /// True when every connected device has the catalog and the name sets
    /// match.
    pub complete: bool,
}

impl CatalogConsensus {
    /// A device's own local index for `name`.
    ///
    /// Indices are device-local: the same name may map to different indices
    /// on different devices, which is exactly why consumers resolve through
    /// here instead of assuming one shared indexing.
    pub fn resolve_index(&self, path: &str, name: &str) -> Option<u8> {
        self.per_device.get(path)?.get(name).copied()
    }
}

/// One completeness flag per concern.
///
/// A flag is true only when every connected session has a non-stale,
/// mutually agreeing value. Command gating treats these as preconditions
/// for enabling state-changing controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Completeness {
    /// Static info agreed.
    pub static_info: bool,
    /// Timing agreed and fresh everywhere.
    pub timing: bool,
    /// Trigger agreed and fresh everywhere.
    pub trigger: bool,
    /// Channel map agreed (requires variable consensus first).
    pub channel_map: bool,
    /// Variable catalogs present with identical name sets.
    pub variables: bool,
    /// RT catalogs present with identical name sets.
    pub rt: bool,
}

impl Completeness {
    /// Whether every concern is complete: the gate for state-changing
    /// controls.
    pub fn command_gate(&self) -> bool {
        self.static_info
            && self.timing
            && self.trigger
            && self.channel_map
            && self.variables
            && self.rt
    }
}

/// The reconciled view over all connected devices.
///
/// Derived and read-only; recompute it from session snapshots whenever any
/// session mutates. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusView {
    /// Connected sessions that contributed.
    pub device_count: usize,
    /// Run state agreement.
    pub state: FieldConsensus<DeviceState>,
    /// Timing agreement.
    pub timing: FieldConsensus<TimingConfig>,
    /// Trigger agreement (threshold compared bit-for-bit).
    pub trigger: FieldConsensus<TriggerConfig>,
    /// Static numeric info agreement.
    pub static_info: FieldConsensus<StaticInfo>,
    /// Channel map agreement; [`FieldConsensus::Incomplete`] whenever the
    /// variable catalogs disagree, since the map indexes into them.
    pub channel_map: FieldConsensus<Vec<u8>>,
    /// Variable catalog alignment.
    pub variables: CatalogConsensus,
    /// RT register catalog alignment.
    pub rt: CatalogConsensus,
    /// Channel label alignment.
    pub channel_labels: FieldConsensus<Vec<String>>,
    /// Per-name RT value agreement; populated only when the RT catalogs
    /// agree, and only for names every device has a value for.
    pub rt_values: BTreeMap<String, FieldConsensus<f32>>,
    /// The per-concern gate.
    pub completeness: Completeness,
}

/// Compute the consensus over the given session states.
///
/// `now` and `stale_after` bound freshness for polled fields: a value older
/// than `stale_after` counts as missing. Catalogs are fetched once per
/// session, so for them presence is freshness. Only sessions in a
/// `Connected` state participate; with zero connected sessions everything
/// is incomplete, and a single session trivially agrees with itself.
pub fn compute_consensus(
    sessions: &[SessionState],
    now: Instant,
    stale_after: Duration,
) -> ConsensusView {
    let connected: Vec<&SessionState> = sessions
        .iter()
        .filter(|session| matches!(session.connection, ConnectionState::Connected(_)))
        .collect();

    let state = scalar_consensus(&connected, |s| {
        fresh_value(&s.state, now, stale_after).copied()
    });
    let timing = scalar_consensus(&connected, |s| {
        fresh_value(&s.timing, now, stale_after).copied()
    });
    let trigger = scalar_consensus_by(
        &connected,
        |s| fresh_value(&s.trigger, now, stale_after).copied(),
        |t: &TriggerConfig| (t.threshold.to_bits(), t.channel, t.mode),
    );
    let static_info = scalar_consensus(&connected, |s| {
        s.info.as_ref().map(|info| StaticInfo {
            channels: info.channels,
            depth: info.depth,
            tick_khz: info.tick_khz,
            name_len: info.name_len,
            rt_capacity: info.rt_capacity,
        })
    });

    let variables = catalog_consensus(&connected, |s| s.variables.as_ref().map(|c| &c.value));
    let rt = catalog_consensus(&connected, |s| s.rt_labels.as_ref().map(|c| &c.value));

    // The channel map indexes into the variable catalog, so it is undefined
    // until the catalogs agree.
    let channel_map = if variables.complete {
        scalar_consensus(&connected, |s| {
            fresh_value(&s.channel_map, now, stale_after).cloned()
        })
    } else {
        FieldConsensus::Incomplete
    };

    let channel_labels =
        scalar_consensus(&connected, |s| s.channel_labels.as_ref().map(|l| l.value.clone()));

    let rt_values = if rt.complete {
        rt_value_consensus(&connected, &rt)
    } else {
        BTreeMap::new()
    };

    let completeness = Completeness {
        static_info: static_info.is_agreed(),
        timing: timing.is_agreed(),
        trigger: trigger.is_agreed(),
        channel_map: variables.complete && channel_map.is_agreed(),
        variables: variables.complete,
        rt: rt.complete,
    };

    ConsensusView {
        device_count: connected.len(),
        state,
        timing,
        trigger,
        static_info,
        channel_map,
        variables,
        rt,
        channel_labels,
        rt_values,
        completeness,
    }
}

fn fresh_value<'a, T>(
    stamped: &'a Option<Stamped<T>>,
    now: Instant,
    stale_after: Duration,
) -> Option<&'a T> {
    stamped
        .as_ref()
        .filter(|stamped| stamped.is_fresh(now, stale_after))
        .map(|stamped| &stamped.value)
}

/// Scalar agreement with plain equality.
fn scalar_consensus<T: Clone + PartialEq>(
    connected: &[&SessionState],
    value_of: impl Fn(&SessionState) -> Option<T>,
) -> FieldConsensus<T> {
    scalar_consensus_by(connected, value_of, |value| value.clone())
}

/// Scalar agreement with an explicit comparison key (used to compare floats
/// bit-for-bit).
fn scalar_consensus_by<T: Clone, K: PartialEq>(
    connected: &[&SessionState],
    value_of: impl Fn(&SessionState) -> Option<T>,
    key: impl Fn(&T) -> K,
) -> FieldConsensus<T> {
    if connected.is_empty() {
        return FieldConsensus::Incomplete;
    }

    let mut values: Vec<(String, T)> = Vec::with_capacity(connected.len());
    for session in connected {
        match value_of(session) {
            Some(value) => values.push((session.path.clone(), value)),
            None => return FieldConsensus::Incomplete,
        }
    }

    let first_key = key(&values[0].1);
    if values.iter().all(|(_, value)| key(value) == first_key) {
        let (_, value) = values.swap_remove(0);
        FieldConsensus::Agreed(value)
    } else {
        FieldConsensus::Mismatch(values.into_iter().collect())
    }
}

fn catalog_consensus<'a>(
    connected: &[&'a SessionState],
    catalog_of: impl Fn(&'a SessionState) -> Option<&'a Catalog>,
) -> CatalogConsensus {
    let mut consensus = CatalogConsensus::default();
    if connected.is_empty() {
        return consensus;
    }

    let mut name_sets: Vec<BTreeSet<String>> = Vec::with_capacity(connected.len());
    let mut all_present = true;

    for &session in connected {
        match catalog_of(session) {
            Some(catalog) => {
                let map: BTreeMap<String, u8> = catalog
                    .entries()
                    .iter()
                    .map(|entry| (entry.name.clone(), entry.index))
                    .collect();
                name_sets.push(map.keys().cloned().collect());
                consensus.per_device.insert(session.path.clone(), map);
            }
            None => all_present = false,
        }
    }

    if all_present {
        let first = &name_sets[0];
        if name_sets.iter().all(|set| set == first) {
            consensus.agreed_names = Some(first.clone());
            consensus.complete = true;
        }
    }

    consensus
}

/// Per-name RT value agreement, via each device's own index for the name.
fn rt_value_consensus(
    connected: &[&SessionState],
    rt: &CatalogConsensus,
) -> BTreeMap<String, FieldConsensus<f32>> {
    let names = match &rt.agreed_names {
        Some(names) => names,
        None => return BTreeMap::new(),
    };

    let mut out = BTreeMap::new();
    for name in names {
        let mut values: Vec<(String, f32)> = Vec::with_capacity(connected.len());
        let mut missing = false;

        for session in connected {
            let value = rt
                .resolve_index(&session.path, name)
                .and_then(|index| session.rt_values.get(&index))
                .map(|stamped| stamped.value);
            match value {
                Some(value) => values.push((session.path.clone(), value)),
                None => {
                    missing = true;
                    break;
                }
            }
        }

        let consensus = if missing || values.is_empty() {
            FieldConsensus::Incomplete
        } else {
            let first = values[0].1.to_bits();
            if values.iter().all(|(_, value)| value.to_bits() == first) {
                FieldConsensus::Agreed(values[0].1)
            } else {
                FieldConsensus::Mismatch(values.into_iter().collect())
            }
        };
        out.insert(name.clone(), consensus);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use vscope_protocol::{ByteOrder, CatalogEntry, DeviceInfo};

    fn info() -> DeviceInfo {
        DeviceInfo {
            order: ByteOrder::Little,
            channels: 5,
            depth: 1000,
            tick_khz: 20,
            var_count: 3,
            rt_count: 2,
            rt_capacity: 16,
            name_len: 16,
            name: "dev".into(),
        }
    }

    fn catalog(names: &[(&str, u8)]) -> Catalog {
        Catalog::new(
            names
                .iter()
                .map(|(name, index)| CatalogEntry {
                    index: *index,
                    name: (*name).to_string(),
                })
                .collect(),
        )
    }

    fn session(path: &str) -> SessionState {
        SessionState {
            path: path.to_string(),
            connection: ConnectionState::Connected(DeviceState::Stopped),
            info: Some(info()),
            state: Some(Stamped::now(DeviceState::Stopped)),
            timing: Some(Stamped::now(TimingConfig {
                divider: 10,
                pre_trig: 256,
            })),
            trigger: Some(Stamped::now(TriggerConfig::default())),
            channel_map: Some(Stamped::now(vec![0, 1, 2, 0, 0])),
            channel_labels: Some(Stamped::now(vec![
                "a".into(),
                "b".into(),
                "c".into(),
                "a".into(),
                "a".into(),
            ])),
            variables: Some(Stamped::now(catalog(&[("a", 0), ("b", 1), ("c", 2)]))),
            rt_labels: Some(Stamped::now(catalog(&[("kp", 0), ("ki", 1)]))),
            ..SessionState::default()
        }
    }

    fn view(sessions: &[SessionState]) -> ConsensusView {
        compute_consensus(sessions, Instant::now(), Duration::from_secs(5))
    }

    #[test]
    fn identical_sessions_agree_everywhere() {
        let sessions = vec![session("ttyA"), session("ttyB")];
        let view = view(&sessions);

        assert_eq!(view.device_count, 2);
        assert_eq!(
            view.timing.agreed(),
            Some(&TimingConfig {
                divider: 10,
                pre_trig: 256
            })
        );
        assert!(view.state.is_agreed());
        assert!(view.channel_map.is_agreed());
        assert!(view.variables.complete);
        assert!(view.completeness.command_gate());
    }

    #[test]
    fn single_session_trivially_satisfies_consensus() {
        let sessions = vec![session("only")];
        let view = view(&sessions);
        assert!(view.completeness.command_gate());
    }

    #[test]
    fn zero_sessions_are_incomplete() {
        let view = view(&[]);
        assert_eq!(view.device_count, 0);
        assert_eq!(view.timing, FieldConsensus::Incomplete);
        assert!(!view.completeness.command_gate());
    }

    #[test]
    fn divergent_timing_is_a_mismatch_keyed_by_path() {
        let mut b = session("ttyB");
        b.timing = Some(Stamped::now(TimingConfig {
            divider: 20,
            pre_trig: 256,
        }));
        let sessions = vec![session("ttyA"), b];
        let view = view(&sessions);

        match &view.timing {
            FieldConsensus::Mismatch(values) => {
                assert_eq!(values["ttyA"].divider, 10);
                assert_eq!(values["ttyB"].divider, 20);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
        assert!(!view.completeness.timing);
        assert!(!view.completeness.command_gate());
    }

    #[test]
    fn stale_value_blocks_consensus() {
        let mut b = session("ttyB");
        if let Some(stamped) = &mut b.timing {
            stamped.updated_at = Instant::now() - Duration::from_secs(60);
        }
        let sessions = vec![session("ttyA"), b];
        let view = view(&sessions);
        assert_eq!(view.timing, FieldConsensus::Incomplete);
        assert!(!view.completeness.timing);
    }

    #[test]
    fn disconnected_sessions_do_not_participate() {
        let mut b = session("ttyB");
        b.connection = ConnectionState::Disconnected;
        b.timing = Some(Stamped::now(TimingConfig {
            divider: 999,
            pre_trig: 0,
        }));
        let sessions = vec![session("ttyA"), b];
        let view = view(&sessions);
        assert_eq!(view.device_count, 1);
        assert!(view.timing.is_agreed());
    }

    #[test]
    fn reordered_catalogs_still_align_by_name() {
        // Same names, different device-local index order.
        let mut b = session("ttyB");
        b.rt_labels = Some(Stamped::now(catalog(&[("ki", 0), ("kp", 1)])));
        let sessions = vec![session("ttyA"), b];
        let view = view(&sessions);

        assert!(view.rt.complete);
        assert_eq!(view.rt.resolve_index("ttyA", "kp"), Some(0));
        assert_eq!(view.rt.resolve_index("ttyB", "kp"), Some(1));
        assert_eq!(view.rt.resolve_index("ttyA", "ki"), Some(1));
        assert_eq!(view.rt.resolve_index("ttyB", "ki"), Some(0));
    }

    #[test]
    fn rt_value_consensus_goes_through_local_indices() {
        let mut a = session("ttyA");
        a.rt_values.insert(0, Stamped::now(3.5)); // kp at index 0
        a.rt_values.insert(1, Stamped::now(0.25)); // ki at index 1

        let mut b = session("ttyB");
        b.rt_labels = Some(Stamped::now(catalog(&[("ki", 0), ("kp", 1)])));
        b.rt_values.insert(1, Stamped::now(3.5)); // kp at index 1
        b.rt_values.insert(0, Stamped::now(0.5)); // ki at index 0

        let view = view(&[a, b]);
        assert_eq!(view.rt_values["kp"], FieldConsensus::Agreed(3.5));
        match &view.rt_values["ki"] {
            FieldConsensus::Mismatch(values) => {
                assert_eq!(values["ttyA"], 0.25);
                assert_eq!(values["ttyB"], 0.5);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn divergent_catalogs_mark_concern_incomplete_not_mismatched() {
        let mut b = session("ttyB");
        b.variables = Some(Stamped::now(catalog(&[("a", 0), ("b", 1), ("d", 2)])));
        let sessions = vec![session("ttyA"), b];
        let view = view(&sessions);

        assert!(!view.variables.complete);
        assert!(view.variables.agreed_names.is_none());
        // Per-device maps are still available for display.
        assert_eq!(view.variables.resolve_index("ttyB", "d"), Some(2));
        // Channel map depends on variable consensus.
        assert_eq!(view.channel_map, FieldConsensus::Incomplete);
        assert!(!view.completeness.channel_map);
    }

    #[test]
    fn missing_catalog_blocks_rt_values() {
        let mut b = session("ttyB");
        b.rt_labels = None;
        let view = view(&[session("ttyA"), b]);
        assert!(!view.rt.complete);
        assert!(view.rt_values.is_empty());
    }

    #[test]
    fn trigger_threshold_compared_bitwise() {
        let mut a = session("ttyA");
        a.trigger = Some(Stamped::now(TriggerConfig {
            threshold: 0.0,
            channel: 0,
            mode: Default::default(),
        }));
        let mut b = session("ttyB");
        b.trigger = Some(Stamped::now(TriggerConfig {
            threshold: -0.0,
            channel: 0,
            mode: Default::default(),
        }));
        let view = view(&[a, b]);
        // 0.0 and -0.0 are == as floats but differ on the wire.
        assert!(matches!(view.trigger, FieldConsensus::Mismatch(_)));
    }
}
