//! Per-device session.
//!
//! One session owns one connected device: it fetches the immutable device
//! info and catalogs on connect, then polls at two independent cadences
//! (state at ~20 Hz, live frames at ~10 Hz while running) from a dedicated
//! thread. User-issued commands travel through a channel into the same
//! thread, so a poll read and a command write can never interleave on the
//! wire. Each device's thread is independent; one device stalling never
//! stalls another.
//!
//! There is no wire-level disconnect signal. The session infers
//! disconnection from consecutive timeouts ([`DISCONNECT_AFTER_TIMEOUTS`])
//! and tears itself down.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use vscope_protocol::{
    DeviceInfo, DeviceState, TimingConfig, TriggerConfig, CATALOG_COUNT_ALL,
};

use crate::catalog::{Catalog, CatalogFetch};
use crate::client::{DeviceClient, RequestError};
use crate::settings::Settings;
use crate::snapshot::{fetch_snapshot, Snapshot};
use crate::transport::{DeviceHandle, SerialConfig, SerialLink, Transport, TransportError};

/// Consecutive timeouts after which the device counts as disconnected.
pub const DISCONNECT_AFTER_TIMEOUTS: u32 = 5;

/// Restarts tolerated while fetching one catalog before giving up.
const CATALOG_RESTART_LIMIT: u32 = 8;

/// Connection lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No link, or torn down after disconnect inference.
    #[default]
    Disconnected,
    /// Link open; info and catalogs being fetched.
    Connecting,
    /// Fully up; the inner value is the last polled device run state.
    Connected(DeviceState),
}

/// A value plus when it was last refreshed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stamped<T> {
    /// The decoded value.
    pub value: T,
    /// When the value was last refreshed.
    pub updated_at: Instant,
}

impl<T> Stamped<T> {
    /// Stamp a value with the current instant.
    pub fn now(value: T) -> Self {
        Stamped {
            value,
            updated_at: Instant::now(),
        }
    }

    /// Whether the value is younger than `bound` as of `now`.
    pub fn is_fresh(&self, now: Instant, bound: std::time::Duration) -> bool {
        now.saturating_duration_since(self.updated_at) <= bound
    }
}

/// Everything known about one device, as last decoded off the wire.
///
/// Mutated only by the session's own poll thread and its in-flight command
/// results; everything else reads cloned snapshots.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    /// Connection path (or label, for simulated links).
    pub path: String,
    /// Lifecycle state.
    pub connection: ConnectionState,
    /// Static device info, fetched once per connection.
    pub info: Option<DeviceInfo>,
    /// Last polled run state.
    pub state: Option<Stamped<DeviceState>>,
    /// Last polled timing.
    pub timing: Option<Stamped<TimingConfig>>,
    /// Last polled trigger configuration.
    pub trigger: Option<Stamped<TriggerConfig>>,
    /// Last polled channel→variable map.
    pub channel_map: Option<Stamped<Vec<u8>>>,
    /// Labels of the mapped channels, fetched with the catalogs.
    pub channel_labels: Option<Stamped<Vec<String>>>,
    /// Variable catalog, fetched once per connection or on resync.
    pub variables: Option<Stamped<Catalog>>,
    /// RT register catalog, fetched once per connection or on resync.
    pub rt_labels: Option<Stamped<Catalog>>,
    /// RT register values read or written this session, by index.
    pub rt_values: BTreeMap<u8, Stamped<f32>>,
    /// Last live sample frame (only refreshed while running).
    pub live_frame: Option<Stamped<Vec<f32>>>,
    /// Most recent protocol or transport fault, kept for display.
    pub last_fault: Option<RequestError>,
    /// Consecutive timeouts; feeds disconnect inference.
    pub consecutive_timeouts: u32,
}

/// Notifications emitted by a session to its observers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Info and catalogs fetched; polling started.
    Connected {
        /// Session path.
        path: String,
    },
    /// Some state field was refreshed.
    Updated {
        /// Session path.
        path: String,
    },
    /// A request failed; polling continues.
    Fault {
        /// Session path.
        path: String,
        /// What failed.
        error: RequestError,
    },
    /// The session tore down (explicit stop or disconnect inference).
    Disconnected {
        /// Session path.
        path: String,
    },
}

/// Commands routed into the session thread.
enum SessionCommand {
    SetTiming(TimingConfig, Sender<Result<TimingConfig, RequestError>>),
    SetState(DeviceState, Sender<Result<DeviceState, RequestError>>),
    SetTrigger(TriggerConfig, Sender<Result<TriggerConfig, RequestError>>),
    SetChannelMap(Vec<u8>, Sender<Result<Vec<u8>, RequestError>>),
    ReadRtBuffer(u8, Sender<Result<f32, RequestError>>),
    WriteRtBuffer(u8, f32, Sender<Result<f32, RequestError>>),
    FireTrigger(Sender<Result<(), RequestError>>),
    ResyncCatalogs(Sender<Result<(), RequestError>>),
    FetchSnapshot(Sender<Result<Option<Snapshot>, RequestError>>),
}

/// Handle to a running device session.
///
/// Dropping the handle stops the poll thread; [`stop`](Self::stop) waits
/// for it.
pub struct DeviceSession {
    path: String,
    shared: Arc<Mutex<SessionState>>,
    commands: Sender<SessionCommand>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceSession {
    /// Open a serial port and start a session over it.
    pub fn connect_path(
        transport: Arc<Transport>,
        path: &str,
        serial: &SerialConfig,
        settings: Settings,
        events: Sender<SessionEvent>,
    ) -> Result<Self, TransportError> {
        settings.validate()?;
        let handle = transport.open(path, serial)?;
        Ok(Self::spawn(transport, handle, path.to_string(), settings, events))
    }

    /// Start a session over an already-constructed link (e.g. a simulated
    /// device).
    pub fn connect_link(
        transport: Arc<Transport>,
        link: Box<dyn SerialLink>,
        label: &str,
        settings: Settings,
        events: Sender<SessionEvent>,
    ) -> Result<Self, TransportError> {
        settings.validate()?;
        let handle = transport.register(link)?;
        Ok(Self::spawn(transport, handle, label.to_string(), settings, events))
    }

    fn spawn(
        transport: Arc<Transport>,
        handle: DeviceHandle,
        path: String,
        settings: Settings,
        events: Sender<SessionEvent>,
    ) -> Self {
        let shared = Arc::new(Mutex::new(SessionState {
            path: path.clone(),
            connection: ConnectionState::Connecting,
            ..SessionState::default()
        }));
        let stop = Arc::new(AtomicBool::new(false));
        let (commands_tx, commands_rx) = bounded(16);

        let runner = Runner {
            transport,
            handle,
            path: path.clone(),
            settings,
            shared: Arc::clone(&shared),
            events,
            stop: Arc::clone(&stop),
        };
        let thread = std::thread::Builder::new()
            .name(format!("vscope-session-{path}"))
            .spawn(move || runner.run(commands_rx))
            .expect("failed to spawn session thread");

        DeviceSession {
            path,
            shared,
            commands: commands_tx,
            stop,
            thread: Some(thread),
        }
    }

    /// Session path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// A clone of the current session state.
    pub fn state(&self) -> SessionState {
        match self.shared.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn dispatch<T>(
        &self,
        build: impl FnOnce(Sender<Result<T, RequestError>>) -> SessionCommand,
    ) -> Result<T, RequestError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.commands.send(build(reply_tx)).map_err(|_| {
            RequestError::Transport(TransportError::IoError {
                message: "session stopped".to_string(),
            })
        })?;
        reply_rx.recv().map_err(|_| {
            RequestError::Transport(TransportError::IoError {
                message: "session stopped".to_string(),
            })
        })?
    }

    /// Write the acquisition timing through the session thread.
    pub fn set_timing(&self, timing: TimingConfig) -> Result<TimingConfig, RequestError> {
        self.dispatch(|reply| SessionCommand::SetTiming(timing, reply))
    }

    /// Request a device run state change.
    pub fn set_state(&self, state: DeviceState) -> Result<DeviceState, RequestError> {
        self.dispatch(|reply| SessionCommand::SetState(state, reply))
    }

    /// Write the trigger configuration.
    pub fn set_trigger(&self, trigger: TriggerConfig) -> Result<TriggerConfig, RequestError> {
        self.dispatch(|reply| SessionCommand::SetTrigger(trigger, reply))
    }

    /// Write the channel→variable map.
    pub fn set_channel_map(&self, map: Vec<u8>) -> Result<Vec<u8>, RequestError> {
        self.dispatch(|reply| SessionCommand::SetChannelMap(map, reply))
    }

    /// Read one RT register.
    pub fn read_rt_buffer(&self, index: u8) -> Result<f32, RequestError> {
        self.dispatch(|reply| SessionCommand::ReadRtBuffer(index, reply))
    }

    /// Write one RT register.
    pub fn write_rt_buffer(&self, index: u8, value: f32) -> Result<f32, RequestError> {
        self.dispatch(|reply| SessionCommand::WriteRtBuffer(index, value, reply))
    }

    /// Manually fire the trigger.
    pub fn fire_trigger(&self) -> Result<(), RequestError> {
        self.dispatch(SessionCommand::FireTrigger)
    }

    /// Drop and refetch every catalog.
    pub fn resync_catalogs(&self) -> Result<(), RequestError> {
        self.dispatch(SessionCommand::ResyncCatalogs)
    }

    /// Fetch the last completed acquisition. `Ok(None)` while no snapshot
    /// is valid yet.
    pub fn fetch_snapshot(&self) -> Result<Option<Snapshot>, RequestError> {
        self.dispatch(SessionCommand::FetchSnapshot)
    }

    /// Stop polling and wait for the session thread to exit.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // The thread notices the flag on its next tick; no join in drop.
    }
}

struct Runner {
    transport: Arc<Transport>,
    handle: DeviceHandle,
    path: String,
    settings: Settings,
    shared: Arc<Mutex<SessionState>>,
    events: Sender<SessionEvent>,
    stop: Arc<AtomicBool>,
}

impl Runner {
    fn run(self, commands: Receiver<SessionCommand>) {
        let mut client = DeviceClient::new(
            Arc::clone(&self.transport),
            self.handle,
            self.settings.request_timeout(),
            self.settings.crc_retry_attempts,
        );

        if self.connect(&mut client) {
            self.poll_loop(&client, &commands);
        }

        let _ = self.transport.close(self.handle);
        self.with_state(|state| state.connection = ConnectionState::Disconnected);
        self.emit(SessionEvent::Disconnected {
            path: self.path.clone(),
        });
        info!("session {} ended", self.path);
    }

    /// Fetch info and catalogs. Returns false when the device never
    /// answered, in which case the session ends immediately.
    fn connect(&self, client: &mut DeviceClient) -> bool {
        let info = match client.fetch_info() {
            Ok(info) => info,
            Err(error) => {
                warn!("{}: device info fetch failed: {error}", self.path);
                self.record_fault(&error);
                return false;
            }
        };
        debug!(
            "{}: connected to '{}' ({} channels, {} vars)",
            self.path, info.name, info.channels, info.var_count
        );
        self.with_state(|state| {
            state.info = Some(info.clone());
            state.connection = ConnectionState::Connected(DeviceState::Stopped);
        });

        self.fetch_catalogs(client);
        self.emit(SessionEvent::Connected {
            path: self.path.clone(),
        });
        true
    }

    fn poll_loop(&self, client: &DeviceClient, commands: &Receiver<SessionCommand>) {
        let state_period = self.settings.state_poll_period();
        let frame_period = self.settings.frame_poll_period();
        let mut next_state_poll = Instant::now();
        let mut next_frame_poll = Instant::now();

        while !self.stop.load(Ordering::Relaxed) {
            if self.inferred_disconnect() {
                warn!(
                    "{}: {DISCONNECT_AFTER_TIMEOUTS} consecutive timeouts, inferring disconnect",
                    self.path
                );
                return;
            }

            let now = Instant::now();
            if now >= next_state_poll {
                self.poll_state(client);
                next_state_poll = now + state_period;
            }
            let now = Instant::now();
            if now >= next_frame_poll {
                self.poll_frame(client);
                next_frame_poll = now + frame_period;
            }

            let wake = next_state_poll.min(next_frame_poll);
            let wait = wake.saturating_duration_since(Instant::now());
            match commands.recv_timeout(wait) {
                Ok(command) => self.handle_command(client, command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn inferred_disconnect(&self) -> bool {
        self.with_state(|state| state.consecutive_timeouts) >= DISCONNECT_AFTER_TIMEOUTS
    }

    /// Refresh state, timing, trigger, and channel map.
    fn poll_state(&self, client: &DeviceClient) {
        match client.get_state() {
            Ok(device_state) => self.apply(|state| {
                state.state = Some(Stamped::now(device_state));
                state.connection = ConnectionState::Connected(device_state);
            }),
            Err(error) => self.record_fault(&error),
        }
        match client.get_timing() {
            Ok(timing) => self.apply(|state| state.timing = Some(Stamped::now(timing))),
            Err(error) => self.record_fault(&error),
        }
        match client.get_trigger() {
            Ok(trigger) => self.apply(|state| state.trigger = Some(Stamped::now(trigger))),
            Err(error) => self.record_fault(&error),
        }
        match client.get_channel_map() {
            Ok(map) => self.apply(|state| state.channel_map = Some(Stamped::now(map))),
            Err(error) => self.record_fault(&error),
        }
    }

    /// Fetch a live frame, only while the device is running.
    fn poll_frame(&self, client: &DeviceClient) {
        let running = self.with_state(|state| {
            matches!(state.connection, ConnectionState::Connected(DeviceState::Running))
        });
        if !running {
            return;
        }
        match client.get_frame() {
            Ok(frame) => self.apply(|state| state.live_frame = Some(Stamped::now(frame))),
            Err(error) => self.record_fault(&error),
        }
    }

    fn handle_command(&self, client: &DeviceClient, command: SessionCommand) {
        match command {
            SessionCommand::SetTiming(timing, reply) => {
                let result = client.set_timing(timing);
                self.absorb_result(&result, |state, timing| {
                    state.timing = Some(Stamped::now(*timing));
                });
                let _ = reply.send(result);
            }
            SessionCommand::SetState(requested, reply) => {
                let result = client.set_state(requested);
                self.absorb_result(&result, |state, echoed| {
                    state.state = Some(Stamped::now(*echoed));
                });
                let _ = reply.send(result);
            }
            SessionCommand::SetTrigger(trigger, reply) => {
                let result = client.set_trigger(trigger);
                self.absorb_result(&result, |state, trigger| {
                    state.trigger = Some(Stamped::now(*trigger));
                });
                let _ = reply.send(result);
            }
            SessionCommand::SetChannelMap(map, reply) => {
                let result = client.set_channel_map(map);
                self.absorb_result(&result, |state, map: &Vec<u8>| {
                    state.channel_map = Some(Stamped::now(map.clone()));
                });
                let _ = reply.send(result);
            }
            SessionCommand::ReadRtBuffer(index, reply) => {
                let result = client.get_rt_buffer(index);
                self.absorb_result(&result, |state, value| {
                    state.rt_values.insert(index, Stamped::now(*value));
                });
                let _ = reply.send(result);
            }
            SessionCommand::WriteRtBuffer(index, value, reply) => {
                let result = client.set_rt_buffer(index, value);
                self.absorb_result(&result, |state, stored| {
                    state.rt_values.insert(index, Stamped::now(*stored));
                });
                let _ = reply.send(result);
            }
            SessionCommand::FireTrigger(reply) => {
                let result = client.trigger();
                if let Err(error) = &result {
                    self.record_fault(error);
                } else {
                    self.clear_timeouts();
                }
                let _ = reply.send(result);
            }
            SessionCommand::ResyncCatalogs(reply) => {
                self.with_state(|state| {
                    state.variables = None;
                    state.rt_labels = None;
                    state.channel_labels = None;
                });
                self.fetch_catalogs(client);
                let _ = reply.send(Ok(()));
            }
            SessionCommand::FetchSnapshot(reply) => {
                let result = fetch_snapshot(client);
                if let Err(error) = &result {
                    self.record_fault(error);
                } else {
                    self.clear_timeouts();
                }
                let _ = reply.send(result);
            }
        }
    }

    /// Fetch variable catalog, RT catalog, and channel labels.
    fn fetch_catalogs(&self, client: &DeviceClient) {
        match fetch_paged_catalog(client, CatalogKind::Variables) {
            Ok(catalog) => self.apply(|state| state.variables = Some(Stamped::now(catalog))),
            Err(error) => self.record_fault(&error),
        }
        match fetch_paged_catalog(client, CatalogKind::RtLabels) {
            Ok(catalog) => self.apply(|state| state.rt_labels = Some(Stamped::now(catalog))),
            Err(error) => self.record_fault(&error),
        }
        match client.get_channel_labels() {
            Ok(labels) => self.apply(|state| state.channel_labels = Some(Stamped::now(labels))),
            Err(error) => self.record_fault(&error),
        }
    }

    fn absorb_result<T>(
        &self,
        result: &Result<T, RequestError>,
        on_ok: impl FnOnce(&mut SessionState, &T),
    ) {
        match result {
            Ok(value) => {
                self.with_state(|state| {
                    state.consecutive_timeouts = 0;
                    on_ok(state, value);
                });
                self.emit(SessionEvent::Updated {
                    path: self.path.clone(),
                });
            }
            Err(error) => self.record_fault(error),
        }
    }

    fn apply(&self, mutate: impl FnOnce(&mut SessionState)) {
        self.with_state(|state| {
            state.consecutive_timeouts = 0;
            mutate(state);
        });
        self.emit(SessionEvent::Updated {
            path: self.path.clone(),
        });
    }

    fn clear_timeouts(&self) {
        self.with_state(|state| state.consecutive_timeouts = 0);
    }

    fn record_fault(&self, error: &RequestError) {
        self.with_state(|state| {
            if error.is_timeout() {
                state.consecutive_timeouts += 1;
            }
            state.last_fault = Some(error.clone());
        });
        self.emit(SessionEvent::Fault {
            path: self.path.clone(),
            error: error.clone(),
        });
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut guard = match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn emit(&self, event: SessionEvent) {
        // Observers may have gone away; polling does not care.
        let _ = self.events.send(event);
    }
}

/// Which paged catalog to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogKind {
    /// Acquisition variables.
    Variables,
    /// RT register labels.
    RtLabels,
}

/// Drive a paged catalog fetch to convergence.
///
/// Pages are requested window by window and merged; a change in the
/// device-declared total restarts from zero. A shrinking total can also
/// surface as a `BadParam` on a window past the new end, which restarts the
/// fetch the same way.
pub fn fetch_paged_catalog(
    client: &DeviceClient,
    kind: CatalogKind,
) -> Result<Catalog, RequestError> {
    fetch_paged_catalog_with(client, kind, CATALOG_COUNT_ALL)
}

/// [`fetch_paged_catalog`] with an explicit page size, for callers (and
/// tests) that want small windows.
pub fn fetch_paged_catalog_with(
    client: &DeviceClient,
    kind: CatalogKind,
    page_size: u8,
) -> Result<Catalog, RequestError> {
    let mut fetch = CatalogFetch::new();
    let mut restarts = 0;
    let mut rounds = 0;

    while let Some((start, count)) = fetch.next_window(page_size) {
        rounds += 1;
        if rounds > 1024 {
            return Err(RequestError::Protocol(
                vscope_protocol::ProtocolError::decode("catalog fetch did not converge"),
            ));
        }
        let page = match kind {
            CatalogKind::Variables => client.get_var_list(start, count),
            CatalogKind::RtLabels => client.get_rt_labels(start, count),
        };
        let page = match page {
            Ok(page) => page,
            Err(RequestError::Protocol(vscope_protocol::ProtocolError::Device(
                vscope_protocol::DeviceStatus::BadParam,
            ))) if start > 0 => {
                // The catalog shrank under us; start over.
                restarts += 1;
                if restarts > CATALOG_RESTART_LIMIT {
                    return Err(RequestError::Protocol(
                        vscope_protocol::ProtocolError::decode(
                            "catalog kept changing during fetch",
                        ),
                    ));
                }
                fetch = CatalogFetch::new();
                continue;
            }
            Err(error) => return Err(error),
        };

        if fetch.absorb(&page) == crate::catalog::PageOutcome::Restarted {
            restarts += 1;
            if restarts > CATALOG_RESTART_LIMIT {
                return Err(RequestError::Protocol(
                    vscope_protocol::ProtocolError::decode("catalog kept changing during fetch"),
                ));
            }
        }
    }

    Ok(fetch.finish().unwrap_or_default())
}
