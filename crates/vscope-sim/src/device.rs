//! The simulated device.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use vscope_protocol::{
    encode_frame, put_name, ByteOrder, DeviceState, FrameDecoder, TimingConfig, TriggerConfig,
    TriggerMode, CATALOG_COUNT_ALL, INFO_FLAG_BIG_ENDIAN, MAX_PAYLOAD, MSG_ERROR, MSG_GET_CHANNEL_LABELS,
    MSG_GET_CHANNEL_MAP, MSG_GET_FRAME, MSG_GET_INFO, MSG_GET_RT_BUFFER, MSG_GET_RT_LABELS,
    MSG_GET_SNAPSHOT_DATA, MSG_GET_SNAPSHOT_HEADER, MSG_GET_STATE, MSG_GET_TIMING,
    MSG_GET_TRIGGER, MSG_GET_VAR_LIST, MSG_SET_CHANNEL_MAP, MSG_SET_RT_BUFFER, MSG_SET_STATE,
    MSG_SET_TIMING, MSG_SET_TRIGGER, MSG_TRIGGER, STATUS_BAD_LEN, STATUS_BAD_PARAM,
    STATUS_NOT_READY, STATUS_RANGE,
};

/// Geometry and identity of a simulated device.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Device name reported by GetInfo.
    pub name: String,
    /// Byte order the device speaks.
    pub order: ByteOrder,
    /// Number of capture channels.
    pub channels: u8,
    /// Capture buffer depth in samples.
    pub depth: u16,
    /// Acquisition tick rate in kHz (informational).
    pub tick_khz: u16,
    /// Width of fixed name slots.
    pub name_len: u8,
    /// RT register slots.
    pub rt_capacity: u8,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            name: "simdev".to_string(),
            order: ByteOrder::Little,
            channels: 5,
            depth: 1000,
            tick_khz: 20,
            name_len: 16,
            rt_capacity: 16,
        }
    }
}

/// Snapshot metadata latched when an acquisition arms.
#[derive(Debug, Clone, Default)]
struct SnapshotMeta {
    channel_map: Vec<u8>,
    timing: TimingConfig,
    trigger: TriggerConfig,
    rt_values: Vec<f32>,
}

struct Core {
    config: SimConfig,

    state: DeviceState,
    requested: DeviceState,

    timing: TimingConfig,
    acq_time: u32,

    trigger: TriggerConfig,
    trigger_stale: bool,
    last_delta: f32,

    vars: Vec<(String, f32)>,
    rt: Vec<(String, f32)>,
    channel_map: Vec<u8>,

    buffer: Vec<Vec<f32>>,
    write_index: usize,
    first_element: usize,
    run_index: u32,
    divider_ticks: u32,

    snapshot: SnapshotMeta,
    snapshot_valid: bool,

    rx: FrameDecoder,
    tx: VecDeque<u8>,
    wire_log: Vec<u8>,

    read_timeout: Duration,
    muted: bool,
    corrupt_next_crc: bool,
    response_delay: Duration,
}

impl Core {
    fn new(config: SimConfig, vars: Vec<(String, f32)>, rt: Vec<(String, f32)>) -> Self {
        let channels = config.channels as usize;
        let depth = config.depth as usize;

        let state = if vars.len() < channels {
            DeviceState::Misconfigured
        } else {
            DeviceState::Stopped
        };

        let channel_map: Vec<u8> = (0..config.channels)
            .map(|i| if (i as usize) < vars.len() { i } else { 0 })
            .collect();

        Core {
            state,
            requested: DeviceState::Stopped,
            timing: TimingConfig {
                divider: 1,
                pre_trig: 0,
            },
            acq_time: config.depth as u32,
            trigger: TriggerConfig::default(),
            trigger_stale: true,
            last_delta: 0.0,
            vars,
            rt,
            channel_map,
            buffer: vec![vec![0.0; channels]; depth],
            write_index: 0,
            first_element: 0,
            run_index: 0,
            divider_ticks: 0,
            snapshot: SnapshotMeta::default(),
            snapshot_valid: false,
            rx: FrameDecoder::new(),
            tx: VecDeque::new(),
            wire_log: Vec::new(),
            read_timeout: Duration::from_millis(1),
            muted: false,
            corrupt_next_crc: false,
            response_delay: Duration::ZERO,
            config,
        }
    }

    fn channel_value(&self, channel: usize) -> f32 {
        let var = self.channel_map[channel] as usize;
        self.vars.get(var).map(|(_, v)| *v).unwrap_or(0.0)
    }

    fn send(&mut self, msg_type: u8, payload: &[u8]) {
        if self.muted {
            return;
        }
        let mut frame = match encode_frame(msg_type, payload) {
            Ok(frame) => frame,
            Err(_) => return,
        };
        if self.corrupt_next_crc {
            self.corrupt_next_crc = false;
            let last = frame.len() - 1;
            frame[last] ^= 0xFF;
        }
        self.tx.extend(frame);
    }

    fn send_error(&mut self, code: u8) {
        self.send(MSG_ERROR, &[code]);
    }

    // ------------------------------------------------------------------
    // Request handlers
    // ------------------------------------------------------------------

    fn handle_frame(&mut self, msg_type: u8, payload: &[u8]) {
        match msg_type {
            MSG_GET_INFO => self.zero_arg(payload, Self::handle_get_info),
            MSG_GET_TIMING => self.zero_arg(payload, Self::handle_get_timing),
            MSG_SET_TIMING => self.handle_set_timing(payload),
            MSG_GET_STATE => self.zero_arg(payload, Self::handle_get_state),
            MSG_SET_STATE => self.handle_set_state(payload),
            MSG_TRIGGER => self.zero_arg(payload, Self::handle_trigger),
            MSG_GET_FRAME => self.zero_arg(payload, Self::handle_get_frame),
            MSG_GET_SNAPSHOT_HEADER => self.zero_arg(payload, Self::handle_snapshot_header),
            MSG_GET_SNAPSHOT_DATA => self.handle_snapshot_data(payload),
            MSG_GET_VAR_LIST => self.handle_catalog(payload, MSG_GET_VAR_LIST),
            MSG_GET_CHANNEL_MAP => self.zero_arg(payload, Self::handle_get_channel_map),
            MSG_SET_CHANNEL_MAP => self.handle_set_channel_map(payload),
            MSG_GET_CHANNEL_LABELS => self.zero_arg(payload, Self::handle_channel_labels),
            MSG_GET_RT_LABELS => self.handle_catalog(payload, MSG_GET_RT_LABELS),
            MSG_GET_RT_BUFFER => self.handle_get_rt(payload),
            MSG_SET_RT_BUFFER => self.handle_set_rt(payload),
            MSG_GET_TRIGGER => self.zero_arg(payload, Self::handle_get_trigger),
            MSG_SET_TRIGGER => self.handle_set_trigger(payload),
            _ => self.send_error(STATUS_BAD_PARAM),
        }
    }

    fn zero_arg(&mut self, payload: &[u8], handler: fn(&mut Self)) {
        if payload.is_empty() {
            handler(self);
        } else {
            self.send_error(STATUS_BAD_LEN);
        }
    }

    fn handle_get_info(&mut self) {
        let order = self.config.order;
        let mut data = Vec::new();
        data.push(match order {
            ByteOrder::Big => INFO_FLAG_BIG_ENDIAN,
            ByteOrder::Little => 0,
        });
        data.push(self.config.channels);
        order.put_u16(&mut data, self.config.depth);
        order.put_u16(&mut data, self.config.tick_khz);
        data.push(self.vars.len() as u8);
        data.push(self.rt.len() as u8);
        data.push(self.config.rt_capacity);
        data.push(self.config.name_len);
        let name = self.config.name.clone();
        put_name(&mut data, &name, self.config.name_len as usize);
        self.send(MSG_GET_INFO, &data);
    }

    fn timing_payload(&self) -> Vec<u8> {
        let mut data = Vec::new();
        self.config.order.put_u32(&mut data, self.timing.divider);
        self.config.order.put_u32(&mut data, self.timing.pre_trig);
        data
    }

    fn handle_get_timing(&mut self) {
        let data = self.timing_payload();
        self.send(MSG_GET_TIMING, &data);
    }

    fn handle_set_timing(&mut self, payload: &[u8]) {
        if payload.len() != 8 {
            self.send_error(STATUS_BAD_LEN);
            return;
        }

        let order = self.config.order;
        let divider = order.read_u32(&payload[0..]);
        let pre_trig = order.read_u32(&payload[4..]);

        if divider == 0 || pre_trig > self.config.depth as u32 {
            self.send_error(STATUS_BAD_PARAM);
            return;
        }
        if self.state != DeviceState::Stopped {
            self.send_error(STATUS_BAD_PARAM);
            return;
        }

        self.timing = TimingConfig { divider, pre_trig };
        self.acq_time = self.config.depth as u32 - pre_trig;
        let data = self.timing_payload();
        self.send(MSG_SET_TIMING, &data);
    }

    fn handle_get_state(&mut self) {
        let state = self.state as u8;
        self.send(MSG_GET_STATE, &[state]);
    }

    fn handle_set_state(&mut self, payload: &[u8]) {
        if payload.len() != 1 {
            self.send_error(STATUS_BAD_LEN);
            return;
        }
        if payload[0] > DeviceState::Acquiring as u8 {
            self.send_error(STATUS_BAD_PARAM);
            return;
        }
        self.requested = match payload[0] {
            0 => DeviceState::Stopped,
            1 => DeviceState::Running,
            _ => DeviceState::Acquiring,
        };
        let state = self.state as u8;
        self.send(MSG_SET_STATE, &[state]);
    }

    fn handle_trigger(&mut self) {
        self.fire_trigger();
        self.send(MSG_TRIGGER, &[]);
    }

    fn handle_get_frame(&mut self) {
        let order = self.config.order;
        let mut data = Vec::new();
        for channel in 0..self.config.channels as usize {
            order.put_f32(&mut data, self.channel_value(channel));
        }
        self.send(MSG_GET_FRAME, &data);
    }

    fn handle_snapshot_header(&mut self) {
        if !self.snapshot_valid {
            self.send_error(STATUS_NOT_READY);
            return;
        }

        let order = self.config.order;
        let meta = self.snapshot.clone();
        let mut data = meta.channel_map.clone();
        order.put_u32(&mut data, meta.timing.divider);
        order.put_u32(&mut data, meta.timing.pre_trig);
        order.put_f32(&mut data, meta.trigger.threshold);
        data.push(meta.trigger.channel);
        data.push(meta.trigger.mode as u8);
        for value in &meta.rt_values {
            order.put_f32(&mut data, *value);
        }
        self.send(MSG_GET_SNAPSHOT_HEADER, &data);
    }

    fn handle_snapshot_data(&mut self, payload: &[u8]) {
        if !self.snapshot_valid {
            self.send_error(STATUS_NOT_READY);
            return;
        }
        if payload.len() != 3 {
            self.send_error(STATUS_BAD_LEN);
            return;
        }

        let order = self.config.order;
        let depth = self.config.depth as u32;
        let start = order.read_u16(payload) as u32;
        let count = payload[2] as u32;

        if start >= depth || count == 0 || count > depth || start + count > depth {
            self.send_error(STATUS_BAD_PARAM);
            return;
        }

        let channels = self.config.channels as usize;
        let max_samples = (MAX_PAYLOAD / (channels * 4)) as u32;
        if count > max_samples {
            self.send_error(STATUS_BAD_LEN);
            return;
        }

        let mut data = Vec::new();
        for i in 0..count {
            let index = ((self.first_element as u32 + start + i) % depth) as usize;
            for channel in 0..channels {
                order.put_f32(&mut data, self.buffer[index][channel]);
            }
        }
        self.send(MSG_GET_SNAPSHOT_DATA, &data);
    }

    fn handle_catalog(&mut self, payload: &[u8], msg_type: u8) {
        if payload.len() > 2 {
            self.send_error(STATUS_BAD_LEN);
            return;
        }
        let start = payload.first().copied().unwrap_or(0);
        let requested = payload.get(1).copied().unwrap_or(CATALOG_COUNT_ALL);

        let entries: Vec<(String, f32)> = if msg_type == MSG_GET_VAR_LIST {
            self.vars.clone()
        } else {
            self.rt.clone()
        };

        if start as usize > entries.len() {
            self.send_error(STATUS_BAD_PARAM);
            return;
        }

        let name_len = self.config.name_len as usize;
        let entry_size = 1 + name_len;
        let max_entries = (MAX_PAYLOAD - 3) / entry_size;
        let available = entries.len() - start as usize;
        let desired = if requested == CATALOG_COUNT_ALL {
            available
        } else {
            requested as usize
        };
        let count = desired.min(available).min(max_entries);

        let mut data = vec![entries.len() as u8, start, count as u8];
        for i in 0..count {
            let index = start as usize + i;
            data.push(index as u8);
            put_name(&mut data, &entries[index].0, name_len);
        }
        self.send(msg_type, &data);
    }

    fn handle_get_channel_map(&mut self) {
        let map = self.channel_map.clone();
        self.send(MSG_GET_CHANNEL_MAP, &map);
    }

    fn handle_set_channel_map(&mut self, payload: &[u8]) {
        if payload.len() != self.config.channels as usize {
            self.send_error(STATUS_BAD_LEN);
            return;
        }
        if payload.iter().any(|&id| id as usize >= self.vars.len()) {
            self.send_error(STATUS_BAD_PARAM);
            return;
        }
        self.channel_map = payload.to_vec();
        let map = self.channel_map.clone();
        self.send(MSG_SET_CHANNEL_MAP, &map);
    }

    fn handle_channel_labels(&mut self) {
        let name_len = self.config.name_len as usize;
        let mut data = Vec::new();
        for channel in 0..self.config.channels as usize {
            let var = self.channel_map[channel] as usize;
            match self.vars.get(var) {
                Some((name, _)) => {
                    let name = name.clone();
                    put_name(&mut data, &name, name_len);
                }
                None => data.resize(data.len() + name_len, 0),
            }
        }
        self.send(MSG_GET_CHANNEL_LABELS, &data);
    }

    fn handle_get_rt(&mut self, payload: &[u8]) {
        if payload.len() != 1 {
            self.send_error(STATUS_BAD_LEN);
            return;
        }
        let index = payload[0] as usize;
        if index >= self.rt.len() {
            self.send_error(STATUS_RANGE);
            return;
        }
        let mut data = Vec::new();
        self.config.order.put_f32(&mut data, self.rt[index].1);
        self.send(MSG_GET_RT_BUFFER, &data);
    }

    fn handle_set_rt(&mut self, payload: &[u8]) {
        if payload.len() != 5 {
            self.send_error(STATUS_BAD_LEN);
            return;
        }
        let index = payload[0] as usize;
        if index >= self.rt.len() {
            self.send_error(STATUS_RANGE);
            return;
        }
        self.rt[index].1 = self.config.order.read_f32(&payload[1..]);
        let mut data = Vec::new();
        self.config.order.put_f32(&mut data, self.rt[index].1);
        self.send(MSG_SET_RT_BUFFER, &data);
    }

    fn trigger_payload(&self) -> Vec<u8> {
        let mut data = Vec::new();
        self.config.order.put_f32(&mut data, self.trigger.threshold);
        data.push(self.trigger.channel);
        data.push(self.trigger.mode as u8);
        data
    }

    fn handle_get_trigger(&mut self) {
        let data = self.trigger_payload();
        self.send(MSG_GET_TRIGGER, &data);
    }

    fn handle_set_trigger(&mut self, payload: &[u8]) {
        if payload.len() != 6 {
            self.send_error(STATUS_BAD_LEN);
            return;
        }
        let threshold = self.config.order.read_f32(&payload[0..]);
        let channel = payload[4];
        let mode = payload[5];
        if channel >= self.config.channels || mode > TriggerMode::Both as u8 {
            self.send_error(STATUS_BAD_PARAM);
            return;
        }
        self.trigger = TriggerConfig {
            threshold,
            channel,
            mode: match mode {
                0 => TriggerMode::Disabled,
                1 => TriggerMode::Rising,
                2 => TriggerMode::Falling,
                _ => TriggerMode::Both,
            },
        };
        self.trigger_stale = true;
        let data = self.trigger_payload();
        self.send(MSG_SET_TRIGGER, &data);
    }

    // ------------------------------------------------------------------
    // Acquisition state machine
    // ------------------------------------------------------------------

    fn fire_trigger(&mut self) {
        if self.state == DeviceState::Running {
            self.requested = DeviceState::Acquiring;
        }
    }

    fn latch_snapshot_meta(&mut self) {
        self.snapshot = SnapshotMeta {
            channel_map: self.channel_map.clone(),
            timing: self.timing,
            trigger: self.trigger,
            rt_values: self.rt.iter().map(|(_, v)| *v).collect(),
        };
    }

    fn save_frame(&mut self) {
        for channel in 0..self.config.channels as usize {
            self.buffer[self.write_index][channel] = self.channel_value(channel);
        }
        self.write_index = (self.write_index + 1) % self.config.depth as usize;
    }

    fn check_auto_trigger(&mut self) {
        let watched = self.channel_value(self.trigger.channel as usize);
        let delta = watched - self.trigger.threshold;

        if self.trigger_stale {
            self.last_delta = delta;
            self.trigger_stale = false;
            return;
        }
        if self.trigger.mode == TriggerMode::Disabled {
            self.last_delta = delta;
            return;
        }

        if delta * self.last_delta < 0.0 {
            let rising = delta > 0.0;
            let fires = match self.trigger.mode {
                TriggerMode::Rising => rising,
                TriggerMode::Falling => !rising,
                TriggerMode::Both => true,
                TriggerMode::Disabled => false,
            };
            if fires {
                self.fire_trigger();
            }
        }
        self.last_delta = delta;
    }

    fn tick(&mut self) {
        self.divider_ticks += 1;
        if self.divider_ticks < self.timing.divider {
            return;
        }
        self.divider_ticks = 0;

        self.check_auto_trigger();

        match self.state {
            DeviceState::Stopped => {
                self.write_index = 0;
                if self.requested == DeviceState::Running {
                    self.state = DeviceState::Running;
                    self.snapshot_valid = false;
                }
            }
            DeviceState::Running => {
                if self.requested == DeviceState::Stopped {
                    self.state = DeviceState::Stopped;
                }
                if self.requested == DeviceState::Acquiring {
                    self.latch_snapshot_meta();
                    if self.acq_time == 0 {
                        self.state = DeviceState::Stopped;
                        self.first_element = self.write_index;
                        self.snapshot_valid = true;
                    } else {
                        self.state = DeviceState::Acquiring;
                        self.run_index = 1;
                    }
                }
                self.save_frame();
            }
            DeviceState::Acquiring => {
                if self.run_index == self.acq_time {
                    self.state = DeviceState::Stopped;
                    self.requested = DeviceState::Stopped;
                    self.first_element = self.write_index;
                    self.snapshot_valid = true;
                } else {
                    self.run_index += 1;
                    self.save_frame();
                }
            }
            DeviceState::Misconfigured => {}
        }
    }

    fn feed(&mut self, data: &[u8]) {
        self.wire_log.extend_from_slice(data);
        self.rx.push(data);
        loop {
            match self.rx.try_decode() {
                Ok(Some(frame)) => self.handle_frame(frame.msg_type, &frame.payload),
                Ok(None) => break,
                Err(err) => {
                    // The device drops bad frames silently; the host's
                    // timeout covers recovery.
                    debug!("sim dropped bad frame: {err}");
                }
            }
        }
    }
}

/// A simulated device.
///
/// Keep this handle to advance acquisition time, change variable values, and
/// inject faults while the host side talks to the [`SimLink`] returned by
/// [`link`](SimDevice::link).
pub struct SimDevice {
    core: Arc<Mutex<Core>>,
}

impl SimDevice {
    /// Create a device with the given geometry and registries.
    ///
    /// `vars` and `rt` are `(name, initial value)` pairs. A device with
    /// fewer variables than channels reports itself MISCONFIGURED, like the
    /// real firmware.
    pub fn new(
        config: SimConfig,
        vars: Vec<(String, f32)>,
        rt: Vec<(String, f32)>,
    ) -> Self {
        SimDevice {
            core: Arc::new(Mutex::new(Core::new(config, vars, rt))),
        }
    }

    /// A device with `var_count` variables named `var0..`, `rt_count` RT
    /// registers named `rt0..`, and default geometry.
    pub fn with_counts(config: SimConfig, var_count: u8, rt_count: u8) -> Self {
        let vars = (0..var_count).map(|i| (format!("var{i}"), 0.0)).collect();
        let rt = (0..rt_count).map(|i| (format!("rt{i}"), 0.0)).collect();
        Self::new(config, vars, rt)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Core> {
        // The core never panics while locked, so poisoning cannot happen in
        // practice; recover rather than propagate if it ever does.
        match self.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Get the host-side end of the serial link.
    pub fn link(&self) -> SimLink {
        SimLink {
            core: Arc::clone(&self.core),
        }
    }

    /// Run `n` acquisition ticks.
    pub fn tick(&self, n: u32) {
        let mut core = self.lock();
        for _ in 0..n {
            core.tick();
        }
    }

    /// Current run state.
    pub fn state(&self) -> DeviceState {
        self.lock().state
    }

    /// Set a registered variable's live value.
    pub fn set_var(&self, index: usize, value: f32) {
        let mut core = self.lock();
        if let Some(entry) = core.vars.get_mut(index) {
            entry.1 = value;
        }
    }

    /// Read an RT register directly.
    pub fn rt_value(&self, index: usize) -> Option<f32> {
        self.lock().rt.get(index).map(|(_, v)| *v)
    }

    /// Stop answering requests entirely (simulates an unplugged device).
    pub fn set_muted(&self, muted: bool) {
        self.lock().muted = muted;
    }

    /// Corrupt the CRC of the next response frame.
    pub fn corrupt_next_crc(&self) {
        self.lock().corrupt_next_crc = true;
    }

    /// Delay every response by `delay` (simulates a slow device).
    pub fn set_response_delay(&self, delay: Duration) {
        self.lock().response_delay = delay;
    }

    /// Everything the host has written, byte for byte.
    pub fn wire_log(&self) -> Vec<u8> {
        self.lock().wire_log.clone()
    }

    /// Replace the variable catalog mid-session (simulates a device reset
    /// that re-registers a different set of variables).
    pub fn replace_vars(&self, vars: Vec<(String, f32)>) {
        let mut core = self.lock();
        core.vars = vars;
        let channels = core.config.channels as usize;
        core.state = if core.vars.len() < channels {
            DeviceState::Misconfigured
        } else {
            core.state
        };
    }
}

/// Host-side end of a simulated serial link.
///
/// Reading blocks for at most the configured timeout and then fails with
/// `TimedOut`, matching serial port semantics.
pub struct SimLink {
    core: Arc<Mutex<Core>>,
}

impl SimLink {
    fn lock(&self) -> std::sync::MutexGuard<'_, Core> {
        match self.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Set how long a read waits before failing with `TimedOut`.
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.lock().read_timeout = timeout;
    }

    /// Discard unread device→host bytes.
    pub fn discard_input(&mut self) {
        self.lock().tx.clear();
    }
}

impl Read for SimLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = {
            let mut core = self.lock();
            if !core.tx.is_empty() {
                let n = buf.len().min(core.tx.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = core.tx.pop_front().unwrap_or(0);
                }
                return Ok(n);
            }
            core.read_timeout
        };

        // Nothing pending: behave like a serial port read timeout.
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Err(io::Error::new(io::ErrorKind::TimedOut, "sim read timeout"))
    }
}

impl Write for SimLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let delay = {
            let mut core = self.lock();
            core.feed(buf);
            core.response_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
