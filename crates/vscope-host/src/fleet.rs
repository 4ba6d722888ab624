//! Connected-device fleet.
//!
//! The single application-state object: owns the transport and every active
//! session, and derives the consensus view on demand. Components receive a
//! reference to this object (or clones of its event receiver) instead of
//! reaching for globals; observers subscribe to session events through an
//! explicit channel.

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::consensus::{compute_consensus, ConsensusView};
use crate::session::{DeviceSession, SessionEvent, SessionState};
use crate::settings::Settings;
use crate::transport::{SerialConfig, SerialLink, Transport, TransportError};

/// All simultaneously connected devices plus the derived consensus.
pub struct Fleet {
    transport: Arc<Transport>,
    settings: Settings,
    sessions: Vec<DeviceSession>,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
}

impl Fleet {
    /// Create an empty fleet.
    pub fn new(settings: Settings) -> Self {
        let (events_tx, events_rx) = unbounded();
        Fleet {
            transport: Arc::new(Transport::new()),
            settings,
            sessions: Vec::new(),
            events_tx,
            events_rx,
        }
    }

    /// The shared transport session.
    pub fn transport(&self) -> Arc<Transport> {
        Arc::clone(&self.transport)
    }

    /// Open a serial port and add a session for it.
    pub fn connect_path(
        &mut self,
        path: &str,
        serial: &SerialConfig,
    ) -> Result<(), TransportError> {
        let session = DeviceSession::connect_path(
            Arc::clone(&self.transport),
            path,
            serial,
            self.settings,
            self.events_tx.clone(),
        )?;
        self.sessions.push(session);
        Ok(())
    }

    /// Add a session over an already-constructed link (e.g. a simulated
    /// device).
    pub fn connect_link(
        &mut self,
        link: Box<dyn SerialLink>,
        label: &str,
    ) -> Result<(), TransportError> {
        let session = DeviceSession::connect_link(
            Arc::clone(&self.transport),
            link,
            label,
            self.settings,
            self.events_tx.clone(),
        )?;
        self.sessions.push(session);
        Ok(())
    }

    /// Active sessions.
    pub fn sessions(&self) -> &[DeviceSession] {
        &self.sessions
    }

    /// The session for a path, if any.
    pub fn session(&self, path: &str) -> Option<&DeviceSession> {
        self.sessions.iter().find(|session| session.path() == path)
    }

    /// Stop and remove the session for a path.
    pub fn disconnect(&mut self, path: &str) {
        if let Some(position) = self.sessions.iter().position(|s| s.path() == path) {
            self.sessions.remove(position).stop();
        }
    }

    /// Subscribe to session events. Every `Updated`/`Fault` event is a cue
    /// to recompute the consensus view.
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events_rx.clone()
    }

    /// Snapshots of every session's current state.
    pub fn session_states(&self) -> Vec<SessionState> {
        self.sessions.iter().map(DeviceSession::state).collect()
    }

    /// Recompute the consensus view from the current session states.
    pub fn consensus(&self) -> ConsensusView {
        compute_consensus(
            &self.session_states(),
            Instant::now(),
            self.settings.staleness_bound(),
        )
    }

    /// Stop every session.
    pub fn shutdown(&mut self) {
        for session in self.sessions.drain(..) {
            session.stop();
        }
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        self.shutdown();
    }
}
