//! VScope host library
//!
//! Host-side control stack for VScope data-acquisition devices over a
//! half-duplex serial link:
//!
//! - [`transport`]: connection registry and the bounded request/response
//!   primitive; the sole gate to the physical line.
//! - [`client`]: one typed method per protocol operation, with CRC retry.
//! - [`session`]: per-device state, dual-cadence polling, catalog paging,
//!   and disconnect inference.
//! - [`consensus`]: the pure reconciliation of several connected devices
//!   into one agreed/mismatched view with completeness gates.
//! - [`fleet`]: the application-state object tying the above together.
//!
//! Rendering, settings persistence, and snapshot storage are collaborators
//! behind interfaces ([`settings::Settings`], [`snapshot::SnapshotStore`]),
//! not part of this crate.

pub mod catalog;
pub mod client;
pub mod consensus;
pub mod fleet;
pub mod session;
pub mod settings;
pub mod snapshot;
pub mod transport;

pub use catalog::{Catalog, CatalogFetch, PageOutcome};
pub use client::{DeviceClient, RequestError};
pub use consensus::{compute_consensus, Completeness, ConsensusView, FieldConsensus};
pub use fleet::Fleet;
pub use session::{
    ConnectionState, DeviceSession, SessionEvent, SessionState, Stamped,
    DISCONNECT_AFTER_TIMEOUTS,
};
pub use settings::Settings;
pub use snapshot::{fetch_snapshot, MemoryStore, Snapshot, SnapshotStore};
pub use transport::{DeviceHandle, PortInfo, SerialConfig, SerialLink, Transport, TransportError};
