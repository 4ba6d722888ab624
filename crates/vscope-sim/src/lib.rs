//! VScope device simulation
//!
//! A byte-level model of a VScope data-acquisition device: the request
//! handlers, run-state machine, trigger logic, and capture ring buffer,
//! driven entirely through the serial wire format. The simulated link
//! implements `io::Read`/`io::Write`, so the host transport talks to it
//! exactly as it would to a serial port.
//!
//! Acquisition time does not advance on its own; call [`SimDevice::tick`]
//! to run acquisition ticks the way the device's sampling interrupt would.

mod device;

pub use device::*;
