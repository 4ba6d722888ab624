//! VScope serial protocol
//!
//! Wire-level types and codecs for the VScope request/response protocol.
//! Every message is one frame (`SYNC · LEN · TYPE · PAYLOAD · CRC`); the
//! link is half-duplex with strictly one outstanding request, and each
//! device declares the byte order of its multi-byte payload fields in its
//! info response.
//!
//! # Example
//!
//! ```rust,ignore
//! use vscope_protocol::{encode_frame, Command, ByteOrder};
//!
//! // Build a request frame
//! let cmd = Command::GetInfo;
//! let wire = encode_frame(cmd.code(), &cmd.encode(ByteOrder::Little))?;
//!
//! // Parse a response
//! let payload = response_payload(cmd.code(), &received)?;
//! let info = decode_info(payload)?;
//! ```

mod commands;
mod constants;
mod error;
mod frame;
mod responses;
mod types;
mod wire;

pub use commands::*;
pub use constants::*;
pub use error::*;
pub use frame::*;
pub use responses::*;
pub use types::*;
pub use wire::*;
