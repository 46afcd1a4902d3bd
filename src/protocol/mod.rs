//! Wire-level primitives shared by the discovery engine and the
//! transfer engine:
//! - `packet`: TFTP (RFC 1350) packet serialization/deserialization
//! - `messages`: JSON bodies exchanged with the target hardware
//!   (discovery announce, upload initialization, upload status)

mod packet;
pub mod messages;

pub use packet::{ErrorCode, MODE_OCTET, Packet};
