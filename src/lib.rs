//! ARINC-615A-style data loader core: discover target hardware on the
//! local network, then upload software loads to it over TFTP.
//!
//! All operations run through an opaque [`Handle`] obtained from a
//! [`DataLoader`]. `find` and `upload` return immediately and report
//! progress and outcomes exclusively through registered callbacks, so
//! a front-end never blocks on the network.

pub mod api;
pub mod cancel;
pub mod config;
pub mod error;
pub mod find;
pub mod protocol;
pub mod session;
pub mod tftp;

pub use api::{DataLoader, Handle};
pub use error::{Error, Result};
pub use protocol::messages::{DeviceInfo, InitializationResponse, UploadStatus};
pub use session::{
    AbortSource, Certificate, FileNotAvailablePolicy, Load, SessionState, TargetDescriptor,
};
pub use tftp::TransferConfig;
