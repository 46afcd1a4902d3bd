//! Per-handle session: configuration, state machine, callbacks and the
//! upload worker.

pub mod events;
mod state;
pub(crate) mod upload;

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::Error;
use crate::tftp::TransferConfig;
use events::Callbacks;

pub use state::SessionState;

/// Default target hardware TFTP server port per ARINC-615A. Running a
/// target simulator and the dataloader on one machine requires moving
/// one of the two off this port.
pub const DEFAULT_TARGET_TFTP_PORT: u16 = 59;

/// Default port for the dataloader's own TFTP server, deliberately off
/// the well-known port so both ends can share a host.
pub const DEFAULT_DATALOADER_TFTP_PORT: u16 = 5959;

pub const DEFAULT_FIND_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the transfer phase tolerates silence from the target (no
/// status write, no load pull) before declaring the upload failed.
pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(15);

/// Who requested an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortSource {
    /// The dataloader itself, e.g. handle teardown.
    Dataloader,
    /// The human operator driving the dataloader.
    Operator,
}

/// What to do when the target hardware requests a file the session
/// cannot provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileNotAvailablePolicy {
    /// Report it and keep the session going; the target decides
    /// whether a partial load is acceptable.
    Skip,
    /// Report it and fail the whole upload.
    #[default]
    Fail,
}

/// Addressing of the physical unit a session talks to. All three
/// fields must be set before `upload`.
#[derive(Debug, Clone, Default)]
pub struct TargetDescriptor {
    pub id: Option<String>,
    pub ip: Option<IpAddr>,
    pub position: Option<String>,
}

impl TargetDescriptor {
    pub(crate) fn resolve(&self) -> Result<(String, IpAddr, String), Error> {
        let id = self
            .id
            .clone()
            .ok_or(Error::ConfigurationIncomplete("target hardware id not set"))?;
        let ip = self
            .ip
            .ok_or(Error::ConfigurationIncomplete("target hardware ip not set"))?;
        let position = self.position.clone().ok_or(Error::ConfigurationIncomplete(
            "target hardware position not set",
        ))?;
        Ok((id, ip, position))
    }
}

/// Security credential presented during upload initialization. Opaque
/// to the dataloader; the target hardware accepts or rejects it.
#[derive(Debug, Clone)]
pub struct Certificate {
    data: Vec<u8>,
    path: Option<PathBuf>,
}

impl Certificate {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, path: None }
    }

    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        Ok(Self {
            data: std::fs::read(path)?,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Hex encoding used in the initialization request body.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(self.data.len() * 2);
        for byte in &self.data {
            out.push_str(&format!("{:02X}", byte));
        }
        out
    }
}

/// One file to be installed on the target hardware. `load_name` is
/// both the wire identifier the target pulls by and the local source
/// path, resolved against the current directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Load {
    pub load_name: String,
    pub part_number: String,
}

impl Load {
    pub fn new(load_name: impl Into<String>, part_number: impl Into<String>) -> Self {
        Self {
            load_name: load_name.into(),
            part_number: part_number.into(),
        }
    }

    pub(crate) fn source_path(&self) -> PathBuf {
        PathBuf::from(&self.load_name)
    }
}

/// Mutable session configuration and state, guarded by the session
/// mutex. Never locked across a callback invocation.
pub(crate) struct SessionInner {
    pub target: TargetDescriptor,
    pub certificate: Option<Certificate>,
    pub loads: Vec<Load>,
    pub dataloader_port: u16,
    pub target_port: u16,
    pub discovery_port: u16,
    pub find_timeout: Duration,
    pub status_timeout: Duration,
    pub transfer: TransferConfig,
    pub policy: FileNotAvailablePolicy,
    pub state: SessionState,
    /// Cancel token of the in-flight operation; replaced at each
    /// `find`/`upload`.
    pub cancel: CancelToken,
    pub abort_source: Option<AbortSource>,
    pub worker: Option<JoinHandle<()>>,
}

impl Default for SessionInner {
    fn default() -> Self {
        Self {
            target: TargetDescriptor::default(),
            certificate: None,
            loads: Vec::new(),
            dataloader_port: DEFAULT_DATALOADER_TFTP_PORT,
            target_port: DEFAULT_TARGET_TFTP_PORT,
            discovery_port: crate::find::DEFAULT_DISCOVERY_PORT,
            find_timeout: DEFAULT_FIND_TIMEOUT,
            status_timeout: DEFAULT_STATUS_TIMEOUT,
            transfer: TransferConfig::default(),
            policy: FileNotAvailablePolicy::default(),
            state: SessionState::Idle,
            cancel: CancelToken::new(),
            abort_source: None,
            worker: None,
        }
    }
}

pub(crate) struct Session {
    pub inner: Mutex<SessionInner>,
    pub callbacks: Mutex<Callbacks>,
}

impl Session {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SessionInner::default()),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    /// Snapshot of the registered callbacks, taken at operation start.
    pub fn callbacks(&self) -> Callbacks {
        self.callbacks.lock().unwrap().clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    pub fn set_state(&self, state: SessionState) {
        self.inner.lock().unwrap().state = state;
    }

    pub fn abort_source(&self) -> Option<AbortSource> {
        self.inner.lock().unwrap().abort_source
    }
}
