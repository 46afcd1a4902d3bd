//! Public operation surface of the dataloader.
//!
//! A [`DataLoader`] owns the handler registry. Callers create opaque
//! handles, configure them while idle, register callbacks, and then
//! invoke `find`/`upload`, which return immediately; all progress and
//! failure reporting arrives through the callbacks from a background
//! thread.

mod registry;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::find::{self, FindPlan};
use crate::protocol::messages::{DeviceInfo, InitializationResponse, UploadStatus};
use crate::session::upload::{self, UploadPlan};
use crate::session::{
    AbortSource, Certificate, FileNotAvailablePolicy, Load, Session, SessionInner, SessionState,
};
use crate::tftp::TransferConfig;

pub use registry::Handle;

pub struct DataLoader {
    registry: registry::Registry,
}

impl Default for DataLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DataLoader {
    pub fn new() -> Self {
        Self {
            registry: registry::Registry::new(),
        }
    }

    // ------------------------------------------------------------------
    // Management operations
    // ------------------------------------------------------------------

    /// Create a new handler with default configuration and no
    /// registered callbacks.
    pub fn create_handler(&self) -> Result<Handle> {
        let (handle, _) = self.registry.insert()?;
        log::debug!("created handler {}", handle);
        Ok(handle)
    }

    /// Destroy a handler. Any in-flight find or upload is cancelled
    /// first (as an operator abort) and its worker joined, so no
    /// callback fires for this handle after this returns.
    pub fn destroy_handler(&self, handle: Handle) -> Result<()> {
        let session = self.registry.remove(handle)?;

        let worker = {
            let mut inner = session.inner.lock().unwrap();
            if inner.state.can_abort() && inner.abort_source.is_none() {
                inner.abort_source = Some(AbortSource::Operator);
            }
            inner.cancel.cancel();
            inner.worker.take()
        };

        if let Some(worker) = worker {
            // A callback may legitimately destroy its own handle; the
            // worker cannot join itself.
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }

        log::debug!("destroyed handler {}", handle);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Configuration (valid only while no operation is in flight)
    // ------------------------------------------------------------------

    pub fn set_target_hardware_id(&self, handle: Handle, id: &str) -> Result<()> {
        self.configure(handle, |inner| {
            inner.target.id = Some(id.to_string());
            Ok(())
        })
    }

    pub fn set_target_hardware_ip(&self, handle: Handle, ip: IpAddr) -> Result<()> {
        self.configure(handle, |inner| {
            inner.target.ip = Some(ip);
            Ok(())
        })
    }

    pub fn set_target_hardware_pos(&self, handle: Handle, position: &str) -> Result<()> {
        self.configure(handle, |inner| {
            inner.target.position = Some(position.to_string());
            Ok(())
        })
    }

    /// Set the ordered list of loads for the next upload.
    pub fn set_load_list(&self, handle: Handle, loads: Vec<Load>) -> Result<()> {
        self.configure(handle, |inner| {
            inner.loads = loads;
            Ok(())
        })
    }

    pub fn set_certificate(&self, handle: Handle, certificate: Certificate) -> Result<()> {
        self.configure(handle, |inner| {
            inner.certificate = Some(certificate);
            Ok(())
        })
    }

    /// Port of the dataloader's own TFTP server, which the target
    /// hardware pulls load files from. Pass 0 to let the OS pick.
    pub fn set_tftp_dataloader_server_port(&self, handle: Handle, port: u16) -> Result<()> {
        self.configure(handle, |inner| {
            inner.dataloader_port = port;
            Ok(())
        })
    }

    /// Port of the target hardware's TFTP server, which receives the
    /// initialization request.
    pub fn set_tftp_targethardware_server_port(&self, handle: Handle, port: u16) -> Result<()> {
        self.configure(handle, |inner| {
            inner.target_port = port;
            Ok(())
        })
    }

    pub fn set_discovery_port(&self, handle: Handle, port: u16) -> Result<()> {
        self.configure(handle, |inner| {
            inner.discovery_port = port;
            Ok(())
        })
    }

    pub fn set_find_timeout(&self, handle: Handle, timeout: Duration) -> Result<()> {
        self.configure(handle, |inner| {
            inner.find_timeout = timeout;
            Ok(())
        })
    }

    /// Silence tolerated from the target during the transfer phase
    /// before the upload is declared failed.
    pub fn set_status_timeout(&self, handle: Handle, timeout: Duration) -> Result<()> {
        self.configure(handle, |inner| {
            inner.status_timeout = timeout;
            Ok(())
        })
    }

    /// TFTP block timeout and retransmission budget.
    pub fn set_transfer_config(&self, handle: Handle, cfg: TransferConfig) -> Result<()> {
        self.configure(handle, |inner| {
            inner.transfer = cfg;
            Ok(())
        })
    }

    pub fn set_file_not_available_policy(
        &self,
        handle: Handle,
        policy: FileNotAvailablePolicy,
    ) -> Result<()> {
        self.configure(handle, |inner| {
            inner.policy = policy;
            Ok(())
        })
    }

    fn configure<F>(&self, handle: Handle, apply: F) -> Result<()>
    where
        F: FnOnce(&mut SessionInner) -> Result<()>,
    {
        let session = self.registry.get(handle)?;
        let mut inner = session.inner.lock().unwrap();
        if inner.state.is_running() {
            return Err(Error::InvalidState("configuration is frozen mid-operation"));
        }
        apply(&mut inner)
    }

    // ------------------------------------------------------------------
    // Callback registration
    // ------------------------------------------------------------------

    pub fn register_find_started_callback<F>(&self, handle: Handle, callback: F) -> Result<()>
    where
        F: Fn(Handle) + Send + Sync + 'static,
    {
        let session = self.registry.get(handle)?;
        session.callbacks.lock().unwrap().find_started = Some(std::sync::Arc::new(callback));
        Ok(())
    }

    pub fn register_find_new_device_callback<F>(&self, handle: Handle, callback: F) -> Result<()>
    where
        F: Fn(Handle, &DeviceInfo) + Send + Sync + 'static,
    {
        let session = self.registry.get(handle)?;
        session.callbacks.lock().unwrap().find_new_device = Some(std::sync::Arc::new(callback));
        Ok(())
    }

    pub fn register_find_finished_callback<F>(&self, handle: Handle, callback: F) -> Result<()>
    where
        F: Fn(Handle) + Send + Sync + 'static,
    {
        let session = self.registry.get(handle)?;
        session.callbacks.lock().unwrap().find_finished = Some(std::sync::Arc::new(callback));
        Ok(())
    }

    pub fn register_upload_initialization_response_callback<F>(
        &self,
        handle: Handle,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(Handle, &InitializationResponse) + Send + Sync + 'static,
    {
        let session = self.registry.get(handle)?;
        session
            .callbacks
            .lock()
            .unwrap()
            .upload_initialization_response = Some(std::sync::Arc::new(callback));
        Ok(())
    }

    pub fn register_upload_information_status_callback<F>(
        &self,
        handle: Handle,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(Handle, &UploadStatus) + Send + Sync + 'static,
    {
        let session = self.registry.get(handle)?;
        session.callbacks.lock().unwrap().upload_information_status =
            Some(std::sync::Arc::new(callback));
        Ok(())
    }

    pub fn register_file_not_available_callback<F>(&self, handle: Handle, callback: F) -> Result<()>
    where
        F: Fn(Handle, &str) + Send + Sync + 'static,
    {
        let session = self.registry.get(handle)?;
        session.callbacks.lock().unwrap().file_not_available = Some(std::sync::Arc::new(callback));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Start a discovery operation. Returns immediately; devices are
    /// reported through the find callbacks. A handle runs at most one
    /// operation at a time: calling `find` while one is already in
    /// flight is rejected with `InvalidState`.
    pub fn find(&self, handle: Handle) -> Result<()> {
        let session = self.registry.get(handle)?;
        self.reap_worker(&session)?;

        let mut inner = session.inner.lock().unwrap();
        if inner.state.is_running() {
            return Err(Error::InvalidState("operation already in flight"));
        }

        let plan = FindPlan {
            discovery_port: inner.discovery_port,
            timeout: inner.find_timeout,
            target_ip: inner.target.ip,
        };
        let cancel = crate::cancel::CancelToken::new();
        inner.cancel = cancel.clone();
        inner.abort_source = None;
        inner.state = SessionState::Discovering;

        let worker_session = Arc::clone(&session);
        inner.worker = Some(std::thread::spawn(move || {
            find::run(handle, worker_session, plan, cancel);
        }));

        Ok(())
    }

    /// Start an upload. Returns immediately; the initialization
    /// response, progress and terminal outcome are reported through
    /// the upload callbacks. Requires a complete target descriptor and
    /// a non-empty load list.
    pub fn upload(&self, handle: Handle) -> Result<()> {
        let session = self.registry.get(handle)?;
        self.reap_worker(&session)?;

        let mut inner = session.inner.lock().unwrap();
        if inner.state.is_running() {
            return Err(Error::InvalidState("operation already in flight"));
        }

        let (target_id, target_ip, target_pos) = inner.target.resolve()?;
        if inner.loads.is_empty() {
            return Err(Error::ConfigurationIncomplete("load list is empty"));
        }

        let plan = UploadPlan {
            target_id,
            target_ip,
            target_pos,
            certificate: inner.certificate.clone(),
            loads: inner.loads.clone(),
            dataloader_port: inner.dataloader_port,
            target_port: inner.target_port,
            transfer: inner.transfer,
            status_timeout: inner.status_timeout,
            policy: inner.policy,
        };
        let cancel = crate::cancel::CancelToken::new();
        inner.cancel = cancel.clone();
        inner.abort_source = None;
        inner.state = SessionState::Initializing;

        let worker_session = Arc::clone(&session);
        inner.worker = Some(std::thread::spawn(move || {
            upload::run(handle, worker_session, plan, cancel);
        }));

        Ok(())
    }

    /// Abort an in-flight upload. The abort source is preserved and
    /// reported in the terminal status callback. Aborting a session
    /// with no upload in flight is an error, not a crash.
    pub fn abort_upload(&self, handle: Handle, source: AbortSource) -> Result<()> {
        let session = self.registry.get(handle)?;
        let mut inner = session.inner.lock().unwrap();
        if !inner.state.can_abort() {
            return Err(Error::InvalidState("no upload in flight to abort"));
        }

        log::info!("abort requested on {} by {:?}", handle, source);
        inner.abort_source = Some(source);
        inner.state = SessionState::Aborting;
        inner.cancel.cancel();
        Ok(())
    }

    /// Current state of a session; mostly useful for tests and
    /// front-ends that poll.
    pub fn session_state(&self, handle: Handle) -> Result<SessionState> {
        Ok(self.registry.get(handle)?.state())
    }

    /// Join the previous operation's worker before a new one starts,
    /// so its tail callbacks cannot interleave with the next
    /// operation's. The worker is already past its terminal state
    /// transition, so the join is bounded. When invoked from that
    /// worker's own callback the join is skipped; the thread has
    /// nothing left to run but its return path.
    fn reap_worker(&self, session: &Arc<Session>) -> Result<()> {
        let worker = {
            let mut inner = session.inner.lock().unwrap();
            if inner.state.is_running() {
                return Err(Error::InvalidState("operation already in flight"));
            }
            inner.worker.take()
        };

        if let Some(worker) = worker {
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
        Ok(())
    }
}
