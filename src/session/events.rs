use std::sync::Arc;

use crate::api::Handle;
use crate::protocol::messages::{DeviceInfo, InitializationResponse, UploadStatus};

pub type FindStartedFn = dyn Fn(Handle) + Send + Sync;
pub type FindNewDeviceFn = dyn Fn(Handle, &DeviceInfo) + Send + Sync;
pub type FindFinishedFn = dyn Fn(Handle) + Send + Sync;
pub type UploadInitializationResponseFn = dyn Fn(Handle, &InitializationResponse) + Send + Sync;
pub type UploadInformationStatusFn = dyn Fn(Handle, &UploadStatus) + Send + Sync;
pub type FileNotAvailableFn = dyn Fn(Handle, &str) + Send + Sync;

/// The callbacks registered on one handle.
///
/// Workers take a clone at operation start and invoke the callbacks
/// without holding any session lock, so a callback may re-enter the
/// API (for example call `abort_upload`) without deadlocking.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub find_started: Option<Arc<FindStartedFn>>,
    pub find_new_device: Option<Arc<FindNewDeviceFn>>,
    pub find_finished: Option<Arc<FindFinishedFn>>,
    pub upload_initialization_response: Option<Arc<UploadInitializationResponseFn>>,
    pub upload_information_status: Option<Arc<UploadInformationStatusFn>>,
    pub file_not_available: Option<Arc<FileNotAvailableFn>>,
}

impl Callbacks {
    pub fn fire_find_started(&self, handle: Handle) {
        if let Some(cb) = &self.find_started {
            cb(handle);
        }
    }

    pub fn fire_find_new_device(&self, handle: Handle, device: &DeviceInfo) {
        if let Some(cb) = &self.find_new_device {
            cb(handle, device);
        }
    }

    pub fn fire_find_finished(&self, handle: Handle) {
        if let Some(cb) = &self.find_finished {
            cb(handle);
        }
    }

    pub fn fire_upload_initialization_response(
        &self,
        handle: Handle,
        response: &InitializationResponse,
    ) {
        if let Some(cb) = &self.upload_initialization_response {
            cb(handle, response);
        }
    }

    pub fn fire_upload_information_status(&self, handle: Handle, status: &UploadStatus) {
        if let Some(cb) = &self.upload_information_status {
            cb(handle, status);
        }
    }

    pub fn fire_file_not_available(&self, handle: Handle, file_name: &str) {
        if let Some(cb) = &self.file_not_available {
            cb(handle, file_name);
        }
    }
}
