//! JSON message bodies exchanged with the target hardware.
//!
//! Field names are camelCase on the wire; the target hardware protocol
//! fixes them, they are not negotiable.

use serde::{Deserialize, Serialize};

/// Discovery request broadcast by the dataloader. Targets answer with a
/// [`DeviceInfo`] datagram sent back to the requesting socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindRequest {
    pub request: String,
}

pub const FIND_REQUEST: &str = "find";

impl FindRequest {
    pub fn new() -> Self {
        Self {
            request: FIND_REQUEST.to_string(),
        }
    }
}

impl Default for FindRequest {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareInfo {
    pub target_hardware_identifier: String,
    #[serde(default)]
    pub target_hardware_position: String,
}

/// One discovered target hardware unit. Emitted once per distinct unit
/// during a find operation and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(default)]
    pub mac: String,
    pub ip: String,
    pub hardware: HardwareInfo,
}

/// One load in the upload initialization manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub load_name: String,
    pub part_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Body of the `<thwId>_<pos>.LUI` file written to the target hardware
/// to start an upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializationRequest {
    pub target_hardware_identifier: String,
    pub target_hardware_position: String,
    /// Hex-encoded certificate bytes; absent in the no-security variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    pub load_list: Vec<ManifestEntry>,
}

pub const INITIALIZATION_UPLOAD_IS_ACCEPTED: u16 = 0x0001;
pub const INITIALIZATION_UPLOAD_IS_DENIED: u16 = 0x1000;
pub const INITIALIZATION_UPLOAD_NOT_SUPPORTED: u16 = 0x1002;

/// Body of the `<thwId>_<pos>.LUR` file read back from the target
/// hardware after initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializationResponse {
    pub operation_acceptance_status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_description: Option<String>,
}

impl InitializationResponse {
    pub fn is_accepted(&self) -> bool {
        self.operation_acceptance_status_code == INITIALIZATION_UPLOAD_IS_ACCEPTED
    }
}

pub const STATUS_UPLOAD_ACCEPTED: u16 = 0x0001;
pub const STATUS_UPLOAD_IN_PROGRESS: u16 = 0x0002;
pub const STATUS_UPLOAD_COMPLETED: u16 = 0x0003;
pub const STATUS_UPLOAD_IN_PROGRESS_WITH_DESCRIPTION: u16 = 0x0004;
pub const STATUS_UPLOAD_ABORTED_BY_TARGET: u16 = 0x1003;
pub const STATUS_UPLOAD_ABORTED_BY_OPERATOR: u16 = 0x1004;
pub const STATUS_UPLOAD_ABORTED_BY_DATALOADER: u16 = 0x1005;
pub const STATUS_UPLOAD_FAILED: u16 = 0x1007;

/// Upload progress report. Written periodically by the target hardware
/// as `<thwId>_<pos>.LUS`; also synthesized locally for dataloader-side
/// failures and aborts so that every terminal transition is observable
/// through the status callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub upload_operation_status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_status_description: Option<String>,
    #[serde(default)]
    pub percent_completed: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_load: Option<String>,
}

impl UploadStatus {
    pub fn failed(description: impl Into<String>) -> Self {
        Self {
            upload_operation_status_code: STATUS_UPLOAD_FAILED,
            upload_status_description: Some(description.into()),
            percent_completed: 0.0,
            current_load: None,
        }
    }

    pub fn aborted(code: u16, description: impl Into<String>) -> Self {
        Self {
            upload_operation_status_code: code,
            upload_status_description: Some(description.into()),
            percent_completed: 0.0,
            current_load: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.upload_operation_status_code,
            STATUS_UPLOAD_COMPLETED
                | STATUS_UPLOAD_ABORTED_BY_TARGET
                | STATUS_UPLOAD_ABORTED_BY_OPERATOR
                | STATUS_UPLOAD_ABORTED_BY_DATALOADER
                | STATUS_UPLOAD_FAILED
        )
    }

    pub fn is_completed(&self) -> bool {
        self.upload_operation_status_code == STATUS_UPLOAD_COMPLETED
    }
}

/// Initialization file name for a target unit, e.g. `HNPFMS_L.LUI`.
pub fn init_request_file(thw_id: &str, position: &str) -> String {
    format!("{}_{}.LUI", thw_id, position)
}

/// Initialization response file name, e.g. `HNPFMS_L.LUR`.
pub fn init_response_file(thw_id: &str, position: &str) -> String {
    format!("{}_{}.LUR", thw_id, position)
}

/// Upload status file name, e.g. `HNPFMS_L.LUS`.
pub fn status_file(thw_id: &str, position: &str) -> String {
    format!("{}_{}.LUS", thw_id, position)
}
