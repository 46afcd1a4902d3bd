use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use super::{AbortSource, Certificate, FileNotAvailablePolicy, Load, Session, SessionState};
use crate::api::Handle;
use crate::cancel::CancelToken;
use crate::protocol::messages::{
    self, InitializationRequest, ManifestEntry, UploadStatus,
    STATUS_UPLOAD_ABORTED_BY_DATALOADER, STATUS_UPLOAD_ABORTED_BY_OPERATOR,
};
use crate::session::events::Callbacks;
use crate::tftp::{Client, LoadServer, ServerEvent, TransferConfig, TransferError};

/// Granularity of the status wait loop during the transfer phase.
const EVENT_SLICE: Duration = Duration::from_millis(200);

/// Immutable snapshot of everything the upload worker needs, taken
/// under the session lock when `upload` is invoked. The session's
/// configuration is frozen for the duration of the operation.
pub(crate) struct UploadPlan {
    pub target_id: String,
    pub target_ip: IpAddr,
    pub target_pos: String,
    pub certificate: Option<Certificate>,
    pub loads: Vec<Load>,
    pub dataloader_port: u16,
    pub target_port: u16,
    pub transfer: TransferConfig,
    pub status_timeout: Duration,
    pub policy: FileNotAvailablePolicy,
}

/// Upload worker entry point, run on a background thread.
pub(crate) fn run(handle: Handle, session: Arc<Session>, plan: UploadPlan, cancel: CancelToken) {
    let callbacks = session.callbacks();

    let outcome = drive(handle, &session, &plan, &cancel, &callbacks);

    match outcome {
        Outcome::Completed => {
            log::info!("upload to {} completed", plan.target_id);
            session.set_state(SessionState::Completed);
        }
        Outcome::Rejected => {
            log::warn!("upload to {} rejected at initialization", plan.target_id);
            session.set_state(SessionState::Failed);
        }
        Outcome::Failed(reason) => {
            log::warn!("upload to {} failed: {}", plan.target_id, reason);
            session.set_state(SessionState::Failed);
            callbacks.fire_upload_information_status(handle, &UploadStatus::failed(reason));
        }
        Outcome::Aborted => {
            let source = session.abort_source().unwrap_or(AbortSource::Dataloader);
            log::info!("upload to {} aborted by {:?}", plan.target_id, source);

            let status = abort_status(source);
            // Best effort: let the target know we are gone.
            if let Ok(body) = serde_json::to_vec(&status) {
                let client = Client::new(
                    plan.target_ip,
                    plan.target_port,
                    TransferConfig {
                        max_retries: 1,
                        ..plan.transfer
                    },
                );
                let name = messages::status_file(&plan.target_id, &plan.target_pos);
                if let Err(e) = client.put_bytes(&name, &body, &CancelToken::new()) {
                    log::debug!("abort notification not delivered: {}", e);
                }
            }

            session.set_state(SessionState::Aborted);
            callbacks.fire_upload_information_status(handle, &status);
        }
    }
}

enum Outcome {
    Completed,
    Rejected,
    Failed(String),
    Aborted,
}

fn abort_status(source: AbortSource) -> UploadStatus {
    match source {
        AbortSource::Operator => UploadStatus::aborted(
            STATUS_UPLOAD_ABORTED_BY_OPERATOR,
            "upload aborted by the operator",
        ),
        AbortSource::Dataloader => UploadStatus::aborted(
            STATUS_UPLOAD_ABORTED_BY_DATALOADER,
            "upload aborted by the dataloader",
        ),
    }
}

fn drive(
    handle: Handle,
    session: &Arc<Session>,
    plan: &UploadPlan,
    cancel: &CancelToken,
    callbacks: &Callbacks,
) -> Outcome {
    // --- Initializing -----------------------------------------------------
    let request = InitializationRequest {
        target_hardware_identifier: plan.target_id.clone(),
        target_hardware_position: plan.target_pos.clone(),
        certificate: plan.certificate.as_ref().map(Certificate::to_hex),
        load_list: plan.loads.iter().map(manifest_entry).collect(),
    };
    let body = match serde_json::to_vec(&request) {
        Ok(body) => body,
        Err(e) => return Outcome::Failed(format!("initialization request encoding: {}", e)),
    };

    let client = Client::new(plan.target_ip, plan.target_port, plan.transfer);
    let init_file = messages::init_request_file(&plan.target_id, &plan.target_pos);
    log::info!(
        "initializing upload to {} at {}:{}",
        plan.target_id,
        plan.target_ip,
        plan.target_port
    );

    if let Err(e) = client.put_bytes(&init_file, &body, cancel) {
        return match e {
            TransferError::Cancelled => Outcome::Aborted,
            TransferError::TimedOut(_) => {
                Outcome::Failed("initialization request timed out".to_string())
            }
            other => Outcome::Failed(format!("initialization request: {}", other)),
        };
    }

    let response_file = messages::init_response_file(&plan.target_id, &plan.target_pos);
    let response_body = match client.get_bytes(&response_file, cancel) {
        Ok(body) => body,
        Err(TransferError::Cancelled) => return Outcome::Aborted,
        Err(TransferError::TimedOut(_)) => {
            return Outcome::Failed("no initialization response from target".to_string());
        }
        Err(other) => return Outcome::Failed(format!("initialization response: {}", other)),
    };

    let response = match serde_json::from_slice(&response_body) {
        Ok(r) => r,
        Err(e) => return Outcome::Failed(format!("malformed initialization response: {}", e)),
    };

    callbacks.fire_upload_initialization_response(handle, &response);

    if !response.is_accepted() {
        return Outcome::Rejected;
    }

    if cancel.is_cancelled() {
        return Outcome::Aborted;
    }

    // --- Transferring -----------------------------------------------------
    session.set_state(SessionState::Transferring);

    let loads: HashMap<String, PathBuf> = plan
        .loads
        .iter()
        .map(|l| (l.load_name.clone(), l.source_path()))
        .collect();

    let (tx, rx) = mpsc::channel();
    let server = match LoadServer::bind(
        plan.dataloader_port,
        loads,
        tx,
        cancel.clone(),
        plan.transfer,
    ) {
        Ok(server) => server,
        Err(e) => return Outcome::Failed(format!("load server bind: {}", e)),
    };
    std::thread::spawn(move || server.run());

    let mut last_activity = Instant::now();
    let outcome = loop {
        if cancel.is_cancelled() {
            break Outcome::Aborted;
        }

        match rx.recv_timeout(EVENT_SLICE) {
            Ok(ServerEvent::Status(status)) => {
                last_activity = Instant::now();
                callbacks.fire_upload_information_status(handle, &status);

                if status.is_completed() {
                    break Outcome::Completed;
                }
                if status.is_terminal() {
                    break Outcome::Failed(format!(
                        "target reported terminal status {:#06x}",
                        status.upload_operation_status_code
                    ));
                }
            }
            Ok(ServerEvent::LoadServed { load_name }) => {
                last_activity = Instant::now();
                log::debug!("target pulled {}", load_name);
            }
            Ok(ServerEvent::FileNotAvailable { file_name }) => {
                last_activity = Instant::now();
                callbacks.fire_file_not_available(handle, &file_name);

                if plan.policy == FileNotAvailablePolicy::Fail {
                    break Outcome::Failed(format!("file not available: {}", file_name));
                }
                log::warn!("{} not available, continuing per session policy", file_name);
            }
            Err(RecvTimeoutError::Timeout) => {
                if last_activity.elapsed() > plan.status_timeout {
                    break Outcome::Failed("target stopped reporting status".to_string());
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                break Outcome::Failed("load server stopped unexpectedly".to_string());
            }
        }
    };

    // Stop the load server; its listen loop polls the same token.
    cancel.cancel();
    outcome
}

fn manifest_entry(load: &Load) -> ManifestEntry {
    let path = load.source_path();
    let size = std::fs::metadata(&path).map(|m| m.len()).ok();
    let sha256 = std::fs::read(&path).ok().map(|bytes| {
        let digest = Sha256::digest(&bytes);
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    });

    ManifestEntry {
        load_name: load.load_name.clone(),
        part_number: load.part_number.clone(),
        size,
        sha256,
    }
}
