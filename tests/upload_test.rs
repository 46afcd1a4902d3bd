mod common;

use std::net::IpAddr;
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serial_test::serial;

use dataload::protocol::messages::{
    INITIALIZATION_UPLOAD_IS_DENIED, STATUS_UPLOAD_ABORTED_BY_OPERATOR, STATUS_UPLOAD_COMPLETED,
    STATUS_UPLOAD_FAILED,
};
use dataload::{
    AbortSource, DataLoader, Error, FileNotAvailablePolicy, Handle, Load, SessionState,
};

use common::{init_logger, Behavior, FakeTarget};

const LOCALHOST: &str = "127.0.0.1";

fn write_load(dir: &Path, name: &str, len: usize) -> (Load, Vec<u8>) {
    let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let path = dir.join(name);
    std::fs::write(&path, &content).unwrap();
    (
        Load::new(path.to_str().unwrap(), format!("PN-{}", name)),
        content,
    )
}

fn configure_target(
    loader: &DataLoader,
    handle: Handle,
    target: &FakeTarget,
    dataloader_port: u16,
) {
    loader.set_target_hardware_id(handle, "FMC-4200").unwrap();
    loader
        .set_target_hardware_ip(handle, LOCALHOST.parse::<IpAddr>().unwrap())
        .unwrap();
    loader.set_target_hardware_pos(handle, "L").unwrap();
    loader
        .set_tftp_targethardware_server_port(handle, target.tftp_port)
        .unwrap();
    loader
        .set_tftp_dataloader_server_port(handle, dataloader_port)
        .unwrap();
}

/// Register a status callback that records everything and forwards the
/// terminal status through a channel.
fn watch_statuses(
    loader: &DataLoader,
    handle: Handle,
) -> (Arc<Mutex<Vec<u16>>>, mpsc::Receiver<u16>) {
    let codes = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let log = Arc::clone(&codes);
    loader
        .register_upload_information_status_callback(handle, move |_, status| {
            log.lock().unwrap().push(status.upload_operation_status_code);
            if status.is_terminal() {
                let _ = tx
                    .lock()
                    .unwrap()
                    .send(status.upload_operation_status_code);
            }
        })
        .unwrap();
    (codes, rx)
}

fn wait_for_state(loader: &DataLoader, handle: Handle, wanted: SessionState) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let state = loader.session_state(handle).unwrap();
        if state == wanted {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "state stuck at {:?}, wanted {:?}",
            state,
            wanted
        );
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
#[serial]
fn test_upload_completes_and_target_receives_loads() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (boot, boot_content) = write_load(dir.path(), "boot.bin", 2000);
    let (conf, conf_content) = write_load(dir.path(), "conf.bin", 300);

    let dataloader_port = 45959;
    let target = FakeTarget::spawn("FMC-4200", "L", Behavior::AcceptAndComplete, dataloader_port);

    let loader = DataLoader::new();
    let handle = loader.create_handler().unwrap();
    configure_target(&loader, handle, &target, dataloader_port);
    loader
        .set_load_list(handle, vec![boot.clone(), conf.clone()])
        .unwrap();

    let accepted = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&accepted);
    loader
        .register_upload_initialization_response_callback(handle, move |_, response| {
            *seen.lock().unwrap() = Some(response.is_accepted());
        })
        .unwrap();

    let (codes, terminal) = watch_statuses(&loader, handle);

    loader.upload(handle).unwrap();
    let outcome = terminal.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(outcome, STATUS_UPLOAD_COMPLETED);

    wait_for_state(&loader, handle, SessionState::Completed);
    assert_eq!(*accepted.lock().unwrap(), Some(true));

    // The target pulled exactly the bytes we put in the load list.
    let pulled = target.pulled.lock().unwrap();
    assert_eq!(pulled.get(&boot.load_name), Some(&boot_content));
    assert_eq!(pulled.get(&conf.load_name), Some(&conf_content));
    drop(pulled);

    // At least one progress report arrived before completion.
    let codes = codes.lock().unwrap();
    assert!(codes.len() >= 2, "statuses: {:?}", codes);
    assert_eq!(codes.last(), Some(&STATUS_UPLOAD_COMPLETED));

    loader.destroy_handler(handle).unwrap();
}

#[test]
#[serial]
fn test_upload_denied_by_target() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (boot, _) = write_load(dir.path(), "boot.bin", 100);

    let dataloader_port = 45960;
    let target = FakeTarget::spawn(
        "FMC-4200",
        "L",
        Behavior::Deny(INITIALIZATION_UPLOAD_IS_DENIED),
        dataloader_port,
    );

    let loader = DataLoader::new();
    let handle = loader.create_handler().unwrap();
    configure_target(&loader, handle, &target, dataloader_port);
    loader.set_load_list(handle, vec![boot]).unwrap();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    loader
        .register_upload_initialization_response_callback(handle, move |_, response| {
            let _ = tx
                .lock()
                .unwrap()
                .send(response.operation_acceptance_status_code);
        })
        .unwrap();

    let (codes, _terminal) = watch_statuses(&loader, handle);

    loader.upload(handle).unwrap();
    let code = rx.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(code, INITIALIZATION_UPLOAD_IS_DENIED);

    wait_for_state(&loader, handle, SessionState::Failed);

    // The transfer phase never ran, so no status report arrived.
    assert!(codes.lock().unwrap().is_empty());

    loader.destroy_handler(handle).unwrap();
}

#[test]
#[serial]
fn test_operator_abort_during_transfer() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (boot, _) = write_load(dir.path(), "boot.bin", 5000);

    let dataloader_port = 45961;
    let target = FakeTarget::spawn("FMC-4200", "L", Behavior::AcceptThenStall, dataloader_port);

    let loader = DataLoader::new();
    let handle = loader.create_handler().unwrap();
    configure_target(&loader, handle, &target, dataloader_port);
    loader.set_load_list(handle, vec![boot]).unwrap();

    let (_codes, terminal) = watch_statuses(&loader, handle);

    // Signal once the transfer phase is reached.
    let (progress_tx, progress_rx) = mpsc::channel();
    let progress_tx = Mutex::new(progress_tx);
    loader
        .register_upload_initialization_response_callback(handle, move |_, _| {
            let _ = progress_tx.lock().unwrap().send(());
        })
        .unwrap();

    loader.upload(handle).unwrap();
    progress_rx.recv_timeout(Duration::from_secs(30)).unwrap();
    wait_for_state(&loader, handle, SessionState::Transferring);

    loader.abort_upload(handle, AbortSource::Operator).unwrap();

    let outcome = terminal.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(outcome, STATUS_UPLOAD_ABORTED_BY_OPERATOR);
    wait_for_state(&loader, handle, SessionState::Aborted);

    // A second abort has nothing to act on.
    assert!(matches!(
        loader.abort_upload(handle, AbortSource::Operator),
        Err(Error::InvalidState(_))
    ));

    loader.destroy_handler(handle).unwrap();
}

#[test]
#[serial]
fn test_missing_load_fails_upload_by_default() {
    init_logger();

    let dataloader_port = 45962;
    let target = FakeTarget::spawn("FMC-4200", "L", Behavior::AcceptAndComplete, dataloader_port);

    let loader = DataLoader::new();
    let handle = loader.create_handler().unwrap();
    configure_target(&loader, handle, &target, dataloader_port);
    loader
        .set_load_list(handle, vec![Load::new("/nonexistent/ghost.bin", "PN-GHOST")])
        .unwrap();

    let missing = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&missing);
    loader
        .register_file_not_available_callback(handle, move |_, file_name| {
            seen.lock().unwrap().push(file_name.to_string());
        })
        .unwrap();

    let (_codes, terminal) = watch_statuses(&loader, handle);

    loader.upload(handle).unwrap();
    let outcome = terminal.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(outcome, STATUS_UPLOAD_FAILED);

    wait_for_state(&loader, handle, SessionState::Failed);
    assert_eq!(
        missing.lock().unwrap().as_slice(),
        &["/nonexistent/ghost.bin".to_string()]
    );

    loader.destroy_handler(handle).unwrap();
}

#[test]
#[serial]
fn test_missing_load_skipped_when_policy_allows() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (real, real_content) = write_load(dir.path(), "real.bin", 900);

    let dataloader_port = 45963;
    let target = FakeTarget::spawn("FMC-4200", "L", Behavior::AcceptAndComplete, dataloader_port);

    let loader = DataLoader::new();
    let handle = loader.create_handler().unwrap();
    configure_target(&loader, handle, &target, dataloader_port);
    loader
        .set_load_list(
            handle,
            vec![Load::new("/nonexistent/ghost.bin", "PN-GHOST"), real.clone()],
        )
        .unwrap();
    loader
        .set_file_not_available_policy(handle, FileNotAvailablePolicy::Skip)
        .unwrap();

    let missing = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&missing);
    loader
        .register_file_not_available_callback(handle, move |_, file_name| {
            seen.lock().unwrap().push(file_name.to_string());
        })
        .unwrap();

    let (_codes, terminal) = watch_statuses(&loader, handle);

    loader.upload(handle).unwrap();
    let outcome = terminal.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(outcome, STATUS_UPLOAD_COMPLETED);

    wait_for_state(&loader, handle, SessionState::Completed);
    assert_eq!(missing.lock().unwrap().len(), 1);
    assert_eq!(
        target.pulled.lock().unwrap().get(&real.load_name),
        Some(&real_content)
    );

    loader.destroy_handler(handle).unwrap();
}

#[test]
#[serial]
fn test_two_sessions_upload_concurrently() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (load_a, _) = write_load(dir.path(), "a.bin", 1500);
    let (load_b, _) = write_load(dir.path(), "b.bin", 700);

    let port_a = 45964;
    let port_b = 45965;
    let target_a = FakeTarget::spawn("FMC-4200", "L", Behavior::AcceptAndComplete, port_a);
    let target_b = FakeTarget::spawn("FMC-4200", "L", Behavior::AcceptAndComplete, port_b);

    let loader = DataLoader::new();

    let handle_a = loader.create_handler().unwrap();
    configure_target(&loader, handle_a, &target_a, port_a);
    loader.set_load_list(handle_a, vec![load_a]).unwrap();
    let (_, terminal_a) = watch_statuses(&loader, handle_a);

    let handle_b = loader.create_handler().unwrap();
    configure_target(&loader, handle_b, &target_b, port_b);
    loader.set_load_list(handle_b, vec![load_b]).unwrap();
    let (_, terminal_b) = watch_statuses(&loader, handle_b);

    loader.upload(handle_a).unwrap();
    loader.upload(handle_b).unwrap();

    assert_eq!(
        terminal_a.recv_timeout(Duration::from_secs(30)).unwrap(),
        STATUS_UPLOAD_COMPLETED
    );
    assert_eq!(
        terminal_b.recv_timeout(Duration::from_secs(30)).unwrap(),
        STATUS_UPLOAD_COMPLETED
    );

    wait_for_state(&loader, handle_a, SessionState::Completed);
    wait_for_state(&loader, handle_b, SessionState::Completed);

    loader.destroy_handler(handle_a).unwrap();
    loader.destroy_handler(handle_b).unwrap();
}

// Slow: moves ~32 MiB through the lock-step transfer twice.
#[test]
#[serial]
fn test_upload_of_load_spanning_block_counter_wrap() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();

    // More than 65535 blocks of 512 bytes, so the 16-bit block counter
    // wraps during the pull; the final block is a short one.
    let (big, big_content) = write_load(dir.path(), "big.bin", 65537 * 512 - 502);

    let dataloader_port = 45966;
    let target = FakeTarget::spawn("FMC-4200", "L", Behavior::AcceptAndComplete, dataloader_port);

    let loader = DataLoader::new();
    let handle = loader.create_handler().unwrap();
    configure_target(&loader, handle, &target, dataloader_port);
    loader.set_load_list(handle, vec![big.clone()]).unwrap();

    let (_codes, terminal) = watch_statuses(&loader, handle);

    loader.upload(handle).unwrap();
    let outcome = terminal.recv_timeout(Duration::from_secs(120)).unwrap();
    assert_eq!(outcome, STATUS_UPLOAD_COMPLETED);

    wait_for_state(&loader, handle, SessionState::Completed);
    assert_eq!(
        target.pulled.lock().unwrap().get(&big.load_name),
        Some(&big_content)
    );

    loader.destroy_handler(handle).unwrap();
}

#[test]
fn test_upload_rejects_incomplete_configuration() {
    let loader = DataLoader::new();
    let handle = loader.create_handler().unwrap();

    // No target hardware configured at all.
    assert!(matches!(
        loader.upload(handle),
        Err(Error::ConfigurationIncomplete(_))
    ));

    loader.set_target_hardware_id(handle, "FMC-4200").unwrap();
    loader
        .set_target_hardware_ip(handle, LOCALHOST.parse::<IpAddr>().unwrap())
        .unwrap();
    loader.set_target_hardware_pos(handle, "L").unwrap();

    // Target set, but nothing to upload.
    assert!(matches!(
        loader.upload(handle),
        Err(Error::ConfigurationIncomplete(_))
    ));

    // Nothing in flight, so nothing to abort.
    assert!(matches!(
        loader.abort_upload(handle, AbortSource::Operator),
        Err(Error::InvalidState(_))
    ));

    loader.destroy_handler(handle).unwrap();
}
