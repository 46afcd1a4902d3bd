//! In-process stand-ins for target hardware, built on the crate's own
//! packet codec so the tests exercise the real wire behavior.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use dataload::cancel::CancelToken;
use dataload::protocol::messages::{
    self, DeviceInfo, InitializationRequest, InitializationResponse, ManifestEntry, UploadStatus,
    INITIALIZATION_UPLOAD_IS_ACCEPTED, STATUS_UPLOAD_ACCEPTED, STATUS_UPLOAD_COMPLETED,
    STATUS_UPLOAD_IN_PROGRESS,
};
use dataload::protocol::Packet;
use dataload::tftp::{Client, TransferConfig};

const RECV_SLICE: Duration = Duration::from_millis(200);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn test_transfer_config() -> TransferConfig {
    TransferConfig {
        timeout: Duration::from_millis(300),
        max_retries: 10,
        ..TransferConfig::default()
    }
}

// ---------------------------------------------------------------------
// Discovery responder
// ---------------------------------------------------------------------

/// Answers every discovery request with a fixed set of announce
/// datagrams, duplicates included, from a loopback port of its own.
pub struct FakeAnnouncer {
    pub port: u16,
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl FakeAnnouncer {
    pub fn spawn(devices: Vec<DeviceInfo>) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(RECV_SLICE)).unwrap();
        let port = socket.local_addr().unwrap().port();

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let worker = thread::spawn(move || {
            let mut buf = [0u8; 2048];
            while !stop_flag.load(Ordering::Relaxed) {
                let (_, src) = match socket.recv_from(&mut buf) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                for device in &devices {
                    let body = serde_json::to_vec(device).unwrap();
                    let _ = socket.send_to(&body, src);
                }
            }
        });

        Self {
            port,
            stop,
            worker: Some(worker),
        }
    }
}

impl Drop for FakeAnnouncer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

pub fn announce(id: &str, position: &str, ip: &str) -> DeviceInfo {
    serde_json::from_value(serde_json::json!({
        "mac": "02-00-00-00-00-01",
        "ip": ip,
        "hardware": {
            "targetHardwareIdentifier": id,
            "targetHardwarePosition": position,
        }
    }))
    .unwrap()
}

// ---------------------------------------------------------------------
// Upload-side fake target
// ---------------------------------------------------------------------

/// How the fake target reacts to an upload.
#[derive(Clone, Copy)]
pub enum Behavior {
    /// Accept, pull every load, report completion.
    AcceptAndComplete,
    /// Deny the initialization with this status code.
    Deny(u16),
    /// Accept, then keep reporting progress without ever completing.
    AcceptThenStall,
}

/// A target hardware unit: a TFTP front that takes the `.LUI` write,
/// serves the `.LUR` response, and on acceptance drives the transfer
/// phase against the dataloader's own server.
pub struct FakeTarget {
    pub tftp_port: u16,
    /// Load bytes pulled from the dataloader, keyed by load name.
    pub pulled: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl FakeTarget {
    pub fn spawn(id: &str, position: &str, behavior: Behavior, dataloader_port: u16) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(RECV_SLICE)).unwrap();
        let tftp_port = socket.local_addr().unwrap().port();

        let stop = Arc::new(AtomicBool::new(false));
        let pulled = Arc::new(Mutex::new(HashMap::new()));

        let front = Front {
            socket,
            id: id.to_string(),
            position: position.to_string(),
            behavior,
            dataloader_port,
            stop: Arc::clone(&stop),
            pulled: Arc::clone(&pulled),
        };
        let worker = thread::spawn(move || front.run());

        Self {
            tftp_port,
            pulled,
            stop,
            worker: Some(worker),
        }
    }
}

impl Drop for FakeTarget {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct Front {
    socket: UdpSocket,
    id: String,
    position: String,
    behavior: Behavior,
    dataloader_port: u16,
    stop: Arc<AtomicBool>,
    pulled: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl Front {
    fn run(self) {
        let lui_name = messages::init_request_file(&self.id, &self.position);
        let lur_name = messages::init_response_file(&self.id, &self.position);
        let mut lur_body: Option<Vec<u8>> = None;

        let mut buf = [0u8; 1024];
        while !self.stop.load(Ordering::Relaxed) {
            let (amt, src) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let packet = match Packet::deserialize(&buf[..amt]) {
                Ok(p) => p,
                Err(_) => continue,
            };

            match packet {
                Packet::Wrq { filename, .. } if filename == lui_name => {
                    let body = receive_write(&self.socket, src);
                    let request: InitializationRequest = serde_json::from_slice(&body).unwrap();

                    let (code, description) = match self.behavior {
                        Behavior::Deny(code) => (code, Some("not authorized".to_string())),
                        _ => (INITIALIZATION_UPLOAD_IS_ACCEPTED, None),
                    };
                    let response = InitializationResponse {
                        operation_acceptance_status_code: code,
                        status_description: description,
                    };
                    lur_body = Some(serde_json::to_vec(&response).unwrap());

                    if response.is_accepted() {
                        let driver = Driver {
                            behavior: self.behavior,
                            loads: request.load_list,
                            status_name: messages::status_file(&self.id, &self.position),
                            dataloader_port: self.dataloader_port,
                            stop: Arc::clone(&self.stop),
                            pulled: Arc::clone(&self.pulled),
                        };
                        thread::spawn(move || driver.run());
                    }
                }
                Packet::Wrq { filename, .. } if filename.ends_with(".LUS") => {
                    // Abort notification from the dataloader.
                    let _ = receive_write(&self.socket, src);
                }
                Packet::Rrq { filename, .. } if filename == lur_name => {
                    if let Some(body) = &lur_body {
                        serve_read(&self.socket, src, body);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Transfer-phase driver: pulls the announced loads from the
/// dataloader's server and writes status files back, the way real
/// target hardware does between acceptance and completion.
struct Driver {
    behavior: Behavior,
    loads: Vec<ManifestEntry>,
    status_name: String,
    dataloader_port: u16,
    stop: Arc<AtomicBool>,
    pulled: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl Driver {
    fn run(self) {
        let client = Client::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            self.dataloader_port,
            test_transfer_config(),
        );

        self.send_status(&client, STATUS_UPLOAD_ACCEPTED, 0.0, None);

        if let Behavior::AcceptThenStall = self.behavior {
            let mut percent = 1.0f32;
            let mut failures = 0;
            while !self.stop.load(Ordering::Relaxed) && failures < 3 {
                if !self.send_status(&client, STATUS_UPLOAD_IN_PROGRESS, percent, None) {
                    failures += 1;
                }
                percent = (percent + 2.0).min(50.0);
                thread::sleep(Duration::from_millis(200));
            }
            return;
        }

        let total = self.loads.len() as f32;
        for (i, entry) in self.loads.iter().enumerate() {
            if self.stop.load(Ordering::Relaxed) {
                return;
            }

            match client.get_bytes(&entry.load_name, &CancelToken::new()) {
                Ok(bytes) => {
                    self.pulled
                        .lock()
                        .unwrap()
                        .insert(entry.load_name.clone(), bytes);
                }
                Err(_) => continue,
            }

            let percent = ((i + 1) as f32 / total) * 100.0;
            self.send_status(
                &client,
                STATUS_UPLOAD_IN_PROGRESS,
                percent.min(99.0),
                Some(entry.load_name.clone()),
            );
        }

        self.send_status(&client, STATUS_UPLOAD_COMPLETED, 100.0, None);
    }

    fn send_status(
        &self,
        client: &Client,
        code: u16,
        percent: f32,
        current_load: Option<String>,
    ) -> bool {
        let status = UploadStatus {
            upload_operation_status_code: code,
            upload_status_description: None,
            percent_completed: percent,
            current_load,
        };
        let body = serde_json::to_vec(&status).unwrap();
        client
            .put_bytes(&self.status_name, &body, &CancelToken::new())
            .is_ok()
    }
}

// ---------------------------------------------------------------------
// Minimal lock-step transfers on the front socket (single client)
// ---------------------------------------------------------------------

/// Accept a WRQ from `peer` on the already-bound front socket and
/// return the written bytes.
fn receive_write(socket: &UdpSocket, peer: SocketAddr) -> Vec<u8> {
    let mut out = Vec::new();
    let mut expected: u16 = 1;

    socket
        .send_to(&Packet::Ack(0).serialize().unwrap(), peer)
        .unwrap();

    let mut buf = [0u8; 1024];
    let mut idle = 0;
    loop {
        let (amt, src) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(_) => {
                idle += 1;
                if idle > 25 {
                    return out;
                }
                continue;
            }
        };
        if src != peer {
            continue;
        }

        if let Ok(Packet::Data { block_num, data }) = Packet::deserialize(&buf[..amt]) {
            if block_num == expected {
                out.extend_from_slice(&data);
                socket
                    .send_to(&Packet::Ack(block_num).serialize().unwrap(), peer)
                    .unwrap();
                if data.len() < 512 {
                    return out;
                }
                expected = expected.wrapping_add(1);
            } else {
                let _ = socket.send_to(
                    &Packet::Ack(expected.wrapping_sub(1)).serialize().unwrap(),
                    peer,
                );
            }
        }
    }
}

/// Answer an RRQ from `peer` with `bytes`, lock-step on the front
/// socket.
fn serve_read(socket: &UdpSocket, peer: SocketAddr, bytes: &[u8]) {
    let mut block_num: u16 = 1;
    let mut buf = [0u8; 1024];
    let mut idle = 0;

    loop {
        let start = (block_num as usize - 1) * 512;
        if start > bytes.len() {
            return;
        }
        let end = (start + 512).min(bytes.len());
        let chunk = &bytes[start..end];
        let last = chunk.len() < 512;

        let packet = Packet::Data {
            block_num,
            data: chunk.to_vec(),
        };
        socket.send_to(&packet.serialize().unwrap(), peer).unwrap();

        loop {
            let (amt, src) = match socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(_) => {
                    idle += 1;
                    if idle > 25 {
                        return;
                    }
                    break;
                }
            };
            if src != peer {
                continue;
            }
            if let Ok(Packet::Ack(block)) = Packet::deserialize(&buf[..amt]) {
                if block == block_num {
                    if last {
                        return;
                    }
                    block_num = block_num.wrapping_add(1);
                    break;
                }
            }
        }
    }
}
