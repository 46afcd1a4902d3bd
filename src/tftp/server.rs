use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;

use anyhow::Result;

use super::{TransferConfig, TransferError};
use crate::cancel::CancelToken;
use crate::protocol::messages::UploadStatus;
use crate::protocol::{ErrorCode, Packet};

/// Granularity of the listen loop; the accept socket wakes up this
/// often to observe a cancel.
const LISTEN_SLICE: Duration = Duration::from_millis(200);

const STATUS_SUFFIX: &str = ".LUS";

/// Something the target hardware did against the dataloader's server.
#[derive(Debug)]
pub enum ServerEvent {
    /// The target wrote a status file.
    Status(UploadStatus),
    /// A load file was pulled to completion.
    LoadServed { load_name: String },
    /// The target requested a file that is not in the load list or
    /// could not be read. Emitted at most once per file name.
    FileNotAvailable { file_name: String },
}

/// Dataloader-side TFTP server.
///
/// Serves the session's load files when the target hardware pulls them
/// (RRQ) and accepts the periodic `.LUS` status files the target writes
/// back (WRQ). Anything else is refused.
pub struct LoadServer {
    socket: UdpSocket,
    loads: HashMap<String, PathBuf>,
    events: Sender<ServerEvent>,
    cancel: CancelToken,
    cfg: TransferConfig,
}

impl LoadServer {
    pub fn bind(
        port: u16,
        loads: HashMap<String, PathBuf>,
        events: Sender<ServerEvent>,
        cancel: CancelToken,
        cfg: TransferConfig,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
        ))?;
        socket.set_read_timeout(Some(LISTEN_SLICE))?;

        Ok(Self {
            socket,
            loads,
            events,
            cancel,
            cfg,
        })
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Accept loop. Returns when the cancel token fires or the event
    /// receiver goes away.
    pub fn run(self) {
        let mut reported_missing: HashSet<String> = HashSet::new();

        loop {
            if self.cancel.is_cancelled() {
                log::debug!("load server cancelled, shutting down");
                return;
            }

            let mut buf = vec![0; self.cfg.block_size + 4];
            let (amt, src) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    log::error!("load server socket error: {}", e);
                    return;
                }
            };

            let packet = match Packet::deserialize(&buf[..amt]) {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("malformed request from {}: {}", src, e);
                    continue;
                }
            };

            match packet {
                Packet::Rrq { filename, .. } => {
                    match self.loads.get(&filename).map(std::fs::read) {
                        Some(Ok(bytes)) => {
                            log::info!("serving {} ({} bytes) to {}", filename, bytes.len(), src);
                            let cfg = self.cfg;
                            let cancel = self.cancel.clone();
                            let events = self.events.clone();
                            thread::spawn(move || {
                                match serve_bytes(src, &bytes, cfg, &cancel) {
                                    Ok(()) => {
                                        let _ = events.send(ServerEvent::LoadServed {
                                            load_name: filename,
                                        });
                                    }
                                    Err(TransferError::Cancelled) => {}
                                    Err(e) => {
                                        log::warn!("serving {} failed: {}", filename, e);
                                    }
                                }
                            });
                        }
                        Some(Err(e)) => {
                            log::warn!("load {} is not readable: {}", filename, e);
                            self.refuse(src, ErrorCode::FileNotFound, "load not readable");
                            if reported_missing.insert(filename.clone()) {
                                let _ = self.events.send(ServerEvent::FileNotAvailable {
                                    file_name: filename,
                                });
                            }
                        }
                        None => {
                            log::warn!("{} requested unknown file {}", src, filename);
                            self.refuse(src, ErrorCode::FileNotFound, "file not in load list");
                            if reported_missing.insert(filename.clone()) {
                                let _ = self.events.send(ServerEvent::FileNotAvailable {
                                    file_name: filename,
                                });
                            }
                        }
                    }
                }
                Packet::Wrq { filename, .. } => {
                    if filename.ends_with(STATUS_SUFFIX) {
                        let cfg = self.cfg;
                        let cancel = self.cancel.clone();
                        let events = self.events.clone();
                        thread::spawn(move || match receive_bytes(src, cfg, &cancel) {
                            Ok(bytes) => match serde_json::from_slice::<UploadStatus>(&bytes) {
                                Ok(status) => {
                                    let _ = events.send(ServerEvent::Status(status));
                                }
                                Err(e) => {
                                    log::warn!("malformed status file {}: {}", filename, e);
                                }
                            },
                            Err(TransferError::Cancelled) => {}
                            Err(e) => {
                                log::warn!("receiving {} failed: {}", filename, e);
                            }
                        });
                    } else {
                        self.refuse(src, ErrorCode::AccessViolation, "only status writes accepted");
                    }
                }
                _ => {
                    self.refuse(src, ErrorCode::IllegalOperation, "expected RRQ or WRQ");
                }
            }
        }
    }

    fn refuse(&self, to: SocketAddr, code: ErrorCode, msg: &str) {
        let packet = Packet::Error {
            code,
            msg: msg.to_string(),
        };
        if let Ok(bytes) = packet.serialize() {
            let _ = self.socket.send_to(&bytes, to);
        }
    }
}

/// Send a buffer to `peer` in lock-step from an ephemeral transfer
/// socket, starting with DATA block 1.
fn serve_bytes(
    peer: SocketAddr,
    bytes: &[u8],
    cfg: TransferConfig,
    cancel: &CancelToken,
) -> Result<(), TransferError> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_read_timeout(Some(cfg.timeout))?;

    let bs = cfg.block_size;
    let chunk = |offset: usize| -> &[u8] {
        let end = (offset + bs).min(bytes.len());
        &bytes[offset..end]
    };

    // The 16-bit block counter wraps on transfers longer than 65535
    // blocks; byte progress is tracked separately.
    let mut offset = 0usize;
    let mut block_num: u16 = 1;
    let mut finished = chunk(offset).len() < bs;
    let mut retries = 0;

    let data = Packet::Data {
        block_num,
        data: chunk(offset).to_vec(),
    };
    socket.send_to(&data.serialize()?, peer)?;

    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let mut buf = vec![0; bs + 4];
        match socket.recv_from(&mut buf) {
            Ok((amt, src)) => {
                if src != peer {
                    continue;
                }

                match Packet::deserialize(&buf[..amt])? {
                    Packet::Ack(block) => {
                        if block == block_num {
                            if finished {
                                return Ok(());
                            }

                            offset += bs;
                            block_num = block_num.wrapping_add(1);
                            let data = chunk(offset);
                            if data.len() < bs {
                                finished = true;
                            }

                            let packet = Packet::Data {
                                block_num,
                                data: data.to_vec(),
                            };
                            socket.send_to(&packet.serialize()?, peer)?;
                            retries = 0;
                        }
                    }
                    Packet::Error { code, msg } => {
                        return Err(TransferError::Remote { code, msg });
                    }
                    _ => {}
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if retries >= cfg.max_retries {
                    return Err(TransferError::TimedOut(retries));
                }
                retries += 1;

                let packet = Packet::Data {
                    block_num,
                    data: chunk(offset).to_vec(),
                };
                socket.send_to(&packet.serialize()?, peer)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Accept a write from `peer` on an ephemeral transfer socket,
/// acknowledging block by block, and return the received bytes.
fn receive_bytes(
    peer: SocketAddr,
    cfg: TransferConfig,
    cancel: &CancelToken,
) -> Result<Vec<u8>, TransferError> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_read_timeout(Some(cfg.timeout))?;

    let bs = cfg.block_size;
    let mut out = Vec::new();
    let mut expected: u16 = 1;
    let mut retries = 0;

    socket.send_to(&Packet::Ack(0).serialize()?, peer)?;

    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let mut buf = vec![0; bs + 4];
        match socket.recv_from(&mut buf) {
            Ok((amt, src)) => {
                if src != peer {
                    continue;
                }

                match Packet::deserialize(&buf[..amt])? {
                    Packet::Data { block_num, data } => {
                        if block_num == expected {
                            out.extend_from_slice(&data);
                            socket.send_to(&Packet::Ack(block_num).serialize()?, peer)?;
                            retries = 0;

                            if data.len() < bs {
                                return Ok(out);
                            }
                            expected = expected.wrapping_add(1);
                        } else {
                            // Duplicate block; our ACK got lost.
                            socket
                                .send_to(&Packet::Ack(expected.wrapping_sub(1)).serialize()?, peer)?;
                        }
                    }
                    Packet::Error { code, msg } => {
                        return Err(TransferError::Remote { code, msg });
                    }
                    _ => {}
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if retries >= cfg.max_retries {
                    return Err(TransferError::TimedOut(retries));
                }
                retries += 1;
                socket.send_to(&Packet::Ack(expected.wrapping_sub(1)).serialize()?, peer)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
