use std::net::{IpAddr, SocketAddr, UdpSocket};

use super::{TransferConfig, TransferError};
use crate::cancel::CancelToken;
use crate::protocol::{MODE_OCTET, Packet};

/// TFTP client used against the target hardware's server.
///
/// Transfers operate on in-memory buffers: the initialization request
/// and response bodies are small JSON documents, never large files.
pub struct Client {
    remote_ip: IpAddr,
    remote_port: u16,
    cfg: TransferConfig,
}

impl Client {
    pub fn new(remote_ip: IpAddr, remote_port: u16, cfg: TransferConfig) -> Self {
        Self {
            remote_ip,
            remote_port,
            cfg,
        }
    }

    /// Upload a buffer to the server (WRQ).
    pub fn put_bytes(
        &self,
        remote_file: &str,
        bytes: &[u8],
        cancel: &CancelToken,
    ) -> Result<(), TransferError> {
        log::debug!(
            "WRQ {} ({} bytes) to {}:{}",
            remote_file,
            bytes.len(),
            self.remote_ip,
            self.remote_port
        );

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(Some(self.cfg.timeout))?;

        let mut server_addr = SocketAddr::new(self.remote_ip, self.remote_port);
        let mut tid_set = false;

        let wrq = Packet::Wrq {
            filename: remote_file.to_string(),
            mode: MODE_OCTET.to_string(),
        };
        socket.send_to(&wrq.serialize()?, server_addr)?;

        let bs = self.cfg.block_size;
        // Block currently on the wire; until `wrq_acked` that is the
        // WRQ itself. The 16-bit counter wraps on long transfers, so
        // the byte offset of the current block is tracked separately.
        let mut block_num: u16 = 0;
        let mut offset = 0usize;
        let mut wrq_acked = false;
        let mut finished = false;
        let mut retries = 0;

        let chunk = |off: usize| -> &[u8] {
            let end = (off + bs).min(bytes.len());
            &bytes[off..end]
        };

        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let mut buf = vec![0; bs + 4];
            match socket.recv_from(&mut buf) {
                Ok((amt, src)) => {
                    // The server answers from an ephemeral transfer port.
                    if !tid_set {
                        if src.ip() == self.remote_ip {
                            server_addr = src;
                            tid_set = true;
                        } else {
                            continue;
                        }
                    } else if src != server_addr {
                        continue;
                    }

                    let packet = Packet::deserialize(&buf[..amt])?;
                    match packet {
                        Packet::Ack(block) => {
                            if block == block_num {
                                if finished {
                                    break;
                                }

                                if wrq_acked {
                                    offset += bs;
                                } else {
                                    wrq_acked = true;
                                }
                                block_num = block_num.wrapping_add(1);
                                let data = chunk(offset);
                                if data.len() < bs {
                                    finished = true;
                                }

                                let packet = Packet::Data {
                                    block_num,
                                    data: data.to_vec(),
                                };
                                socket.send_to(&packet.serialize()?, server_addr)?;
                                retries = 0;
                            }
                            // Duplicate or stale ACKs are ignored; the
                            // block timeout drives retransmission.
                        }
                        Packet::Error { code, msg } => {
                            return Err(TransferError::Remote { code, msg });
                        }
                        _ => {
                            log::warn!("unexpected packet during WRQ of {}", remote_file);
                        }
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if retries >= self.cfg.max_retries {
                        return Err(TransferError::TimedOut(retries));
                    }
                    retries += 1;
                    log::debug!(
                        "timeout on block {}, retrying ({}/{})",
                        block_num,
                        retries,
                        self.cfg.max_retries
                    );

                    if !wrq_acked {
                        socket.send_to(&wrq.serialize()?, server_addr)?;
                    } else {
                        let packet = Packet::Data {
                            block_num,
                            data: chunk(offset).to_vec(),
                        };
                        socket.send_to(&packet.serialize()?, server_addr)?;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Download a file from the server (RRQ) into a buffer.
    pub fn get_bytes(
        &self,
        remote_file: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, TransferError> {
        log::debug!(
            "RRQ {} from {}:{}",
            remote_file,
            self.remote_ip,
            self.remote_port
        );

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(Some(self.cfg.timeout))?;

        let mut server_addr = SocketAddr::new(self.remote_ip, self.remote_port);
        let mut tid_set = false;

        let rrq = Packet::Rrq {
            filename: remote_file.to_string(),
            mode: MODE_OCTET.to_string(),
        };
        socket.send_to(&rrq.serialize()?, server_addr)?;

        let bs = self.cfg.block_size;
        let mut out = Vec::new();
        let mut expected: u16 = 1;
        let mut retries = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let mut buf = vec![0; bs + 4];
            match socket.recv_from(&mut buf) {
                Ok((amt, src)) => {
                    if !tid_set {
                        if src.ip() == self.remote_ip {
                            server_addr = src;
                            tid_set = true;
                        } else {
                            continue;
                        }
                    } else if src != server_addr {
                        continue;
                    }

                    let packet = Packet::deserialize(&buf[..amt])?;
                    match packet {
                        Packet::Data { block_num, data } => {
                            if block_num == expected {
                                out.extend_from_slice(&data);

                                let ack = Packet::Ack(block_num);
                                socket.send_to(&ack.serialize()?, server_addr)?;
                                retries = 0;

                                if data.len() < bs {
                                    break;
                                }
                                expected = expected.wrapping_add(1);
                            } else {
                                // Duplicate data block; re-ack so the
                                // sender can make progress.
                                let ack = Packet::Ack(expected.wrapping_sub(1));
                                socket.send_to(&ack.serialize()?, server_addr)?;
                            }
                        }
                        Packet::Error { code, msg } => {
                            return Err(TransferError::Remote { code, msg });
                        }
                        _ => {
                            log::warn!("unexpected packet during RRQ of {}", remote_file);
                        }
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if retries >= self.cfg.max_retries {
                        return Err(TransferError::TimedOut(retries));
                    }
                    retries += 1;

                    if expected == 1 && out.is_empty() {
                        socket.send_to(&rrq.serialize()?, server_addr)?;
                    } else {
                        let ack = Packet::Ack(expected.wrapping_sub(1));
                        socket.send_to(&ack.serialize()?, server_addr)?;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(out)
    }
}
