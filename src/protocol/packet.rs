use anyhow::{Result, anyhow, bail};

/// Transfer mode used for all load transfers. Loads are binary images,
/// so "netascii" is never negotiated.
pub const MODE_OCTET: &str = "octet";

/// TFTP error codes as defined by RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTid = 5,
    FileExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    fn from_u16(code: u16) -> Self {
        match code {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::NotDefined,
        }
    }
}

/// A TFTP packet (RFC 1350 subset, fixed 512-byte blocks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq { filename: String, mode: String },
    Wrq { filename: String, mode: String },
    Data { block_num: u16, data: Vec<u8> },
    Ack(u16),
    Error { code: ErrorCode, msg: String },
}

const OPCODE_RRQ: u16 = 1;
const OPCODE_WRQ: u16 = 2;
const OPCODE_DATA: u16 = 3;
const OPCODE_ACK: u16 = 4;
const OPCODE_ERROR: u16 = 5;

impl Packet {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Packet::Rrq { filename, mode } => {
                buf.extend_from_slice(&OPCODE_RRQ.to_be_bytes());
                buf.extend_from_slice(filename.as_bytes());
                buf.push(0);
                buf.extend_from_slice(mode.as_bytes());
                buf.push(0);
            }
            Packet::Wrq { filename, mode } => {
                buf.extend_from_slice(&OPCODE_WRQ.to_be_bytes());
                buf.extend_from_slice(filename.as_bytes());
                buf.push(0);
                buf.extend_from_slice(mode.as_bytes());
                buf.push(0);
            }
            Packet::Data { block_num, data } => {
                buf.extend_from_slice(&OPCODE_DATA.to_be_bytes());
                buf.extend_from_slice(&block_num.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack(block_num) => {
                buf.extend_from_slice(&OPCODE_ACK.to_be_bytes());
                buf.extend_from_slice(&block_num.to_be_bytes());
            }
            Packet::Error { code, msg } => {
                buf.extend_from_slice(&OPCODE_ERROR.to_be_bytes());
                buf.extend_from_slice(&(*code as u16).to_be_bytes());
                buf.extend_from_slice(msg.as_bytes());
                buf.push(0);
            }
        }
        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Packet> {
        if buf.len() < 4 {
            bail!("packet too short: {} bytes", buf.len());
        }

        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        match opcode {
            OPCODE_RRQ | OPCODE_WRQ => {
                let (filename, rest) = read_cstr(&buf[2..])?;
                let (mode, _) = read_cstr(rest)?;
                if opcode == OPCODE_RRQ {
                    Ok(Packet::Rrq { filename, mode })
                } else {
                    Ok(Packet::Wrq { filename, mode })
                }
            }
            OPCODE_DATA => Ok(Packet::Data {
                block_num: u16::from_be_bytes([buf[2], buf[3]]),
                data: buf[4..].to_vec(),
            }),
            OPCODE_ACK => Ok(Packet::Ack(u16::from_be_bytes([buf[2], buf[3]]))),
            OPCODE_ERROR => {
                let code = u16::from_be_bytes([buf[2], buf[3]]);
                let (msg, _) = read_cstr(&buf[4..])?;
                Ok(Packet::Error {
                    code: ErrorCode::from_u16(code),
                    msg,
                })
            }
            _ => Err(anyhow!("unknown opcode: {}", opcode)),
        }
    }
}

fn read_cstr(buf: &[u8]) -> Result<(String, &[u8])> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| anyhow!("missing string terminator"))?;
    let s = std::str::from_utf8(&buf[..end])?.to_string();
    Ok((s, &buf[end + 1..]))
}
