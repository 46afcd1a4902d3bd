//! TFTP transfer engine (RFC 1350, fixed 512-byte blocks, lock-step
//! acknowledgment).
//!
//! The dataloader is both a TFTP client (writing the initialization
//! request to the target hardware and reading its response back) and a
//! TFTP server (serving load files the target pulls, and accepting the
//! status files the target writes while it applies them).
//!
//! Every blocking wait is bounded by a per-block timeout and re-checks
//! a cancel token, so an abort takes effect within roughly one block
//! timeout regardless of which sub-step is executing.

pub mod client;
pub mod server;

use std::time::Duration;

use thiserror::Error;

use crate::protocol::ErrorCode;

pub use client::Client;
pub use server::{LoadServer, ServerEvent};

/// Fixed TFTP block size. Option negotiation (RFC 2348) is not part of
/// the target hardware protocol.
pub const BLOCK_SIZE: usize = 512;

pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Per-transfer tuning shared by the client and server sides.
#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub block_size: usize,
    /// Per-block receive timeout; also the granularity at which a
    /// cancel is observed.
    pub timeout: Duration,
    /// Retransmissions allowed per block before the transfer is
    /// declared failed.
    pub max_retries: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            timeout: DEFAULT_BLOCK_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Outcome of a single-file transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer cancelled")]
    Cancelled,

    #[error("transfer timed out after {0} retries")]
    TimedOut(u32),

    #[error("remote tftp error {code:?}: {msg}")]
    Remote { code: ErrorCode, msg: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TransferError {
    /// True when the remote side answered "file not found".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TransferError::Remote {
                code: ErrorCode::FileNotFound,
                ..
            }
        )
    }
}
