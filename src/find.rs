//! Discovery engine: broadcasts a find request and streams device
//! announcements back through the session callbacks.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::api::Handle;
use crate::cancel::CancelToken;
use crate::protocol::messages::{DeviceInfo, FindRequest};
use crate::session::events::Callbacks;
use crate::session::{Session, SessionState};

/// UDP port the target hardware listens on for discovery requests.
pub const DEFAULT_DISCOVERY_PORT: u16 = 1001;

/// Granularity of the collection loop; a cancel or the window deadline
/// is observed this often.
const RECV_SLICE: Duration = Duration::from_millis(200);

/// Re-broadcast interval inside the collection window, in case the
/// first request datagram was lost.
const REBROADCAST_EVERY: Duration = Duration::from_secs(1);

/// Immutable snapshot for one find operation.
pub(crate) struct FindPlan {
    pub discovery_port: u16,
    pub timeout: Duration,
    /// When set, the request is unicast to this address instead of
    /// broadcast; used for load-targeted discovery.
    pub target_ip: Option<IpAddr>,
}

/// Find worker entry point, run on a background thread.
///
/// `find_started` fires first, `find_new_device` once per distinct
/// unit as soon as it is first seen, and `find_finished` exactly once
/// at the end of the window, also on error, cancel or zero devices.
pub(crate) fn run(handle: Handle, session: Arc<Session>, plan: FindPlan, cancel: CancelToken) {
    let callbacks = session.callbacks();
    callbacks.fire_find_started(handle);

    if let Err(e) = collect(handle, &plan, &cancel, &callbacks) {
        log::warn!("find operation failed: {}", e);
    }

    session.set_state(SessionState::Idle);
    callbacks.fire_find_finished(handle);
}

fn collect(
    handle: Handle,
    plan: &FindPlan,
    cancel: &CancelToken,
    callbacks: &Callbacks,
) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_read_timeout(Some(RECV_SLICE))?;

    let destination = match plan.target_ip {
        Some(ip) => SocketAddr::new(ip, plan.discovery_port),
        None => {
            socket.set_broadcast(true)?;
            SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), plan.discovery_port)
        }
    };

    let request = serde_json::to_vec(&FindRequest::new())?;
    socket.send_to(&request, destination)?;
    log::info!("find request sent to {}", destination);

    let deadline = Instant::now() + plan.timeout;
    let mut last_broadcast = Instant::now();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut buf = vec![0; 2048];

    while Instant::now() < deadline {
        if cancel.is_cancelled() {
            log::debug!("find cancelled");
            break;
        }

        if last_broadcast.elapsed() >= REBROADCAST_EVERY {
            socket.send_to(&request, destination)?;
            last_broadcast = Instant::now();
        }

        let (amt, src) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let device: DeviceInfo = match serde_json::from_slice(&buf[..amt]) {
            Ok(d) => d,
            Err(e) => {
                log::debug!("ignoring malformed announce from {}: {}", src, e);
                continue;
            }
        };

        let key = (
            device.hardware.target_hardware_identifier.clone(),
            device.hardware.target_hardware_position.clone(),
        );
        if seen.insert(key) {
            log::info!(
                "found {} at {} (position {})",
                device.hardware.target_hardware_identifier,
                device.ip,
                device.hardware.target_hardware_position
            );
            callbacks.fire_find_new_device(handle, &device);
        }
    }

    log::debug!("find window closed, {} device(s) seen", seen.len());
    Ok(())
}
