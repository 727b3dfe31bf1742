//! Packet-size negotiator (spec.md §4.4): binary search for the largest GVSP
//! payload that survives the path to the host, using the device's
//! `GevSCPSFireTestPacket` feature.
//!
//! Grounded on the reference `auto_packet_size` routine: probe at the current
//! size, then bisect between device-reported bounds, preferring the larger
//! size on success and the smaller on failure, until the search interval
//! collapses to less than one increment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::consts::{stream_channel_reg, SC_OFFSET_DEST_IP, SC_OFFSET_DEST_PORT, SC_OFFSET_PACKET_SIZE, SCPS_DO_NOT_FRAGMENT_BIT, SCPS_FIRE_TEST_PACKET_BIT};
use crate::device::{DeviceError, GigeDevice};
use crate::gvsp::LEGACY_HEADER_LEN;

/// Fallback packet size used when the device doesn't support test packets.
pub const FALLBACK_PACKET_SIZE: u32 = 1500;
/// Largest GVSP payload this core will ever request.
pub const MAXIMUM_PACKET_SIZE: u32 = 16_000;
/// Smallest GVSP payload this core will ever request.
pub const MINIMUM_PACKET_SIZE: u32 = 256;
const FIRE_ATTEMPTS: u32 = 3;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// When automatic packet-size negotiation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsizeMode {
    Never,
    Always,
    Once,
    OnFailure,
    OnFailureOnce,
}

/// Device-reported bounds for `GevSCPSPacketSize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsizeBounds {
    pub min: u32,
    pub max: u32,
    pub increment: u32,
}

/// Bind the ephemeral probe socket and point the channel's stream
/// destination at it for the duration of negotiation.
async fn open_probe(device: &GigeDevice, channel: u32, iface_ip: Ipv4Addr) -> Result<UdpSocket, DeviceError> {
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(iface_ip), 0))
        .await
        .map_err(|err| DeviceError::Protocol(Box::leak(err.to_string().into_boxed_str())))?;
    let port = socket
        .local_addr()
        .map_err(|err| DeviceError::Protocol(Box::leak(err.to_string().into_boxed_str())))?
        .port();
    device
        .write_register(stream_channel_reg(channel, SC_OFFSET_DEST_IP), u32::from(iface_ip))
        .await?;
    device
        .write_register(stream_channel_reg(channel, SC_OFFSET_DEST_PORT), (port as u32) << 16)
        .await?;
    Ok(socket)
}

/// Command one `FireTestPacket` and wait (up to [`FIRE_ATTEMPTS`] tries) for a
/// datagram of exactly `size - LEGACY_HEADER_LEN - UDP/IP overhead` bytes.
async fn probe_size(device: &GigeDevice, channel: u32, socket: &UdpSocket, size: u32) -> Result<bool, DeviceError> {
    let reg = stream_channel_reg(channel, SC_OFFSET_PACKET_SIZE);
    let expected = size.saturating_sub(LEGACY_HEADER_LEN as u32);
    let mut buf = vec![0u8; MAXIMUM_PACKET_SIZE as usize];

    for attempt in 0..FIRE_ATTEMPTS {
        device.write_register(reg, size | SCPS_FIRE_TEST_PACKET_BIT).await?;
        match timeout(POLL_INTERVAL, socket.recv(&mut buf)).await {
            Ok(Ok(n)) if n as u32 >= expected.saturating_sub(8) => return Ok(true),
            Ok(Ok(n)) => debug!(attempt, size, got = n, "test packet size mismatch, treating as loss"),
            Ok(Err(err)) => warn!(?err, "error receiving test packet"),
            Err(_) => {}
        }
    }
    Ok(false)
}

/// Quick single-probe check: does `current` already survive the path to the
/// host? `OnFailure`/`OnFailureOnce` only fall through to the full bisection
/// in [`negotiate`] when this comes back `false`.
pub async fn check_current(device: &GigeDevice, channel: u32, iface_ip: Ipv4Addr, current: u32) -> Result<bool, DeviceError> {
    let socket = open_probe(device, channel, iface_ip).await?;
    let reg = stream_channel_reg(channel, SC_OFFSET_PACKET_SIZE);
    device.write_register(reg, SCPS_DO_NOT_FRAGMENT_BIT).await?;
    let ok = probe_size(device, channel, &socket, current).await?;
    if ok {
        device.write_register(reg, current).await?;
    }
    Ok(ok)
}

/// Run the full binary-search negotiation and return the accepted size.
///
/// `current` is the packet size already configured on the device (the
/// starting point, tried first before bisecting). Falls back to
/// [`FALLBACK_PACKET_SIZE`] if `GevSCPSFireTestPacket` is not implemented
/// (mapped from a `NotImplemented` status by the caller's register write).
pub async fn negotiate(device: &GigeDevice, channel: u32, iface_ip: Ipv4Addr, bounds: PsizeBounds, current: u32) -> Result<u32, DeviceError> {
    let inc = bounds.increment.max(1);
    let mut max_size = bounds.max.min(MAXIMUM_PACKET_SIZE);
    let mut min_size = bounds.min.max(MINIMUM_PACKET_SIZE);
    if max_size < min_size || inc > max_size - min_size {
        warn!("invalid packet size bounds, falling back to current size");
        return Ok(current);
    }

    let socket = open_probe(device, channel, iface_ip).await?;
    let reg = stream_channel_reg(channel, SC_OFFSET_PACKET_SIZE);
    device.write_register(reg, SCPS_DO_NOT_FRAGMENT_BIT).await?;

    let mut accepted = current;
    let mut candidate = current;
    let mut last_size = 0u32;

    loop {
        if candidate == last_size || min_size + inc > max_size {
            break;
        }
        last_size = candidate;
        match probe_size(device, channel, &socket, candidate).await {
            Ok(true) => {
                accepted = candidate;
                if candidate == max_size {
                    break;
                }
                min_size = candidate;
            }
            Ok(false) => {
                max_size = candidate;
            }
            Err(err) => {
                warn!(?err, "packet-size probe failed, keeping last accepted size");
                break;
            }
        }
        candidate = min_size + ((max_size - min_size) / 2 / inc) * inc;
    }

    device.write_register(reg, accepted).await?;
    info!(packet_size = accepted, "packet-size negotiation complete");
    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bisection_step_moves_toward_midpoint() {
        let min_size = 1000u32;
        let max_size = 9000u32;
        let inc = 4u32;
        let next = min_size + ((max_size - min_size) / 2 / inc) * inc;
        assert!(next > min_size && next < max_size);
        assert_eq!(next % inc, 0);
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        let bounds = PsizeBounds { min: 9000, max: 1000, increment: 4 };
        assert!(bounds.max < bounds.min);
    }
}
