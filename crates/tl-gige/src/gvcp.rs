//! GVCP wire framing and device discovery.
//!
//! This module only deals with the request/ack *shape*; the retrying
//! request/reply engine lives in [`crate::control`].

use std::collections::HashMap;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use genicp::{AckOrPending, CommandFlags, OpCode};
use if_addrs::{get_if_addrs, IfAddr};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{info, trace};

use crate::consts::GVCP_PORT;

/// A GVCP request header ready to be prefixed onto a command body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GvcpHeader {
    /// Request flags (acknowledgement, broadcast).
    pub flags: CommandFlags,
    /// Raw command/opcode value.
    pub command: u16,
    /// Payload length in bytes.
    pub length: u16,
    /// Request identifier.
    pub request_id: u16,
}

impl GvcpHeader {
    /// Encode the header into a `Bytes` buffer ready to be transmitted.
    pub fn encode(self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(genicp::HEADER_SIZE + payload.len());
        buf.put_u16(self.flags.bits());
        buf.put_u16(self.command);
        buf.put_u16(self.length);
        buf.put_u16(self.request_id);
        buf.extend_from_slice(payload);
        buf.freeze()
    }
}

/// Errors raised while framing or discovering over GVCP.
#[derive(Debug, Error)]
pub enum GvcpError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("gencp: {0}")]
    GenCp(#[from] genicp::GenCpError),
}

/// Information returned by GVCP discovery packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub ip: Ipv4Addr,
    pub mac: [u8; 6],
    pub model: Option<String>,
    pub manufacturer: Option<String>,
}

impl DeviceInfo {
    pub fn mac_string(&self) -> String {
        self.mac
            .iter()
            .map(|byte| format!("{byte:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Discover GigE Vision devices on the local network by broadcasting a GVCP discovery command.
pub async fn discover(timeout: Duration) -> Result<Vec<DeviceInfo>, GvcpError> {
    discover_filtered(timeout, None).await
}

/// Discover devices only on the specified interface name.
pub async fn discover_on_interface(
    timeout: Duration,
    interface: &str,
) -> Result<Vec<DeviceInfo>, GvcpError> {
    discover_filtered(timeout, Some(interface)).await
}

async fn discover_filtered(
    timeout: Duration,
    iface_filter: Option<&str>,
) -> Result<Vec<DeviceInfo>, GvcpError> {
    let mut interfaces = Vec::new();
    for iface in get_if_addrs()? {
        let IfAddr::V4(v4) = iface.addr else {
            continue;
        };
        if v4.ip.is_loopback() {
            continue;
        }
        if let Some(filter) = iface_filter {
            if iface.name != filter {
                continue;
            }
        }
        interfaces.push((iface.name, v4));
    }

    if interfaces.is_empty() {
        return Ok(Vec::new());
    }

    let mut join_set = JoinSet::new();
    for (idx, (name, v4)) in interfaces.into_iter().enumerate() {
        let request_id = 0x0100u16.wrapping_add(idx as u16).max(1);
        let interface_name = name.clone();
        join_set.spawn(async move {
            let local_addr = SocketAddr::new(IpAddr::V4(v4.ip), 0);
            let socket = UdpSocket::bind(local_addr).await?;
            socket.set_broadcast(true)?;
            let broadcast = v4.broadcast.unwrap_or(Ipv4Addr::BROADCAST);
            let destination = SocketAddr::new(IpAddr::V4(broadcast), GVCP_PORT);

            let header = GvcpHeader {
                flags: CommandFlags::ACK_REQUIRED | CommandFlags::BROADCAST,
                command: OpCode::Discovery.command_code(),
                length: 0,
                request_id,
            };
            let packet = header.encode(&[]);
            info!(%interface_name, local = %v4.ip, dest = %destination, "sending GVCP discovery");
            trace!(%interface_name, bytes = packet.len(), "GVCP discovery payload size");
            socket.send_to(&packet, destination).await?;

            let mut responses = Vec::new();
            let mut buffer = vec![0u8; 2048];
            let timer = time::sleep(timeout);
            tokio::pin!(timer);
            loop {
                tokio::select! {
                    _ = &mut timer => break,
                    recv = socket.recv_from(&mut buffer) => {
                        let (len, src) = recv?;
                        info!(%interface_name, %src, "received GVCP response");
                        trace!(%interface_name, bytes = len, "GVCP response length");
                        if let Some(info) = parse_discovery_ack(&buffer[..len], request_id)? {
                            trace!(ip = %info.ip, mac = %info.mac_string(), "parsed discovery ack");
                            responses.push(info);
                        }
                    }
                }
            }
            Ok::<_, GvcpError>(responses)
        });
    }

    let mut seen = HashMap::new();
    while let Some(res) = join_set.join_next().await {
        let devices =
            res.map_err(|e| GvcpError::Protocol(format!("discovery task failed: {e}")))??;
        for dev in devices {
            seen.entry((dev.ip, dev.mac)).or_insert(dev);
        }
    }

    let mut devices: Vec<_> = seen.into_values().collect();
    devices.sort_by_key(|d| d.ip);
    Ok(devices)
}

fn parse_discovery_ack(
    buf: &[u8],
    expected_request: u16,
) -> Result<Option<DeviceInfo>, GvcpError> {
    if buf.len() < genicp::HEADER_SIZE {
        return Err(GvcpError::Protocol("GVCP ack too short".into()));
    }
    match genicp::decode_ack(buf)? {
        AckOrPending::Pending(_) => Ok(None),
        AckOrPending::Ack(ack) => {
            if ack.header.request_id != expected_request {
                return Ok(None);
            }
            if ack.header.opcode != OpCode::Discovery {
                return Err(GvcpError::Protocol(format!(
                    "unexpected discovery opcode {:?}",
                    ack.header.opcode
                )));
            }
            if ack.header.status != genicp::StatusCode::Success {
                return Err(GvcpError::Protocol(format!(
                    "discovery returned status {:?}",
                    ack.header.status
                )));
            }
            Ok(Some(parse_discovery_payload(&ack.payload)?))
        }
    }
}

fn parse_discovery_payload(payload: &[u8]) -> Result<DeviceInfo, GvcpError> {
    let mut cursor = Cursor::new(payload);
    if cursor.remaining() < 32 {
        return Err(GvcpError::Protocol("discovery payload too small".into()));
    }
    let _spec_major = cursor.get_u16();
    let _spec_minor = cursor.get_u16();
    let _device_mode = cursor.get_u32();
    let _device_class = cursor.get_u16();
    let _device_capability = cursor.get_u16();
    let mut mac = [0u8; 6];
    cursor.copy_to_slice(&mut mac);
    let _ip_config_options = cursor.get_u16();
    let _ip_config_current = cursor.get_u16();
    let ip = Ipv4Addr::from(cursor.get_u32());
    let _subnet = cursor.get_u32();
    let _gateway = cursor.get_u32();
    let manufacturer = read_fixed_string(&mut cursor, 32)?;
    let model = read_fixed_string(&mut cursor, 32)?;
    let _ = skip_string(&mut cursor, 32);
    let _ = skip_string(&mut cursor, 16);
    let _ = skip_string(&mut cursor, 16);

    Ok(DeviceInfo {
        ip,
        mac,
        manufacturer,
        model,
    })
}

fn read_fixed_string(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Option<String>, GvcpError> {
    if cursor.remaining() < len {
        return Err(GvcpError::Protocol("discovery string truncated".into()));
    }
    let mut buf = vec![0u8; len];
    cursor.copy_to_slice(&mut buf);
    Ok(parse_string(&buf))
}

fn skip_string(cursor: &mut Cursor<&[u8]>, len: usize) -> Option<()> {
    if cursor.remaining() < len {
        return None;
    }
    cursor.advance(len);
    Some(())
}

fn parse_string(bytes: &[u8]) -> Option<String> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let slice = &bytes[..end];
    let s = String::from_utf8_lossy(slice).trim().to_string();
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = GvcpHeader {
            flags: CommandFlags::ACK_REQUIRED,
            command: 0x1234,
            length: 4,
            request_id: 0xBEEF,
        };
        let payload = [1u8, 2, 3, 4];
        let encoded = header.encode(&payload);
        assert_eq!(encoded.len(), genicp::HEADER_SIZE + payload.len());
        assert_eq!(&encoded[0..2], &header.flags.bits().to_be_bytes());
        assert_eq!(&encoded[2..4], &header.command.to_be_bytes());
        assert_eq!(&encoded[4..6], &header.length.to_be_bytes());
        assert_eq!(&encoded[6..8], &header.request_id.to_be_bytes());
        assert_eq!(&encoded[8..], &payload);
    }

    #[test]
    fn parse_discovery_payload_roundtrip() {
        let mut buf = BytesMut::new();
        buf.put_u16(1); // spec major
        buf.put_u16(1); // spec minor
        buf.put_u32(0); // device mode
        buf.put_u16(0); // device class
        buf.put_u16(0); // capability
        buf.extend_from_slice(&[0x00, 0x0A, 0x35, 0x11, 0x22, 0x33]); // mac
        buf.put_u16(0); // ip config options
        buf.put_u16(0); // ip config current
        buf.put_u32(u32::from(Ipv4Addr::new(192, 168, 1, 10)));
        buf.put_u32(u32::from(Ipv4Addr::new(255, 255, 255, 0)));
        buf.put_u32(0);
        let mut manufacturer = vec![0u8; 32];
        manufacturer[..4].copy_from_slice(b"Acme");
        buf.extend_from_slice(&manufacturer);
        let mut model = vec![0u8; 32];
        model[..3].copy_from_slice(b"Cam");
        buf.extend_from_slice(&model);
        buf.extend_from_slice(&[0u8; 32]);
        buf.extend_from_slice(&[0u8; 16]);
        buf.extend_from_slice(&[0u8; 16]);

        let info = parse_discovery_payload(&buf).unwrap();
        assert_eq!(info.ip, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(info.mac, [0x00, 0x0A, 0x35, 0x11, 0x22, 0x33]);
        assert_eq!(info.manufacturer.as_deref(), Some("Acme"));
        assert_eq!(info.model.as_deref(), Some("Cam"));
        assert_eq!(info.mac_string(), "00:0A:35:11:22:33");
    }

    #[test]
    fn discovery_ack_rejects_foreign_request_id() {
        let ack = genicp::GenCpAck {
            header: genicp::AckHeader {
                status: genicp::StatusCode::Success,
                opcode: OpCode::Discovery,
                length: 0,
                request_id: 7,
            },
            payload: Bytes::new(),
        };
        let encoded = encode_test_ack(&ack);
        let result = parse_discovery_ack(&encoded, 9).unwrap();
        assert!(result.is_none());
    }

    fn encode_test_ack(ack: &genicp::GenCpAck) -> Bytes {
        let mut buf = BytesMut::with_capacity(genicp::HEADER_SIZE + ack.payload.len());
        buf.put_u16(ack.header.status.to_raw());
        buf.put_u16(ack.header.opcode.ack_code());
        buf.put_u16(ack.header.length);
        buf.put_u16(ack.header.request_id);
        buf.extend_from_slice(&ack.payload);
        buf.freeze()
    }
}
