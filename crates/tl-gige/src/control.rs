//! Retrying, fragmenting GVCP request/reply engine.
//!
//! [`gvcp`](crate::gvcp) only knows the packet shape; this module owns the
//! single-socket, single-transaction-at-a-time conversation with a device,
//! including pending-ack deadline extension and `DATA_SIZE_MAX` fragmentation
//! of block reads/writes.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use genicp::{AckOrPending, CommandFlags, CommandHeader, GenCpAck, GenCpCmd, GenCpError, OpCode, StatusCode};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{trace, warn};

use crate::consts::{DATA_SIZE_MAX, GVCP_TIMEOUT, N_RETRIES};

/// Errors that can occur while running a GVCP control transaction.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("gencp: {0}")]
    GenCp(#[from] GenCpError),
    #[error("device returned {0:?}")]
    Status(StatusCode),
    #[error("transaction timed out after {0} attempts")]
    Timeout(u32),
    #[error("unexpected opcode in reply: {0:?}")]
    UnexpectedOpcode(OpCode),
}

/// Single-transaction-at-a-time GVCP control channel.
///
/// A device only ever processes one pending control request, so every
/// transaction takes an internal lock for its whole retry/pending-ack
/// lifetime; concurrent callers simply queue behind it, mirroring how a real
/// device handles overlapping requests.
pub struct ControlSocket {
    socket: UdpSocket,
    peer: SocketAddr,
    next_request_id: Mutex<u16>,
    inflight: Mutex<()>,
}

impl ControlSocket {
    /// Bind an ephemeral local socket and connect it to `peer`'s GVCP port.
    pub async fn connect(peer: SocketAddr) -> Result<Self, ControlError> {
        let bind_addr: SocketAddr = if peer.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(peer).await?;
        Ok(Self {
            socket,
            peer,
            next_request_id: Mutex::new(1),
            inflight: Mutex::new(()),
        })
    }

    async fn next_id(&self) -> u16 {
        let mut id = self.next_request_id.lock().await;
        let value = *id;
        *id = if *id == u16::MAX { 1 } else { *id + 1 };
        value
    }

    /// Run one request/reply transaction: send, wait for the ack, retry on
    /// timeout up to [`N_RETRIES`] times, and extend the deadline whenever
    /// the device answers with a pending-ack instead.
    pub async fn transact(&self, opcode: OpCode, payload: Bytes) -> Result<GenCpAck, ControlError> {
        let _guard = self.inflight.lock().await;
        let request_id = self.next_id().await;
        let cmd = GenCpCmd {
            header: CommandHeader {
                flags: CommandFlags::ACK_REQUIRED,
                opcode,
                length: payload.len() as u16,
                request_id,
            },
            payload,
        };
        let wire = genicp::encode_cmd(&cmd);

        let mut attempt = 0u32;
        let mut deadline = GVCP_TIMEOUT;
        self.socket.send(&wire).await?;
        loop {
            let mut buf = [0u8; 2048];
            match timeout(deadline, self.socket.recv(&mut buf)).await {
                Ok(Ok(n)) => match genicp::decode_ack(&buf[..n]) {
                    Ok(AckOrPending::Pending(p)) if p.request_id == request_id => {
                        trace!(request_id, extra_ms = p.timeout_ms, "pending ack, extending deadline without retrying");
                        deadline = Duration::from_millis(p.timeout_ms as u64);
                        continue;
                    }
                    Ok(AckOrPending::Ack(ack)) if ack.header.request_id != request_id => {
                        trace!(request_id, got = ack.header.request_id, "stray ack, ignoring");
                        continue;
                    }
                    Ok(AckOrPending::Ack(ack)) if ack.header.opcode != opcode => {
                        trace!(request_id, got = ?ack.header.opcode, expected = ?opcode, "ack with unexpected opcode, still waiting");
                        continue;
                    }
                    Ok(AckOrPending::Ack(ack)) => {
                        if ack.header.status != StatusCode::Success {
                            return Err(ControlError::Status(ack.header.status));
                        }
                        return Ok(ack);
                    }
                    Ok(AckOrPending::Pending(_)) => continue,
                    Err(_) => continue,
                },
                Ok(Err(e)) => return Err(e.into()),
                Err(_elapsed) => {
                    attempt += 1;
                    if attempt > N_RETRIES {
                        return Err(ControlError::Timeout(attempt));
                    }
                    warn!(request_id, attempt, "gvcp transaction timed out, retrying");
                    self.socket.send(&wire).await?;
                    deadline = GVCP_TIMEOUT;
                }
            }
        }
    }

    /// Read a single 32-bit register.
    pub async fn read_register(&self, address: u64) -> Result<u32, ControlError> {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(address as u32);
        let ack = self.transact(OpCode::ReadReg, payload.freeze()).await?;
        if ack.payload.len() < 4 {
            return Err(ControlError::GenCp(GenCpError::InvalidPacket("short register read reply")));
        }
        Ok((&ack.payload[..4]).get_u32())
    }

    /// Write a single 32-bit register.
    pub async fn write_register(&self, address: u64, value: u32) -> Result<(), ControlError> {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32(address as u32);
        payload.put_u32(value);
        self.transact(OpCode::WriteReg, payload.freeze()).await?;
        Ok(())
    }

    /// Read an arbitrary-length memory block, fragmenting into
    /// [`DATA_SIZE_MAX`]-sized `READ_MEMORY` transactions.
    pub async fn read_memory(&self, address: u64, len: usize) -> Result<Bytes, ControlError> {
        let mut out = BytesMut::with_capacity(len);
        let mut offset = 0usize;
        while offset < len {
            let chunk = (len - offset).min(DATA_SIZE_MAX);
            let mut payload = BytesMut::with_capacity(8);
            payload.put_u32((address + offset as u64) as u32);
            payload.put_u32(chunk as u32);
            let ack = self.transact(OpCode::ReadMem, payload.freeze()).await?;
            let take = chunk.min(ack.payload.len());
            out.extend_from_slice(&ack.payload[..take]);
            offset += chunk;
        }
        Ok(out.freeze())
    }

    /// Write an arbitrary-length memory block, fragmenting into
    /// [`DATA_SIZE_MAX`]-sized `WRITE_MEMORY` transactions.
    pub async fn write_memory(&self, address: u64, data: &[u8]) -> Result<(), ControlError> {
        let mut offset = 0usize;
        while offset < data.len() {
            let chunk = (data.len() - offset).min(DATA_SIZE_MAX);
            let mut payload = BytesMut::with_capacity(4 + chunk);
            payload.put_u32((address + offset as u64) as u32);
            payload.extend_from_slice(&data[offset..offset + chunk]);
            self.transact(OpCode::WriteMem, payload.freeze()).await?;
            offset += chunk;
        }
        Ok(())
    }

    /// Address of the peer device this channel talks to.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send a packet-resend request without waiting for (or expecting) an
    /// acknowledgement.
    ///
    /// Used by [`crate::stream`], which cannot afford to block behind the
    /// single-outstanding-transaction discipline [`ControlSocket::transact`]
    /// enforces: resend requests are latency-sensitive and best-effort.
    pub(crate) async fn send_resend_request(&self, payload: Bytes) -> Result<(), ControlError> {
        let request_id = self.next_id().await;
        let cmd = GenCpCmd {
            header: CommandHeader {
                flags: CommandFlags::empty(),
                opcode: OpCode::PacketResend,
                length: payload.len() as u16,
                request_id,
            },
            payload,
        };
        let wire = genicp::encode_cmd(&cmd);
        self.socket.send(&wire).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genicp::{AckHeader, GenCpAck};
    use tokio::net::UdpSocket as TokioUdpSocket;

    async fn fake_device(socket: TokioUdpSocket, register_value: u32) {
        let mut buf = [0u8; 1024];
        let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
        let cmd = &buf[..n];
        let request_id = u16::from_be_bytes([cmd[6], cmd[7]]);
        let opcode = OpCode::from_command(u16::from_be_bytes([cmd[2], cmd[3]])).unwrap();
        let mut payload = BytesMut::new();
        payload.put_u32(register_value);
        let ack = GenCpAck {
            header: AckHeader {
                status: StatusCode::Success,
                opcode,
                length: payload.len() as u16,
                request_id,
            },
            payload: payload.freeze(),
        };
        let wire = encode_ack(&ack);
        socket.send_to(&wire, peer).await.unwrap();
    }

    fn encode_ack(ack: &GenCpAck) -> Bytes {
        let mut buf = BytesMut::with_capacity(genicp::HEADER_SIZE + ack.payload.len());
        buf.put_u16(ack.header.status.to_raw());
        buf.put_u16(ack.header.opcode.ack_code());
        buf.put_u16(ack.header.length);
        buf.put_u16(ack.header.request_id);
        buf.extend_from_slice(&ack.payload);
        buf.freeze()
    }

    #[tokio::test]
    async fn read_register_round_trips_over_loopback() {
        let device_socket = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device_socket.local_addr().unwrap();
        tokio::spawn(fake_device(device_socket, 0xDEAD_BEEF));

        let control = ControlSocket::connect(device_addr).await.unwrap();
        let value = control.read_register(0x0014).await.unwrap();
        assert_eq!(value, 0xDEAD_BEEF);
    }

    #[tokio::test]
    async fn timeout_surfaces_after_retries_exhausted() {
        let device_socket = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device_socket.local_addr().unwrap();
        // Never reply; the control channel must give up after N_RETRIES.
        let control = ControlSocket::connect(device_addr).await.unwrap();
        let err = control.read_register(0x0014).await.unwrap_err();
        assert!(matches!(err, ControlError::Timeout(_)));
        drop(device_socket);
    }
}
