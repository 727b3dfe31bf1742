//! GenCP/GVCP: transport-agnostic control-protocol encode/decode and status mapping.
//!
//! This crate only knows how to turn the fixed 8-byte GVCP header plus a
//! command-specific body into bytes and back. It never touches a socket and
//! never retries; that belongs to the transport (`tl-gige::control`).

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the GVCP header (in bytes).
pub const HEADER_SIZE: usize = 8;

bitflags! {
    /// Flags carried in the command-flags byte of a GVCP command packet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandFlags: u16 {
        /// Request an acknowledgement for this command.
        const ACK_REQUIRED = 0x0001;
        /// Mark the command as a broadcast.
        const BROADCAST = 0x8000;
    }
}

/// GVCP operation codes used by the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Device discovery.
    Discovery,
    /// Read a 32-bit-aligned register.
    ReadReg,
    /// Write a 32-bit-aligned register.
    WriteReg,
    /// Read an arbitrary-length memory block.
    ReadMem,
    /// Write an arbitrary-length memory block.
    WriteMem,
    /// Request retransmission of a packet range.
    PacketResend,
}

impl OpCode {
    /// Raw command value as defined by the GigE Vision / GenCP specification.
    pub const fn command_code(self) -> u16 {
        match self {
            OpCode::Discovery => 0x0002,
            OpCode::ReadReg => 0x0080,
            OpCode::WriteReg => 0x0082,
            OpCode::ReadMem => 0x0084,
            OpCode::WriteMem => 0x0086,
            OpCode::PacketResend => 0x0040,
        }
    }

    /// Raw acknowledgement value as defined by the specification.
    pub const fn ack_code(self) -> u16 {
        match self {
            OpCode::Discovery => 0x0003,
            OpCode::PacketResend => 0x0041,
            _ => self.command_code() + 1,
        }
    }

    /// Resolve the opcode that a command-code value belongs to.
    pub fn from_command(code: u16) -> Result<Self, GenCpError> {
        match code {
            0x0002 => Ok(OpCode::Discovery),
            0x0080 => Ok(OpCode::ReadReg),
            0x0082 => Ok(OpCode::WriteReg),
            0x0084 => Ok(OpCode::ReadMem),
            0x0086 => Ok(OpCode::WriteMem),
            0x0040 => Ok(OpCode::PacketResend),
            _ => Err(GenCpError::UnknownOpcode(code)),
        }
    }

    /// Resolve the opcode that an ack-code value belongs to.
    pub fn from_ack(code: u16) -> Result<Self, GenCpError> {
        match code {
            0x0003 => Ok(OpCode::Discovery),
            0x0081 => Ok(OpCode::ReadReg),
            0x0083 => Ok(OpCode::WriteReg),
            0x0085 => Ok(OpCode::ReadMem),
            0x0087 => Ok(OpCode::WriteMem),
            0x0041 => Ok(OpCode::PacketResend),
            _ => Err(GenCpError::UnknownOpcode(code)),
        }
    }
}

/// GVCP packet kind, carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// A command sent by the host.
    Cmd,
    /// A successful acknowledgement.
    Ack,
    /// An acknowledgement carrying a recognized error status.
    ErrorAck,
    /// An acknowledgement carrying a status this crate does not recognize.
    UnknownErrorAck,
}

/// GVCP acknowledgement status codes (GigE Vision spec, table "Status codes").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    NotImplemented,
    InvalidParameter,
    InvalidAddress,
    WriteProtect,
    BadAlignment,
    AccessDenied,
    Busy,
    PacketUnavailable,
    PacketAndPreviousRemovedFromMemory,
    PacketRemovedFromMemory,
    Error,
    Unknown(u16),
}

impl StatusCode {
    /// Convert from the raw status field in an acknowledgement header.
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0x0000 => StatusCode::Success,
            0x8001 => StatusCode::NotImplemented,
            0x8002 => StatusCode::InvalidParameter,
            0x8003 => StatusCode::InvalidAddress,
            0x8004 => StatusCode::WriteProtect,
            0x8005 => StatusCode::BadAlignment,
            0x8006 => StatusCode::AccessDenied,
            0x8007 => StatusCode::Busy,
            0x800C => StatusCode::PacketUnavailable,
            0x8011 => StatusCode::PacketAndPreviousRemovedFromMemory,
            0x8012 => StatusCode::PacketRemovedFromMemory,
            0x8FFF => StatusCode::Error,
            other => StatusCode::Unknown(other),
        }
    }

    /// Convert to the raw value stored in the packet header.
    pub const fn to_raw(self) -> u16 {
        match self {
            StatusCode::Success => 0x0000,
            StatusCode::NotImplemented => 0x8001,
            StatusCode::InvalidParameter => 0x8002,
            StatusCode::InvalidAddress => 0x8003,
            StatusCode::WriteProtect => 0x8004,
            StatusCode::BadAlignment => 0x8005,
            StatusCode::AccessDenied => 0x8006,
            StatusCode::Busy => 0x8007,
            StatusCode::PacketUnavailable => 0x800C,
            StatusCode::PacketAndPreviousRemovedFromMemory => 0x8011,
            StatusCode::PacketRemovedFromMemory => 0x8012,
            StatusCode::Error => 0x8FFF,
            StatusCode::Unknown(code) => code,
        }
    }

    /// Opcode of the pending-acknowledgement packet type (not a status, but
    /// shares the same header shape with the timeout-ms value in the body).
    pub const PENDING_ACK_CODE: u16 = 0x0089;

    fn packet_type(self) -> PacketType {
        match self {
            StatusCode::Success => PacketType::Ack,
            StatusCode::Unknown(_) => PacketType::UnknownErrorAck,
            _ => PacketType::ErrorAck,
        }
    }
}

/// Errors that can occur when dealing with GVCP/GenCP packets.
#[derive(Debug, Error)]
pub enum GenCpError {
    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),
    #[error("unknown opcode: {0:#06x}")]
    UnknownOpcode(u16),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Command header for GVCP requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    /// Request flags (ack required, broadcast, …).
    pub flags: CommandFlags,
    /// Operation code for the request.
    pub opcode: OpCode,
    /// Length of the payload in bytes.
    pub length: u16,
    /// Request identifier chosen by the client.
    pub request_id: u16,
}

/// Header for GVCP acknowledgements, including pending-acks and error-acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckHeader {
    /// Status returned by the device.
    pub status: StatusCode,
    /// Operation code associated with the acknowledgement.
    pub opcode: OpCode,
    /// Length of the payload in bytes.
    pub length: u16,
    /// Request identifier that this acknowledgement answers.
    pub request_id: u16,
}

/// GVCP command packet.
#[derive(Debug, Clone)]
pub struct GenCpCmd {
    /// Packet header fields.
    pub header: CommandHeader,
    /// Command payload.
    pub payload: Bytes,
}

/// GVCP acknowledgement packet.
#[derive(Debug, Clone)]
pub struct GenCpAck {
    /// Header fields returned by the device.
    pub header: AckHeader,
    /// Payload data (command specific).
    pub payload: Bytes,
}

/// A pending-acknowledgement: the device asks for more time before the real
/// ack arrives, carrying the additional wait budget in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAck {
    /// Request identifier this pending-ack extends.
    pub request_id: u16,
    /// Extra time, in milliseconds, the host should wait before retrying.
    pub timeout_ms: u16,
}

/// Either a normal/error acknowledgement, or a pending-ack asking for more time.
#[derive(Debug, Clone)]
pub enum AckOrPending {
    Ack(GenCpAck),
    Pending(PendingAck),
}

/// Encode a GVCP command into the on-the-wire representation.
pub fn encode_cmd(cmd: &GenCpCmd) -> Bytes {
    debug_assert_eq!(cmd.header.length as usize, cmd.payload.len());
    let mut buffer = BytesMut::with_capacity(HEADER_SIZE + cmd.payload.len());
    buffer.put_u16(cmd.header.flags.bits());
    buffer.put_u16(cmd.header.opcode.command_code());
    buffer.put_u16(cmd.header.length);
    buffer.put_u16(cmd.header.request_id);
    buffer.extend_from_slice(&cmd.payload);
    buffer.freeze()
}

/// Decode a GVCP acknowledgement from raw bytes, recognizing pending-acks.
pub fn decode_ack(buf: &[u8]) -> Result<AckOrPending, GenCpError> {
    if buf.len() < HEADER_SIZE {
        return Err(GenCpError::InvalidPacket("too short"));
    }
    let mut cursor = buf;
    let status_raw = cursor.get_u16();
    let opcode_raw = cursor.get_u16();
    let length = cursor.get_u16();
    let request_id = cursor.get_u16();

    let expected = HEADER_SIZE + length as usize;
    if buf.len() != expected {
        return Err(GenCpError::InvalidPacket("length mismatch"));
    }

    if opcode_raw == StatusCode::PENDING_ACK_CODE {
        if length != 2 {
            return Err(GenCpError::InvalidPacket("pending-ack body size mismatch"));
        }
        let mut body = &buf[HEADER_SIZE..];
        let timeout_ms = body.get_u16();
        return Ok(AckOrPending::Pending(PendingAck {
            request_id,
            timeout_ms,
        }));
    }

    let opcode = OpCode::from_ack(opcode_raw)?;
    let status = StatusCode::from_raw(status_raw);
    let _ = status.packet_type();

    let payload = Bytes::copy_from_slice(&buf[HEADER_SIZE..]);
    Ok(AckOrPending::Ack(GenCpAck {
        header: AckHeader {
            status,
            opcode,
            length,
            request_id,
        },
        payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_read_mem_roundtrip() {
        let payload = {
            let mut p = BytesMut::with_capacity(12);
            p.put_u64(0x0010_0200);
            p.put_u32(64);
            p.freeze()
        };
        let cmd = GenCpCmd {
            header: CommandHeader {
                flags: CommandFlags::ACK_REQUIRED,
                opcode: OpCode::ReadMem,
                length: payload.len() as u16,
                request_id: 0x42,
            },
            payload,
        };

        let encoded = encode_cmd(&cmd);
        assert_eq!(
            &encoded[..2],
            &CommandFlags::ACK_REQUIRED.bits().to_be_bytes()
        );
        assert_eq!(&encoded[2..4], &0x0084u16.to_be_bytes());
        assert_eq!(&encoded[4..6], &(cmd.payload.len() as u16).to_be_bytes());
        assert_eq!(&encoded[6..8], &0x0042u16.to_be_bytes());
        assert_eq!(&encoded[8..], &cmd.payload[..]);
    }

    #[test]
    fn decode_read_mem_ack() {
        let payload = vec![0xAA; 4];
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_u16(0x0000);
        buf.put_u16(0x0085);
        buf.put_u16(payload.len() as u16);
        buf.put_u16(0x4242);
        buf.extend_from_slice(&payload);

        let ack = match decode_ack(&buf).expect("decode") {
            AckOrPending::Ack(ack) => ack,
            AckOrPending::Pending(_) => panic!("expected ack"),
        };
        assert_eq!(ack.header.status, StatusCode::Success);
        assert_eq!(ack.header.opcode, OpCode::ReadMem);
        assert_eq!(ack.header.length as usize, payload.len());
        assert_eq!(ack.header.request_id, 0x4242);
        assert_eq!(&ack.payload[..], &payload[..]);
    }

    #[test]
    fn decode_write_reg_ack() {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_u16(0x0000);
        buf.put_u16(0x0083);
        buf.put_u16(0);
        buf.put_u16(0x1001);
        let ack = match decode_ack(&buf).expect("decode") {
            AckOrPending::Ack(ack) => ack,
            AckOrPending::Pending(_) => panic!("expected ack"),
        };
        assert_eq!(ack.header.opcode, OpCode::WriteReg);
        assert_eq!(ack.header.status, StatusCode::Success);
        assert_eq!(ack.payload.len(), 0);
    }

    #[test]
    fn decode_pending_ack() {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 2);
        buf.put_u16(0x0000);
        buf.put_u16(StatusCode::PENDING_ACK_CODE);
        buf.put_u16(2);
        buf.put_u16(0x55AA);
        buf.put_u16(500);
        let pending = match decode_ack(&buf).expect("decode") {
            AckOrPending::Pending(p) => p,
            AckOrPending::Ack(_) => panic!("expected pending ack"),
        };
        assert_eq!(pending.request_id, 0x55AA);
        assert_eq!(pending.timeout_ms, 500);
    }

    #[test]
    fn decode_error_ack_write_protect() {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_u16(StatusCode::WriteProtect.to_raw());
        buf.put_u16(0x0083);
        buf.put_u16(0);
        buf.put_u16(0x0010);
        let ack = match decode_ack(&buf).expect("decode") {
            AckOrPending::Ack(ack) => ack,
            AckOrPending::Pending(_) => panic!("expected ack"),
        };
        assert_eq!(ack.header.status, StatusCode::WriteProtect);
    }

    #[test]
    fn status_round_trip() {
        for status in [
            StatusCode::Success,
            StatusCode::NotImplemented,
            StatusCode::InvalidParameter,
            StatusCode::InvalidAddress,
            StatusCode::WriteProtect,
            StatusCode::BadAlignment,
            StatusCode::AccessDenied,
            StatusCode::Busy,
            StatusCode::PacketUnavailable,
            StatusCode::PacketAndPreviousRemovedFromMemory,
            StatusCode::PacketRemovedFromMemory,
            StatusCode::Error,
        ] {
            assert_eq!(StatusCode::from_raw(status.to_raw()), status);
        }
    }
}
