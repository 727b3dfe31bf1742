//! GVSP wire codec: leader, payload, multipart, trailer and resend-request
//! packets, plus the stream destination/configuration types shared with
//! [`crate::stream`].
//!
//! Mirrors [`crate::gvcp`]'s split: this module only knows packet *shapes*;
//! reassembly and resend policy live in [`crate::stream`].

use std::net::{IpAddr, Ipv4Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use genicp::StatusCode;
use thiserror::Error;

use crate::nic::Iface;

/// Fixed length of a legacy (16-bit block id, 24-bit packet id) GVSP header.
pub const LEGACY_HEADER_LEN: usize = 8;
/// Fixed length of an extended (64-bit block id, 32-bit packet id) GVSP header.
pub const EXTENDED_HEADER_LEN: usize = 18;

/// Bit within the format byte selecting the extended header layout.
const EXTENDED_FLAG_BIT: u8 = 0x80;
const CONTENT_TYPE_MASK: u8 = 0x7F;

/// Errors raised while parsing or encoding GVSP packets.
#[derive(Debug, Error)]
pub enum GvspError {
    #[error("packet too short for its header")]
    Truncated,
    #[error("packet exceeds the maximum GVSP datagram size")]
    Oversized,
    #[error("unrecognized content type {0:#04x}")]
    UnknownContentType(u8),
    #[error("device reported error status {0:?}")]
    DeviceError(StatusCode),
    #[error("leader body malformed: {0}")]
    MalformedLeader(&'static str),
}

/// GVSP payload content type, carried in the low 7 bits of the format byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Leader,
    Payload,
    Trailer,
    AllIn,
    Multipart,
    /// Recognized but not implemented by this core: H.264 elementary stream.
    H264,
    /// Recognized but not implemented: GenDC container payload.
    GenDc,
    /// Recognized but not implemented: multi-zone sensor payload.
    MultiZone,
    Unknown(u8),
}

impl ContentType {
    fn from_code(code: u8) -> Self {
        match code {
            0x01 => ContentType::Leader,
            0x02 => ContentType::Trailer,
            0x03 => ContentType::Payload,
            0x04 => ContentType::AllIn,
            0x05 => ContentType::Multipart,
            0x06 => ContentType::H264,
            0x07 => ContentType::GenDc,
            0x08 => ContentType::MultiZone,
            other => ContentType::Unknown(other),
        }
    }

    const fn code(self) -> u8 {
        match self {
            ContentType::Leader => 0x01,
            ContentType::Trailer => 0x02,
            ContentType::Payload => 0x03,
            ContentType::AllIn => 0x04,
            ContentType::Multipart => 0x05,
            ContentType::H264 => 0x06,
            ContentType::GenDc => 0x07,
            ContentType::MultiZone => 0x08,
            ContentType::Unknown(code) => code,
        }
    }

    /// Whether the core implements reassembly for this content type.
    pub fn is_supported(self) -> bool {
        matches!(
            self,
            ContentType::Leader | ContentType::Trailer | ContentType::Payload | ContentType::AllIn | ContentType::Multipart
        )
    }
}

/// A decoded GVSP header, legacy or extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GvspHeader {
    /// Raw status field; non-zero signals an error packet (see [`GvspHeader::error`]).
    pub status: u16,
    pub content_type: ContentType,
    pub extended: bool,
    pub block_id: u64,
    pub packet_id: u32,
}

impl GvspHeader {
    /// Map a non-zero status into the device error it represents, if any.
    pub fn error(&self) -> Option<StatusCode> {
        if self.status == 0 {
            None
        } else {
            Some(StatusCode::from_raw(self.status))
        }
    }

    /// Byte length of this header once encoded.
    pub fn encoded_len(&self) -> usize {
        if self.extended {
            EXTENDED_HEADER_LEN
        } else {
            LEGACY_HEADER_LEN
        }
    }

    /// Encode the header (without payload) into a fresh buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u16(self.status);
        let format = self.content_type.code() | if self.extended { EXTENDED_FLAG_BIT } else { 0 };
        if self.extended {
            buf.put_u16(0); // flags, unused by this core
            buf.put_u8(format);
            buf.put_u8(0); // reserved
            buf.put_u64(self.block_id);
            buf.put_u32(self.packet_id);
        } else {
            buf.put_u16(self.block_id as u16);
            buf.put_u8(format);
            let id = self.packet_id & 0x00FF_FFFF;
            buf.put_u8((id >> 16) as u8);
            buf.put_u16(id as u16);
        }
        buf
    }
}

/// Decode a GVSP header from the front of `buf`, returning the header and the
/// number of bytes it occupied (the remainder is the packet body).
pub fn decode_header(buf: &[u8]) -> Result<(GvspHeader, usize), GvspError> {
    if buf.len() < LEGACY_HEADER_LEN {
        return Err(GvspError::Truncated);
    }
    let status = u16::from_be_bytes([buf[0], buf[1]]);
    let format = buf[4];
    let extended = format & EXTENDED_FLAG_BIT != 0;
    let content_type = ContentType::from_code(format & CONTENT_TYPE_MASK);

    if extended {
        if buf.len() < EXTENDED_HEADER_LEN {
            return Err(GvspError::Truncated);
        }
        let block_id = u64::from_be_bytes(buf[6..14].try_into().unwrap());
        let packet_id = u32::from_be_bytes(buf[14..18].try_into().unwrap());
        Ok((
            GvspHeader {
                status,
                content_type,
                extended,
                block_id,
                packet_id,
            },
            EXTENDED_HEADER_LEN,
        ))
    } else {
        let block_id = u16::from_be_bytes([buf[2], buf[3]]) as u64;
        let packet_id = ((buf[5] as u32) << 16) | u16::from_be_bytes([buf[6], buf[7]]) as u32;
        Ok((
            GvspHeader {
                status,
                content_type,
                extended,
                block_id,
                packet_id,
            },
            LEGACY_HEADER_LEN,
        ))
    }
}

/// Payload type carried in a leader packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderPayloadType {
    Image,
    Raw,
    ChunkedImage,
    ChunkData,
    Multipart,
    Jpeg,
    H264,
    Unknown(u16),
}

impl LeaderPayloadType {
    fn from_code(code: u16) -> Self {
        match code {
            0x0001 => LeaderPayloadType::Image,
            0x0002 => LeaderPayloadType::Raw,
            0x0003 => LeaderPayloadType::ChunkedImage,
            0x0004 => LeaderPayloadType::ChunkData,
            0x0005 => LeaderPayloadType::Multipart,
            0x0006 => LeaderPayloadType::Jpeg,
            0x0007 => LeaderPayloadType::H264,
            other => LeaderPayloadType::Unknown(other),
        }
    }

    const fn code(self) -> u16 {
        match self {
            LeaderPayloadType::Image => 0x0001,
            LeaderPayloadType::Raw => 0x0002,
            LeaderPayloadType::ChunkedImage => 0x0003,
            LeaderPayloadType::ChunkData => 0x0004,
            LeaderPayloadType::Multipart => 0x0005,
            LeaderPayloadType::Jpeg => 0x0006,
            LeaderPayloadType::H264 => 0x0007,
            LeaderPayloadType::Unknown(code) => code,
        }
    }
}

/// Single-image geometry descriptor carried by an image-payload leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub pixel_format: u32,
    pub width: u32,
    pub height: u32,
    pub x_offset: u32,
    pub y_offset: u32,
    pub x_padding: u32,
    pub y_padding: u32,
}

/// Per-part geometry descriptor carried by a multipart leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartDescriptor {
    pub component_id: u16,
    pub data_type: u16,
    pub size: u64,
    pub pixel_format: u32,
    pub width: u32,
    pub height: u32,
    pub x_offset: u32,
    pub y_offset: u32,
}

/// Leader-carried descriptor, shaped by the payload type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaderDescriptor {
    Image(ImageDescriptor),
    Multipart(Vec<PartDescriptor>),
    /// Payload type this core doesn't interpret geometry for (chunk data, JPEG, ...).
    Opaque,
}

/// Decoded body of a leader packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderBody {
    pub payload_type: LeaderPayloadType,
    pub timestamp_ticks: u64,
    pub descriptor: LeaderDescriptor,
}

/// Decode a leader packet body (the bytes following the GVSP header).
pub fn decode_leader(body: &[u8]) -> Result<LeaderBody, GvspError> {
    let mut cursor = body;
    if cursor.remaining() < 2 + 2 + 2 + 8 {
        return Err(GvspError::MalformedLeader("header too short"));
    }
    let _reserved = cursor.get_u16();
    let payload_type = LeaderPayloadType::from_code(cursor.get_u16());
    let _reserved2 = cursor.get_u16();
    let timestamp_ticks = cursor.get_u64();

    let descriptor = match payload_type {
        LeaderPayloadType::Image | LeaderPayloadType::ChunkedImage => {
            if cursor.remaining() < 28 {
                return Err(GvspError::MalformedLeader("image descriptor too short"));
            }
            LeaderDescriptor::Image(ImageDescriptor {
                pixel_format: cursor.get_u32(),
                width: cursor.get_u32(),
                height: cursor.get_u32(),
                x_offset: cursor.get_u32(),
                y_offset: cursor.get_u32(),
                x_padding: cursor.get_u32(),
                y_padding: cursor.get_u32(),
            })
        }
        LeaderPayloadType::Multipart => {
            if cursor.remaining() < 2 {
                return Err(GvspError::MalformedLeader("multipart count missing"));
            }
            let n_parts = cursor.get_u16() as usize;
            let mut parts = Vec::with_capacity(n_parts);
            for _ in 0..n_parts {
                if cursor.remaining() < 28 {
                    return Err(GvspError::MalformedLeader("part descriptor truncated"));
                }
                parts.push(PartDescriptor {
                    component_id: cursor.get_u16(),
                    data_type: cursor.get_u16(),
                    size: cursor.get_u64(),
                    pixel_format: cursor.get_u32(),
                    width: cursor.get_u32(),
                    height: cursor.get_u32(),
                    x_offset: cursor.get_u16() as u32,
                    y_offset: cursor.get_u16() as u32,
                });
            }
            LeaderDescriptor::Multipart(parts)
        }
        _ => LeaderDescriptor::Opaque,
    };

    Ok(LeaderBody {
        payload_type,
        timestamp_ticks,
        descriptor,
    })
}

/// A host-issued request to retransmit a contiguous run of packets from a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendRequest {
    pub block_id: u64,
    pub first_packet_id: u32,
    pub last_packet_id: u32,
}

impl ResendRequest {
    /// Encode the resend command body, using the id width matching `extended`.
    pub fn encode(&self, extended: bool) -> Bytes {
        let mut buf = BytesMut::new();
        if extended {
            buf.put_u64(self.block_id);
            buf.put_u32(self.first_packet_id);
            buf.put_u32(self.last_packet_id);
        } else {
            buf.put_u16(self.block_id as u16);
            buf.put_u16(self.first_packet_id as u16);
            buf.put_u16(self.last_packet_id as u16);
        }
        buf.freeze()
    }
}

/// Where a stream's GVSP datagrams should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDest {
    Unicast {
        dst_ip: Ipv4Addr,
        dst_port: u16,
    },
    Multicast {
        group: Ipv4Addr,
        port: u16,
        loopback: bool,
        ttl: u32,
    },
}

impl StreamDest {
    pub fn addr(&self) -> Ipv4Addr {
        match self {
            StreamDest::Unicast { dst_ip, .. } => *dst_ip,
            StreamDest::Multicast { group, .. } => *group,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            StreamDest::Unicast { dst_port, .. } => *dst_port,
            StreamDest::Multicast { port, .. } => *port,
        }
    }

    pub fn is_multicast(&self) -> bool {
        matches!(self, StreamDest::Multicast { .. })
    }
}

/// Fully-resolved configuration for a single GVSP stream, handed to the
/// receiver once negotiation (interface, destination, packet size) is done.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub dest: StreamDest,
    pub iface: Iface,
    pub packet_size: Option<u32>,
    pub packet_delay: Option<u32>,
    /// When set, packets not originating from this source are dropped (unicast only).
    pub source_filter: Option<IpAddr>,
    pub resend_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_header_round_trips() {
        let header = GvspHeader {
            status: 0,
            content_type: ContentType::Payload,
            extended: false,
            block_id: 0x1234,
            packet_id: 0x00AB_CDEF & 0x00FF_FFFF,
        };
        let encoded = header.encode();
        let (decoded, len) = decode_header(&encoded).unwrap();
        assert_eq!(len, LEGACY_HEADER_LEN);
        assert_eq!(decoded, header);
    }

    #[test]
    fn extended_header_round_trips() {
        let header = GvspHeader {
            status: 0,
            content_type: ContentType::Trailer,
            extended: true,
            block_id: 0xDEAD_BEEF_0000_0001,
            packet_id: 42,
        };
        let encoded = header.encode();
        let (decoded, len) = decode_header(&encoded).unwrap();
        assert_eq!(len, EXTENDED_HEADER_LEN);
        assert_eq!(decoded, header);
    }

    #[test]
    fn extended_flag_selects_layout() {
        let legacy = GvspHeader {
            status: 0,
            content_type: ContentType::Leader,
            extended: false,
            block_id: 1,
            packet_id: 0,
        };
        let extended = GvspHeader { extended: true, ..legacy };
        assert!(!decode_header(&legacy.encode()).unwrap().0.extended);
        assert!(decode_header(&extended.encode()).unwrap().0.extended);
    }

    #[test]
    fn short_packet_is_truncated() {
        let buf = [0u8; 4];
        assert!(matches!(decode_header(&buf), Err(GvspError::Truncated)));
    }

    #[test]
    fn unknown_content_type_preserves_code() {
        assert_eq!(ContentType::from_code(0x7F).code(), 0x7F);
        assert!(!ContentType::from_code(0x7F).is_supported());
    }

    #[test]
    fn decode_image_leader() {
        let mut body = BytesMut::new();
        body.put_u16(0); // reserved
        body.put_u16(LeaderPayloadType::Image.code());
        body.put_u16(0); // reserved2
        body.put_u64(0x1122_3344_5566_7788);
        body.put_u32(0x1234_5678); // pixel format
        body.put_u32(640);
        body.put_u32(480);
        body.put_u32(0);
        body.put_u32(0);
        body.put_u32(0);
        body.put_u32(0);
        let leader = decode_leader(&body).unwrap();
        assert_eq!(leader.payload_type, LeaderPayloadType::Image);
        assert_eq!(leader.timestamp_ticks, 0x1122_3344_5566_7788);
        match leader.descriptor {
            LeaderDescriptor::Image(desc) => {
                assert_eq!(desc.width, 640);
                assert_eq!(desc.height, 480);
            }
            _ => panic!("expected image descriptor"),
        }
    }

    #[test]
    fn resend_request_encodes_legacy_width() {
        let req = ResendRequest {
            block_id: 7,
            first_packet_id: 6,
            last_packet_id: 6,
        };
        let encoded = req.encode(false);
        assert_eq!(encoded.len(), 6);
        assert_eq!(&encoded[0..2], &7u16.to_be_bytes());
    }

    #[test]
    fn stream_dest_reports_multicast() {
        let dest = StreamDest::Multicast {
            group: Ipv4Addr::new(239, 1, 1, 1),
            port: 5000,
            loopback: false,
            ttl: 4,
        };
        assert!(dest.is_multicast());
        assert_eq!(dest.port(), 5000);
    }
}
