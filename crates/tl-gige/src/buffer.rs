//! Buffer data model: the fixed-capacity regions the stream receiver fills
//! and the consumer drains, plus their part/geometry metadata.

use bytes::BytesMut;

use crate::gvsp::LeaderPayloadType;

/// Lifecycle status of a [`Buffer`] once it leaves the input FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// Currently being filled by the receiver.
    Filling,
    /// All expected packets arrived; `received_size` is authoritative.
    Success,
    /// `frame_retention` elapsed before the frame completed.
    Timeout,
    /// The receiver (or consumer) cancelled reception.
    Aborted,
    /// Resend was disabled or exhausted and packets never arrived.
    MissingPackets,
    /// A packet carried an id outside the frame's expected range.
    WrongPacketId,
    /// The leader announced a payload type this core does not reassemble.
    PayloadNotSupported,
}

/// Geometry and placement of one data region within a [`Buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Part {
    pub offset: usize,
    pub component_id: u16,
    pub part_type: u16,
    pub pixel_format: u32,
    pub width: u32,
    pub height: u32,
    pub x_offset: u32,
    pub y_offset: u32,
    pub x_padding: u32,
    pub y_padding: u32,
    pub size: usize,
}

/// A fixed-capacity byte region handed to the receiver by the consumer, and
/// returned filled (or marked failed) on the output FIFO.
#[derive(Debug, Clone)]
pub struct Buffer {
    data: BytesMut,
    received_size: usize,
    status: BufferStatus,
    payload_type: Option<LeaderPayloadType>,
    frame_id: u64,
    timestamp_dev_ns: u64,
    timestamp_system_ns: u64,
    big_endian: bool,
    parts: Vec<Part>,
}

impl Buffer {
    /// Allocate a new buffer of `capacity` bytes, ready to be pushed onto the
    /// input FIFO.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::zeroed(capacity),
            received_size: 0,
            status: BufferStatus::Filling,
            payload_type: None,
            frame_id: 0,
            timestamp_dev_ns: 0,
            timestamp_system_ns: 0,
            big_endian: false,
            parts: Vec::new(),
        }
    }

    /// Reset all per-frame state so the buffer can be reused for a new frame.
    pub(crate) fn reset_for_frame(&mut self, frame_id: u64) {
        self.received_size = 0;
        self.status = BufferStatus::Filling;
        self.payload_type = None;
        self.frame_id = frame_id;
        self.timestamp_dev_ns = 0;
        self.timestamp_system_ns = 0;
        self.big_endian = false;
        self.parts.clear();
    }

    pub fn allocated_size(&self) -> usize {
        self.data.len()
    }

    pub fn received_size(&self) -> usize {
        self.received_size
    }

    pub fn status(&self) -> BufferStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: BufferStatus) {
        self.status = status;
    }

    pub fn payload_type(&self) -> Option<LeaderPayloadType> {
        self.payload_type
    }

    pub(crate) fn set_payload_type(&mut self, payload_type: LeaderPayloadType) {
        self.payload_type = Some(payload_type);
    }

    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    pub fn timestamp_dev_ns(&self) -> u64 {
        self.timestamp_dev_ns
    }

    pub(crate) fn set_timestamp_dev_ns(&mut self, ts: u64) {
        self.timestamp_dev_ns = ts;
    }

    pub fn timestamp_system_ns(&self) -> u64 {
        self.timestamp_system_ns
    }

    pub(crate) fn set_timestamp_system_ns(&mut self, ts: u64) {
        self.timestamp_system_ns = ts;
    }

    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    pub(crate) fn set_big_endian(&mut self, value: bool) {
        self.big_endian = value;
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub(crate) fn push_part(&mut self, part: Part) {
        self.parts.push(part);
    }

    /// Borrow the whole data region, including bytes not yet written.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Copy `bytes` into the buffer at `offset`, clamping to the allocated
    /// region and reporting whether the write was truncated (size mismatch).
    pub(crate) fn write_at(&mut self, offset: usize, bytes: &[u8]) -> bool {
        if offset >= self.data.len() {
            return true;
        }
        let end = (offset + bytes.len()).min(self.data.len());
        let truncated = end - offset < bytes.len();
        self.data[offset..end].copy_from_slice(&bytes[..end - offset]);
        self.received_size += end - offset;
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_buffer_starts_filling_and_empty() {
        let buf = Buffer::new(64);
        assert_eq!(buf.allocated_size(), 64);
        assert_eq!(buf.received_size(), 0);
        assert_eq!(buf.status(), BufferStatus::Filling);
    }

    #[test]
    fn write_at_clamps_to_capacity_and_reports_truncation() {
        let mut buf = Buffer::new(4);
        assert!(!buf.write_at(0, &[1, 2, 3, 4]));
        assert_eq!(buf.received_size(), 4);
        let mut buf = Buffer::new(4);
        assert!(buf.write_at(2, &[1, 2, 3, 4]));
        assert_eq!(buf.data(), &[0, 0, 1, 2]);
    }

    #[test]
    fn reset_for_frame_clears_prior_state() {
        let mut buf = Buffer::new(4);
        buf.write_at(0, &[9, 9, 9, 9]);
        buf.set_status(BufferStatus::Success);
        buf.reset_for_frame(7);
        assert_eq!(buf.received_size(), 0);
        assert_eq!(buf.status(), BufferStatus::Filling);
        assert_eq!(buf.frame_id(), 7);
    }
}
