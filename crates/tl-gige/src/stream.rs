//! GVSP stream receiver (spec.md §4.5): frame reassembly from out-of-order
//! UDP datagrams, selective resend, per-frame timeouts, and buffer handoff.
//!
//! [`crate::gvsp`] only knows packet *shapes*; this module owns the frame
//! state machine and the socket it reads from, mirroring how [`crate::control`]
//! sits above [`crate::gvcp`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::buffer::{Buffer, BufferStatus, Part};
use crate::consts::{
    stream_channel_reg, FRAME_RETENTION, INITIAL_PACKET_TIMEOUT, LATE_FRAME_THRESHOLD, PACKET_REQUEST_RATIO,
    PACKET_TIMEOUT, SC_OFFSET_DEST_PORT, STREAM_POLL_TIMEOUT,
};
use crate::control::ControlSocket;
use crate::gvsp::{self, ContentType, GvspError, GvspHeader, LeaderDescriptor, LeaderPayloadType, ResendRequest, StreamConfig};
use crate::pool::BufferPool;
use crate::stats::StreamStatsAccumulator;
use crate::time::TimeSync;

/// Errors surfaced while running a stream receiver.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// How a frame may legitimately be resend-disabled.
fn disables_resend(status: genicp::StatusCode) -> bool {
    matches!(
        status,
        genicp::StatusCode::PacketRemovedFromMemory
            | genicp::StatusCode::PacketAndPreviousRemovedFromMemory
            | genicp::StatusCode::PacketUnavailable
    )
}

#[derive(Debug, Clone, Copy, Default)]
struct PacketState {
    received: bool,
    resend_requested: bool,
    deadline: Option<Instant>,
}

/// One in-progress frame reception (spec.md §3 "Frame-in-flight").
struct FrameInFlight {
    frame_id: u64,
    buffer: Buffer,
    expected_count: Option<u32>,
    last_valid_contiguous: i64,
    packets: Vec<PacketState>,
    first_packet_ts: Instant,
    last_packet_ts: Instant,
    disable_resend: bool,
    ratio_reached: bool,
    leader_received: bool,
    extended_ids: bool,
    n_resend_requests: u32,
    /// Set when a packet violates the content-type's packet-id contract or
    /// the leader names an unsupported payload type; the frame closes with
    /// this status on the next sweep instead of waiting out its retention.
    closed_early: Option<BufferStatus>,
}

impl FrameInFlight {
    fn new(frame_id: u64, buffer: Buffer, extended_ids: bool, now: Instant) -> Self {
        Self {
            frame_id,
            buffer,
            expected_count: None,
            last_valid_contiguous: -1,
            packets: Vec::new(),
            first_packet_ts: now,
            last_packet_ts: now,
            disable_resend: false,
            ratio_reached: false,
            leader_received: false,
            extended_ids,
            n_resend_requests: 0,
            closed_early: None,
        }
    }

    fn ensure_slot(&mut self, index: u32) {
        let index = index as usize;
        if self.packets.len() <= index {
            self.packets.resize(index + 1, PacketState::default());
        }
    }

    fn mark_received(&mut self, index: u32) {
        self.ensure_slot(index);
        self.packets[index as usize].received = true;
    }

    /// Step 4: advance the last-valid-contiguous index.
    fn advance_contiguous(&mut self) {
        let mut next = self.last_valid_contiguous + 1;
        while (next as usize) < self.packets.len() && self.packets[next as usize].received {
            next += 1;
        }
        self.last_valid_contiguous = next - 1;
    }

    fn is_complete(&self) -> bool {
        match self.expected_count {
            Some(expected) => self.last_valid_contiguous as i64 == expected as i64 - 1,
            None => false,
        }
    }
}

fn packet_payload_capacity(packet_size: u32) -> usize {
    packet_size.saturating_sub(gvsp::LEGACY_HEADER_LEN as u32).max(1) as usize
}

fn expected_packet_count(payload_type: LeaderPayloadType, descriptor: &LeaderDescriptor, allocated_size: usize, packet_size: u32) -> Option<u32> {
    let capacity = packet_payload_capacity(packet_size);
    match (payload_type, descriptor) {
        (LeaderPayloadType::Image | LeaderPayloadType::ChunkedImage | LeaderPayloadType::ChunkData, _) => {
            let blocks = allocated_size.div_ceil(capacity);
            Some(blocks as u32 + 2)
        }
        (LeaderPayloadType::Multipart, LeaderDescriptor::Multipart(parts)) => {
            let total: u64 = parts.iter().map(|p| p.size).sum();
            let blocks = (total as usize).div_ceil(capacity);
            Some(blocks as u32 + 2 + 255)
        }
        _ => None,
    }
}

/// Owns the GVSP socket and runs the frame-assembly loop until cancelled.
pub struct StreamReceiver {
    socket: tokio::net::UdpSocket,
    control: Arc<ControlSocket>,
    pool: BufferPool,
    stats: StreamStatsAccumulator,
    config: StreamConfig,
    channel: u32,
    time_sync: Option<TimeSync>,
}

impl StreamReceiver {
    pub fn new(
        socket: tokio::net::UdpSocket,
        control: Arc<ControlSocket>,
        pool: BufferPool,
        stats: StreamStatsAccumulator,
        config: StreamConfig,
        channel: u32,
    ) -> Self {
        Self {
            socket,
            control,
            pool,
            stats,
            config,
            channel,
            time_sync: None,
        }
    }

    /// Attach a device-tick-to-host-time mapping; leader timestamps convert
    /// through it instead of being left as raw device ticks.
    pub fn with_time_sync(mut self, time_sync: TimeSync) -> Self {
        self.time_sync = Some(time_sync);
        self
    }

    /// Run the receive loop until `stop_rx` is signalled.
    ///
    /// On cancellation, open frames close as [`BufferStatus::Aborted`] and the
    /// device's stream-channel destination port is cleared (best-effort).
    pub async fn run(mut self, mut stop_rx: watch::Receiver<bool>) {
        let mut frames: VecDeque<FrameInFlight> = VecDeque::new();
        let mut last_frame_id: Option<u64> = None;
        let mut buf = vec![0u8; 65536];

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    debug!("stream receiver stopping");
                    break;
                }
                result = tokio::time::timeout(STREAM_POLL_TIMEOUT, self.socket.recv(&mut buf)) => {
                    match result {
                        Ok(Ok(n)) => {
                            self.stats.record_packet();
                            self.handle_packet(&buf[..n], &mut frames, &mut last_frame_id).await;
                        }
                        Ok(Err(err)) => {
                            warn!(?err, "stream socket recv error");
                        }
                        Err(_elapsed) => {
                            // idle poll timeout; fall through to the completion sweep
                        }
                    }
                }
            }
            self.sweep_completions(&mut frames);
        }

        for frame in frames.drain(..) {
            let mut buffer = frame.buffer;
            buffer.set_status(BufferStatus::Aborted);
            self.pool.push_output(buffer);
        }
        let reg = stream_channel_reg(self.channel, SC_OFFSET_DEST_PORT);
        if let Err(err) = self.control.write_register(reg, 0).await {
            warn!(?err, "failed to clear stream destination on shutdown");
        }
    }

    async fn handle_packet(&mut self, datagram: &[u8], frames: &mut VecDeque<FrameInFlight>, last_frame_id: &mut Option<u64>) {
        let (header, header_len) = match gvsp::decode_header(datagram) {
            Ok(parsed) => parsed,
            Err(err) => {
                trace!(?err, "dropping unparseable gvsp packet");
                return;
            }
        };
        let body = &datagram[header_len..];
        let now = Instant::now();

        let idx = match self.lookup_or_create_frame(frames, &header, now, last_frame_id) {
            Some(idx) => idx,
            None => return,
        };

        {
            let frame = &mut frames[idx];
            frame.last_packet_ts = now;
            self.stats.record_since_last_packet(now.duration_since(frame.first_packet_ts));

            // Step 2: classify.
            if let Some(status) = header.error() {
                if disables_resend(status) {
                    frame.disable_resend = true;
                }
            }
            if header.packet_id < frame.packets.len() as u32 && frame.packets[header.packet_id as usize].received {
                self.stats.record_duplicate_packet();
                return;
            }

            // Step 3: process by content type.
            self.process_content(frame, &header, body, now);

            // Step 4.
            frame.advance_contiguous();
        }

        // Step 5: missing-packet scan.
        self.missing_packet_scan(&mut frames[idx], header.packet_id, now).await;
    }

    fn lookup_or_create_frame(
        &mut self,
        frames: &mut VecDeque<FrameInFlight>,
        header: &GvspHeader,
        now: Instant,
        last_frame_id: &mut Option<u64>,
    ) -> Option<usize> {
        if let Some(pos) = frames.iter().position(|f| f.frame_id == header.block_id) {
            return Some(pos);
        }

        if header.block_id == 0 {
            trace!("dropping packet with block id 0, never a valid new frame");
            return None;
        }

        let delta = match *last_frame_id {
            Some(last) => header.block_id as i64 - last as i64,
            None => i64::MAX,
        };
        if delta <= 0 && delta > -LATE_FRAME_THRESHOLD {
            trace!(frame_id = header.block_id, "dropping late packet for a completed frame");
            return None;
        }
        if delta > 1 && delta != i64::MAX {
            self.stats.record_late_frame();
        }

        let buffer = match self.pool.try_pop_input() {
            Some(buffer) => buffer,
            None => {
                self.stats.record_pool_exhaustion();
                return None;
            }
        };

        *last_frame_id = Some(header.block_id);
        let frame = FrameInFlight::new(header.block_id, buffer, header.extended, now);
        frames.push_back(frame);
        Some(frames.len() - 1)
    }

    fn process_content(&self, frame: &mut FrameInFlight, header: &GvspHeader, body: &[u8], now: Instant) {
        let packet_size = self.config.packet_size.unwrap_or(1500);
        let capacity = packet_payload_capacity(packet_size);

        match header.content_type {
            ContentType::Leader => {
                if header.packet_id != 0 {
                    warn!(frame_id = frame.frame_id, packet_id = header.packet_id, "leader did not carry packet id 0");
                    frame.closed_early = Some(BufferStatus::WrongPacketId);
                    return;
                }
                match gvsp::decode_leader(body) {
                    Ok(leader) => {
                        frame.buffer.set_payload_type(leader.payload_type);
                        frame.buffer.set_timestamp_dev_ns(leader.timestamp_ticks);
                        if let Some(time_sync) = &self.time_sync {
                            let host_time = time_sync.to_host_time(leader.timestamp_ticks);
                            if let Ok(since_epoch) = host_time.duration_since(std::time::UNIX_EPOCH) {
                                frame.buffer.set_timestamp_system_ns(since_epoch.as_nanos() as u64);
                            }
                        }
                        if let LeaderDescriptor::Multipart(parts) = &leader.descriptor {
                            let mut offset = 0usize;
                            for part in parts {
                                frame.buffer.push_part(Part {
                                    offset,
                                    component_id: part.component_id,
                                    part_type: part.data_type,
                                    pixel_format: part.pixel_format,
                                    width: part.width,
                                    height: part.height,
                                    x_offset: part.x_offset,
                                    y_offset: part.y_offset,
                                    x_padding: 0,
                                    y_padding: 0,
                                    size: part.size as usize,
                                });
                                offset += part.size as usize;
                            }
                        }
                        if frame.expected_count.is_none() {
                            frame.expected_count =
                                expected_packet_count(leader.payload_type, &leader.descriptor, frame.buffer.allocated_size(), packet_size);
                            if frame.expected_count.is_none() {
                                trace!(frame_id = frame.frame_id, ?leader.payload_type, "unsupported payload type for this leader");
                                frame.closed_early = Some(BufferStatus::PayloadNotSupported);
                            }
                        }
                        frame.leader_received = true;
                    }
                    Err(err) => {
                        warn!(?err, frame_id = frame.frame_id, "malformed leader body");
                    }
                }
                frame.mark_received(0);
            }
            ContentType::Payload | ContentType::AllIn => {
                let out_of_range = header.packet_id == 0
                    || frame
                        .expected_count
                        .is_some_and(|expected| header.packet_id > expected.saturating_sub(2));
                if out_of_range {
                    warn!(frame_id = frame.frame_id, packet_id = header.packet_id, "payload packet id out of range");
                    frame.closed_early = Some(BufferStatus::WrongPacketId);
                    return;
                }
                let offset = (header.packet_id as usize - 1) * capacity;
                frame.buffer.write_at(offset, body);
                frame.mark_received(header.packet_id);
            }
            ContentType::Multipart => {
                if body.len() >= 2 {
                    let part_id = u16::from_be_bytes([body[0], body[1]]) as usize;
                    let intra_offset = if body.len() >= 6 {
                        u32::from_be_bytes([body[2], body[3], body[4], body[5]]) as usize
                    } else {
                        0
                    };
                    let payload = &body[6.min(body.len())..];
                    if let Some(part) = frame.buffer.parts().get(part_id) {
                        let abs_offset = part.offset + intra_offset;
                        frame.buffer.write_at(abs_offset, payload);
                    }
                }
                frame.mark_received(header.packet_id);
            }
            ContentType::Trailer => {
                if let Some(expected) = frame.expected_count {
                    if header.packet_id > expected.saturating_sub(1) {
                        warn!(frame_id = frame.frame_id, packet_id = header.packet_id, expected, "trailer packet id out of range");
                        frame.closed_early = Some(BufferStatus::WrongPacketId);
                        return;
                    }
                    if header.packet_id < expected.saturating_sub(1) {
                        debug!(
                            frame_id = frame.frame_id,
                            old = expected,
                            new = header.packet_id + 1,
                            "trailer revised expected packet count downward"
                        );
                        frame.expected_count = Some(header.packet_id + 1);
                    }
                } else {
                    frame.expected_count = Some(header.packet_id + 1);
                }
                frame.mark_received(header.packet_id);
                let _ = now;
            }
            other => {
                trace!(?other, frame_id = frame.frame_id, "unsupported gvsp content type");
            }
        }
    }

    async fn missing_packet_scan(&self, frame: &mut FrameInFlight, packet_id: u32, now: Instant) {
        if frame.disable_resend || frame.ratio_reached || frame.closed_early.is_some() || !self.config.resend_enabled {
            return;
        }
        let Some(expected) = frame.expected_count else {
            return;
        };
        let budget = (expected as f64 * PACKET_REQUEST_RATIO) as u32;
        if budget == 0 {
            return;
        }

        let mut first_missing: Option<u32> = None;
        let upper = packet_id + 1;
        let mut i = (frame.last_valid_contiguous + 1).max(0) as u32;
        while i <= upper {
            let eligible = if i <= packet_id {
                frame.ensure_slot(i);
                let state = &mut frame.packets[i as usize];
                if state.received {
                    false
                } else {
                    let deadline = *state.deadline.get_or_insert(now + INITIAL_PACKET_TIMEOUT);
                    now > deadline
                }
            } else {
                false
            };

            if eligible && first_missing.is_none() {
                first_missing = Some(i);
            }

            if (i >= upper || !eligible) && first_missing.is_some() {
                let first = first_missing.take().unwrap();
                let last = i - 1;
                let n_missing = last - first + 1;
                if frame.n_resend_requests + n_missing > budget {
                    frame.n_resend_requests += n_missing;
                    frame.ratio_reached = true;
                    self.stats.record_resend_ranges(0);
                    return;
                }

                let request = ResendRequest {
                    block_id: frame.frame_id,
                    first_packet_id: first,
                    last_packet_id: last,
                };
                if let Err(err) = self.control.send_resend_request(request.encode(frame.extended_ids)).await {
                    warn!(?err, "failed to send resend request");
                }
                self.stats.record_resend();
                self.stats.record_resend_ranges(1);
                for j in first..=last {
                    frame.packets[j as usize].deadline = Some(now + PACKET_TIMEOUT);
                    frame.packets[j as usize].resend_requested = true;
                }
                frame.n_resend_requests += n_missing;
            }

            i += 1;
        }
    }

    /// Step 6: oldest-first completion sweep.
    fn sweep_completions(&self, frames: &mut VecDeque<FrameInFlight>) {
        let now = Instant::now();
        let mut i = 0;
        while i < frames.len() {
            let close_as = {
                let frame = &frames[i];
                if let Some(status) = frame.closed_early {
                    Some(status)
                } else if frame.is_complete() {
                    Some(BufferStatus::Success)
                } else if frame.disable_resend && frames.len() > i + 1 {
                    Some(BufferStatus::MissingPackets)
                } else if now.duration_since(frame.last_packet_ts) >= FRAME_RETENTION
                    && !(i == frames.len() - 1 && !frame.leader_received && frame.last_valid_contiguous < 0)
                {
                    Some(BufferStatus::Timeout)
                } else {
                    None
                }
            };

            if let Some(status) = close_as {
                let frame = frames.remove(i).expect("index in bounds");
                let retention_used = now.duration_since(frame.first_packet_ts);
                self.stats.record_frame_retention_used(retention_used);
                self.stats.record_since_first_packet(retention_used);
                if status == BufferStatus::Success {
                    self.stats.record_completed_frame();
                } else {
                    self.stats.record_drop();
                }
                let mut buffer = frame.buffer;
                buffer.set_status(status);
                self.pool.push_output(buffer);
            } else {
                i += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_count_for_image_matches_formula() {
        let descriptor = LeaderDescriptor::Opaque;
        let count = expected_packet_count(LeaderPayloadType::Image, &descriptor, 1_000_000, 1500);
        let capacity = packet_payload_capacity(1500);
        assert_eq!(count, Some((1_000_000usize.div_ceil(capacity)) as u32 + 2));
    }

    #[test]
    fn frame_advance_contiguous_stops_at_first_gap() {
        let buffer = Buffer::new(16);
        let mut frame = FrameInFlight::new(1, buffer, false, Instant::now());
        frame.mark_received(0);
        frame.mark_received(1);
        frame.mark_received(3);
        frame.advance_contiguous();
        assert_eq!(frame.last_valid_contiguous, 1);
    }

    #[test]
    fn frame_is_complete_when_contiguous_reaches_expected() {
        let buffer = Buffer::new(16);
        let mut frame = FrameInFlight::new(1, buffer, false, Instant::now());
        frame.expected_count = Some(3);
        frame.mark_received(0);
        frame.mark_received(1);
        frame.mark_received(2);
        frame.advance_contiguous();
        assert!(frame.is_complete());
    }

    #[test]
    fn disables_resend_matches_spec_error_codes() {
        assert!(disables_resend(genicp::StatusCode::PacketRemovedFromMemory));
        assert!(disables_resend(genicp::StatusCode::PacketUnavailable));
        assert!(!disables_resend(genicp::StatusCode::Busy));
    }
}
