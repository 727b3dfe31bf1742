//! End-to-end scenarios from spec.md §8, driven over real loopback UDP
//! sockets against a hand-written "fake device" task, matching the style of
//! `control::tests`.

use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use genicp::{AckHeader, GenCpAck, OpCode, StatusCode};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;

use tl_gige::buffer::BufferStatus;
use tl_gige::control::ControlSocket;
use tl_gige::gvsp::{ContentType, GvspHeader, StreamConfig, StreamDest};
use tl_gige::nic::Iface;
use tl_gige::pool::BufferPool;
use tl_gige::stats::StreamStatsAccumulator;
use tl_gige::stream::StreamReceiver;

fn encode_ack(status: StatusCode, opcode: OpCode, request_id: u16, payload: Bytes) -> Bytes {
    let ack = GenCpAck {
        header: AckHeader {
            status,
            opcode,
            length: payload.len() as u16,
            request_id,
        },
        payload,
    };
    let mut buf = BytesMut::with_capacity(genicp::HEADER_SIZE + ack.payload.len());
    buf.put_u16(ack.header.status.to_raw());
    buf.put_u16(ack.header.opcode.ack_code());
    buf.put_u16(ack.header.length);
    buf.put_u16(ack.header.request_id);
    buf.extend_from_slice(&ack.payload);
    buf.freeze()
}

fn cmd_request_id(cmd: &[u8]) -> u16 {
    u16::from_be_bytes([cmd[6], cmd[7]])
}

/// S2: device sends a pending-ack, then the real ack; the caller must not
/// retry and must see the value once both arrive.
#[tokio::test]
async fn read_register_honors_pending_ack_without_retrying() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let device_addr = device.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        let (n, peer) = device.recv_from(&mut buf).await.unwrap();
        let request_id = cmd_request_id(&buf[..n]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        // A pending-ack carries `PENDING_ACK_CODE` in the *opcode* field, not
        // the status field, and its body is just the extra timeout in ms.
        let mut wire = BytesMut::with_capacity(genicp::HEADER_SIZE + 2);
        wire.put_u16(0); // status, ignored for pending-acks
        wire.put_u16(genicp::StatusCode::PENDING_ACK_CODE);
        wire.put_u16(2); // length
        wire.put_u16(request_id);
        wire.put_u16(500); // extra timeout ms
        device.send_to(&wire, peer).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        let mut payload = BytesMut::new();
        payload.put_u32(0x1234_5678);
        let ack = encode_ack(StatusCode::Success, OpCode::ReadReg, request_id, payload.freeze());
        device.send_to(&ack, peer).await.unwrap();
    });

    let control = ControlSocket::connect(device_addr).await.unwrap();
    let started = Instant::now();
    let value = control.read_register(0x0024).await.unwrap();
    assert_eq!(value, 0x1234_5678);
    assert!(started.elapsed() < Duration::from_millis(900), "pending-ack extension should avoid a full retry cycle");
}

/// S3: an error ack carrying `0x8004` (write-protect) maps to `StatusCode::WriteProtect`.
#[tokio::test]
async fn write_register_surfaces_device_error_status() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let device_addr = device.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        let (n, peer) = device.recv_from(&mut buf).await.unwrap();
        let request_id = cmd_request_id(&buf[..n]);
        let ack = encode_ack(StatusCode::WriteProtect, OpCode::WriteReg, request_id, Bytes::new());
        device.send_to(&ack, peer).await.unwrap();
    });

    let control = ControlSocket::connect(device_addr).await.unwrap();
    let err = control.write_register(0x0A00, 1).await.unwrap_err();
    match err {
        tl_gige::control::ControlError::Status(status) => assert_eq!(status, StatusCode::WriteProtect),
        other => panic!("expected a Status error, got {other:?}"),
    }
}

fn legacy_header(content: ContentType, block_id: u64, packet_id: u32) -> GvspHeader {
    GvspHeader {
        status: 0,
        content_type: content,
        extended: false,
        block_id,
        packet_id,
    }
}

fn leader_image_body(width: u32, height: u32, size: u32) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16(0); // reserved
    buf.put_u16(0x0001); // LeaderPayloadType::Image
    buf.put_u16(0); // reserved
    buf.put_u64(0); // device timestamp
    buf.put_u32(0x0101_0001); // pixel format (Mono8-ish placeholder)
    buf.put_u32(width);
    buf.put_u32(height);
    buf.put_u32(0); // x_offset
    buf.put_u32(0); // y_offset
    buf.put_u32(0); // x_padding
    buf.put_u32(0); // y_padding
    let _ = size;
    buf.freeze()
}

async fn spawn_stream(packet_size: u32) -> (UdpSocket, StreamReceiver, BufferPool, StreamStatsAccumulator) {
    let control_device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let control_addr = control_device.local_addr().unwrap();
    drop(control_device);
    let control = std::sync::Arc::new(ControlSocket::connect(control_addr).await.unwrap());

    let recv_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let recv_addr = recv_socket.local_addr().unwrap();
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.connect(recv_addr).await.unwrap();

    let config = StreamConfig {
        dest: StreamDest::Unicast {
            dst_ip: Ipv4Addr::LOCALHOST,
            dst_port: recv_addr.port(),
        },
        iface: Iface::synthetic("lo-test", Ipv4Addr::LOCALHOST),
        packet_size: Some(packet_size),
        packet_delay: Some(0),
        source_filter: None,
        resend_enabled: true,
    };

    let pool = BufferPool::new();
    let stats = StreamStatsAccumulator::new();
    let receiver = StreamReceiver::new(recv_socket, control, pool.clone(), stats.clone(), config, 0);
    (sender, receiver, pool, stats)
}

/// S4: leader + 10 in-order 1400-byte payload packets + trailer completes a
/// 14000-byte image buffer as `Success`.
#[tokio::test]
async fn complete_in_order_frame_reports_success() {
    let (sender, receiver, pool, _stats) = spawn_stream(1408).await;
    pool.push_input(tl_gige::buffer::Buffer::new(14000));

    let (_stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(receiver.run(stop_rx));

    let leader = legacy_header(ContentType::Leader, 1, 0);
    let mut wire = leader.encode();
    wire.extend_from_slice(&leader_image_body(100, 140, 14000));
    sender.send(&wire).await.unwrap();

    for packet_id in 1..=10u32 {
        let header = legacy_header(ContentType::Payload, 1, packet_id);
        let mut wire = header.encode();
        wire.extend_from_slice(&vec![packet_id as u8; 1400]);
        sender.send(&wire).await.unwrap();
    }

    let trailer = legacy_header(ContentType::Trailer, 1, 11);
    sender.send(&trailer.encode()).await.unwrap();

    let buffer = tokio::time::timeout(Duration::from_secs(2), pool.pop_output_blocking())
        .await
        .expect("frame should complete before the test timeout")
        .expect("pool should yield a buffer");
    assert_eq!(buffer.status(), BufferStatus::Success);
    assert_eq!(buffer.received_size(), 14000);

    task.abort();
}

/// S5: a single dropped packet (6 of 10) triggers exactly one resend request
/// and, once the device replies, the frame still completes `Success`.
#[tokio::test]
async fn single_gap_triggers_resend_and_recovers() {
    let (sender, receiver, pool, stats) = spawn_stream(1408).await;
    pool.push_input(tl_gige::buffer::Buffer::new(14000));

    let (_stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(receiver.run(stop_rx));

    let leader = legacy_header(ContentType::Leader, 1, 0);
    let mut wire = leader.encode();
    wire.extend_from_slice(&leader_image_body(100, 140, 14000));
    sender.send(&wire).await.unwrap();

    for packet_id in [1u32, 2, 3, 4, 5, 7] {
        let header = legacy_header(ContentType::Payload, 1, packet_id);
        let mut wire = header.encode();
        wire.extend_from_slice(&vec![packet_id as u8; 1400]);
        sender.send(&wire).await.unwrap();
    }

    // Packet 7's own arrival only *sets* packet 6's deadline
    // (INITIAL_PACKET_TIMEOUT = 20ms); a later packet's scan is what notices
    // the deadline has passed and actually requests the resend.
    tokio::time::sleep(Duration::from_millis(40)).await;
    for packet_id in [8u32, 9, 10] {
        let header = legacy_header(ContentType::Payload, 1, packet_id);
        let mut wire = header.encode();
        wire.extend_from_slice(&vec![packet_id as u8; 1400]);
        sender.send(&wire).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(stats.snapshot().resends >= 1, "missing packet 6 should have produced a resend request");

    let header = legacy_header(ContentType::Payload, 1, 6);
    let mut wire = header.encode();
    wire.extend_from_slice(&vec![6u8; 1400]);
    sender.send(&wire).await.unwrap();

    let trailer = legacy_header(ContentType::Trailer, 1, 11);
    sender.send(&trailer.encode()).await.unwrap();

    let buffer = tokio::time::timeout(Duration::from_secs(2), pool.pop_output_blocking())
        .await
        .expect("frame should recover and complete before the test timeout")
        .expect("pool should yield a buffer");
    assert_eq!(buffer.status(), BufferStatus::Success);
    assert_eq!(buffer.received_size(), 14000);

    task.abort();
}

/// S6: the device never resends the missing packet; the frame surfaces as
/// `Timeout` once `FRAME_RETENTION` elapses.
#[tokio::test]
async fn permanently_missing_packet_times_out() {
    let (sender, receiver, pool, _stats) = spawn_stream(1408).await;
    pool.push_input(tl_gige::buffer::Buffer::new(14000));

    let (_stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(receiver.run(stop_rx));

    let leader = legacy_header(ContentType::Leader, 1, 0);
    let mut wire = leader.encode();
    wire.extend_from_slice(&leader_image_body(100, 140, 14000));
    sender.send(&wire).await.unwrap();

    for packet_id in [1u32, 2, 3, 4, 5, 7, 8, 9, 10] {
        let header = legacy_header(ContentType::Payload, 1, packet_id);
        let mut wire = header.encode();
        wire.extend_from_slice(&vec![packet_id as u8; 1400]);
        sender.send(&wire).await.unwrap();
    }
    // Packet 6 never arrives, and neither does the trailer.

    let buffer = tokio::time::timeout(Duration::from_secs(3), pool.pop_output_blocking())
        .await
        .expect("frame should time out and surface before the test timeout")
        .expect("pool should yield a buffer");
    assert_eq!(buffer.status(), BufferStatus::Timeout);

    task.abort();
}
