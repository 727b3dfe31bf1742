//! Control-privilege heartbeat (spec.md §4.2): a periodic task that keeps
//! re-asserting liveness to the device and notices when another host has
//! preempted control.
//!
//! Mirrors the retry-then-sleep shape of the reference heartbeat thread: each
//! cycle keeps retrying the privilege register read until it succeeds or
//! [`HEARTBEAT_RETRY_TIMEOUT`] elapses, then checks the control bits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::consts::{
    CCP_CONTROL_BIT, CCP_EXCLUSIVE_BIT, HEARTBEAT_RETRY_TIMEOUT, REG_CONTROL_CHANNEL_PRIVILEGE,
};
use crate::control::ControlSocket;

/// Handle to a running heartbeat task.
///
/// Dropping this handle signals the task to stop; call [`Heartbeat::stop`]
/// to wait for it to actually exit.
pub struct Heartbeat {
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl Heartbeat {
    /// Spawn the task. `control` is shared with the device handle so both can
    /// issue transactions concurrently; `has_control` and `control_lost_tx`
    /// are the same cells the device handle reads/notifies through.
    pub fn spawn(
        control: Arc<ControlSocket>,
        control_lost_tx: watch::Sender<bool>,
        has_control: Arc<AtomicBool>,
        period: Duration,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        debug!("heartbeat stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if !has_control.load(Ordering::SeqCst) {
                            continue;
                        }
                        if !Self::cycle(&control, &stop_rx).await {
                            warn!("heartbeat: control access lost");
                            has_control.store(false, Ordering::SeqCst);
                            let _ = control_lost_tx.send(true);
                        }
                    }
                }
            }
        });
        Self { stop_tx, task }
    }

    /// One retry-until-success-or-timeout cycle. Returns `false` if control
    /// bits were found clear (control lost), `true` otherwise (including on
    /// a read failure within the retry budget, which is not yet conclusive).
    async fn cycle(control: &ControlSocket, stop_rx: &watch::Receiver<bool>) -> bool {
        let deadline = Instant::now() + HEARTBEAT_RETRY_TIMEOUT;
        let mut attempts = 0u32;
        loop {
            if *stop_rx.borrow() {
                return true;
            }
            match control.read_register(REG_CONTROL_CHANNEL_PRIVILEGE).await {
                Ok(value) => {
                    if attempts > 0 {
                        debug!(attempts, "heartbeat read succeeded after retrying");
                    }
                    return value & (CCP_CONTROL_BIT | CCP_EXCLUSIVE_BIT) != 0;
                }
                Err(err) => {
                    attempts += 1;
                    if Instant::now() >= deadline {
                        warn!(?err, attempts, "heartbeat gave up for this cycle");
                        return true;
                    }
                }
            }
        }
    }

    /// Signal the task to stop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlSocket;
    use bytes::{BufMut, Bytes, BytesMut};
    use genicp::{AckHeader, GenCpAck, OpCode, StatusCode};
    use tokio::net::UdpSocket;

    fn encode_ack(request_id: u16, value: u32) -> Bytes {
        let mut payload = BytesMut::new();
        payload.put_u32(value);
        let ack = GenCpAck {
            header: AckHeader {
                status: StatusCode::Success,
                opcode: OpCode::ReadReg,
                length: payload.len() as u16,
                request_id,
            },
            payload: payload.freeze(),
        };
        let mut buf = BytesMut::with_capacity(genicp::HEADER_SIZE + ack.payload.len());
        buf.put_u16(ack.header.status.to_raw());
        buf.put_u16(ack.header.opcode.ack_code());
        buf.put_u16(ack.header.length);
        buf.put_u16(ack.header.request_id);
        buf.extend_from_slice(&ack.payload);
        buf.freeze()
    }

    #[tokio::test]
    async fn heartbeat_signals_loss_when_privilege_bits_clear() {
        let device_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device_socket.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let mut buf = [0u8; 1024];
                let Ok((n, peer)) = device_socket.recv_from(&mut buf).await else {
                    return;
                };
                let request_id = u16::from_be_bytes([buf[6], buf[7]]);
                let reply = encode_ack(request_id, 0);
                let _ = device_socket.send_to(&reply, peer).await;
            }
        });

        let control = Arc::new(ControlSocket::connect(device_addr).await.unwrap());
        let (control_lost_tx, mut control_lost_rx) = watch::channel(false);
        let has_control = Arc::new(AtomicBool::new(true));
        let heartbeat = Heartbeat::spawn(
            Arc::clone(&control),
            control_lost_tx,
            Arc::clone(&has_control),
            Duration::from_millis(20),
        );

        time::timeout(Duration::from_secs(2), control_lost_rx.changed())
            .await
            .expect("control loss notification")
            .unwrap();
        assert!(*control_lost_rx.borrow());
        assert!(!has_control.load(Ordering::SeqCst));

        heartbeat.stop().await;
    }

    #[tokio::test]
    async fn stopping_heartbeat_does_not_notify_loss() {
        let device_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device_socket.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let mut buf = [0u8; 1024];
                let Ok((n, peer)) = device_socket.recv_from(&mut buf).await else {
                    return;
                };
                let request_id = u16::from_be_bytes([buf[6], buf[7]]);
                let reply = encode_ack(request_id, CCP_CONTROL_BIT);
                let _ = device_socket.send_to(&reply, peer).await;
            }
        });

        let control = Arc::new(ControlSocket::connect(device_addr).await.unwrap());
        let (control_lost_tx, control_lost_rx) = watch::channel(false);
        let has_control = Arc::new(AtomicBool::new(true));
        let heartbeat = Heartbeat::spawn(control, control_lost_tx, Arc::clone(&has_control), Duration::from_millis(20));

        time::sleep(Duration::from_millis(100)).await;
        assert!(!*control_lost_rx.borrow());
        heartbeat.stop().await;
    }
}
