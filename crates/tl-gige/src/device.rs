//! GigE Vision device façade: register/memory access, control ownership, and
//! stream channel configuration layered over [`crate::control`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use crate::consts::{
    stream_channel_reg, CCP_CONTROL_BIT, CCP_EXCLUSIVE_BIT, DEVICE_MODE_BIG_ENDIAN_BIT,
    GVCP_CAPABILITY_PACKET_RESEND_BIT, GVCP_CAPABILITY_WRITE_MEMORY_BIT, MESSAGE_CHANNEL_EVENT_ENABLE_BASE,
    REG_CONTROL_CHANNEL_PRIVILEGE, REG_CURRENT_IP, REG_CURRENT_IP_CONFIG, REG_DEVICE_MODE, REG_GVCP_CAPABILITY,
    REG_MESSAGE_CHANNEL_DEST_IP, REG_MESSAGE_CHANNEL_PORT, REG_PERSISTENT_GATEWAY, REG_PERSISTENT_IP,
    REG_PERSISTENT_SUBNET, REG_STREAM_CHANNEL_COUNT, SC_OFFSET_DEST_IP, SC_OFFSET_DEST_PORT, SC_OFFSET_PACKET_DELAY,
    SC_OFFSET_PACKET_SIZE,
};
use crate::control::{ControlError, ControlSocket};
use crate::gvsp::{StreamConfig, StreamDest};
use crate::nic::{self, Iface, McOptions, DEFAULT_RCVBUF_BYTES};
use crate::pool::BufferPool;
use crate::psize::{self, PsizeBounds, PsizeMode};
use crate::stats::{StreamStats, StreamStatsAccumulator};
use crate::stream::StreamReceiver;

/// Errors surfaced by the device façade.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("control: {0}")]
    Control(#[from] ControlError),
    #[error("protocol: {0}")]
    Protocol(&'static str),
    #[error("another host already holds exclusive control of this device")]
    ControlDenied,
    #[error("device does not advertise support for {0}")]
    NotSupported(&'static str),
    #[error("this host does not hold control of the device")]
    NotController,
    #[error("device exposes no stream channels")]
    NoStreamChannel,
    #[error("no matching GenICam device found")]
    GenicamNotFound,
    #[error("unknown device error")]
    Unknown,
}

/// Endianness and GVCP feature-support bits read once at open time, so a
/// missing capability can be rejected up front instead of failing at the
/// first resend/write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub big_endian: bool,
    pub packet_resend: bool,
    pub write_memory: bool,
}

/// IPv4 configuration mode a device can be placed into via `GevCurrentIPConfiguration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpConfigMode {
    Persistent,
    Dhcp,
    LinkLocal,
}

impl IpConfigMode {
    const fn bit(self) -> u32 {
        match self {
            IpConfigMode::LinkLocal => 1 << 24,
            IpConfigMode::Dhcp => 1 << 30,
            IpConfigMode::Persistent => 1 << 31,
        }
    }
}

/// Negotiated stream channel parameters, computed once when a stream is built
/// and reused by the receiver for frame-completion bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub packet_size: u32,
    pub packet_delay: u32,
    pub mtu: u32,
    pub host: Ipv4Addr,
    pub port: u16,
}

/// A handle to an open GigE Vision device.
///
/// All register/memory operations go through the single [`ControlSocket`]
/// underneath, which already serializes and retries transactions, so most
/// methods here take `&self`; callers that must serialize *semantically*
/// (take-control-then-configure) take `&mut self` to make that ordering
/// visible at the type level.
pub struct GigeDevice {
    control: Arc<ControlSocket>,
    peer: SocketAddr,
    control_lost_tx: watch::Sender<bool>,
    has_control: Arc<AtomicBool>,
    capabilities: DeviceCapabilities,
    first_stream_created: bool,
}

impl GigeDevice {
    /// Open a control channel to the device's GVCP port.
    ///
    /// Reads `GevDeviceMode` and `GevGVCPCapability` once up front so later
    /// calls can reject an unsupported operation immediately rather than
    /// waiting on a round trip that was always going to fail.
    pub async fn open(addr: SocketAddr) -> Result<Self, DeviceError> {
        let control = Arc::new(ControlSocket::connect(addr).await?);
        let device_mode = control.read_register(REG_DEVICE_MODE).await?;
        let gvcp_capability = control.read_register(REG_GVCP_CAPABILITY).await?;
        let capabilities = DeviceCapabilities {
            big_endian: device_mode & DEVICE_MODE_BIG_ENDIAN_BIT != 0,
            packet_resend: gvcp_capability & GVCP_CAPABILITY_PACKET_RESEND_BIT != 0,
            write_memory: gvcp_capability & GVCP_CAPABILITY_WRITE_MEMORY_BIT != 0,
        };
        info!(?capabilities, "device capabilities");
        let (control_lost_tx, _rx) = watch::channel(false);
        Ok(Self {
            control,
            peer: addr,
            control_lost_tx,
            has_control: Arc::new(AtomicBool::new(false)),
            capabilities,
            first_stream_created: false,
        })
    }

    /// GVCP control address this device was opened at.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Endianness and feature-support bits recorded when this device was opened.
    pub fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    /// Subscribe to control-loss notifications (heartbeat failure, or another
    /// host preempting exclusive control).
    pub fn control_lost(&self) -> watch::Receiver<bool> {
        self.control_lost_tx.subscribe()
    }

    /// Used by [`crate::heartbeat`] to signal that control has been lost.
    pub(crate) fn notify_control_lost(&self) {
        self.has_control.store(false, Ordering::SeqCst);
        let _ = self.control_lost_tx.send(true);
    }

    /// Spawn the periodic control-privilege heartbeat for this device.
    ///
    /// The returned handle owns a clone of the control socket and the
    /// control-loss notifier, so it keeps running independently of this
    /// `GigeDevice` value's lifetime; drop or shut it down explicitly to stop.
    pub fn spawn_heartbeat(&self) -> crate::heartbeat::Heartbeat {
        crate::heartbeat::Heartbeat::spawn(
            Arc::clone(&self.control),
            self.control_lost_tx.clone(),
            Arc::clone(&self.has_control),
            crate::consts::HEARTBEAT_PERIOD,
        )
    }

    /// Control socket accessor for [`crate::psize`].
    pub(crate) fn control_socket(&self) -> &ControlSocket {
        &self.control
    }

    pub async fn read_register(&self, address: u64) -> Result<u32, DeviceError> {
        Ok(self.control.read_register(address).await?)
    }

    pub async fn write_register(&self, address: u64, value: u32) -> Result<(), DeviceError> {
        Ok(self.control.write_register(address, value).await?)
    }

    pub async fn read_memory(&self, address: u64, len: usize) -> Result<Bytes, DeviceError> {
        Ok(self.control.read_memory(address, len).await?)
    }

    pub async fn write_memory(&self, address: u64, data: &[u8]) -> Result<(), DeviceError> {
        if !self.capabilities.write_memory {
            return Err(DeviceError::NotSupported("WRITEMEM_CMD"));
        }
        Ok(self.control.write_memory(address, data).await?)
    }

    /// Alias for [`GigeDevice::read_memory`] matching the historical GVCP
    /// naming used by the GenApi register transport.
    pub async fn read_mem(&self, address: u64, len: usize) -> Result<Vec<u8>, DeviceError> {
        Ok(self.read_memory(address, len).await?.to_vec())
    }

    /// Alias for [`GigeDevice::write_memory`].
    pub async fn write_mem(&self, address: u64, data: &[u8]) -> Result<(), DeviceError> {
        self.write_memory(address, data).await
    }

    /// Read a GenApi feature register: 4-byte features round-trip through
    /// `READ_REG` (cheaper, no fragmentation), anything else through
    /// `READ_MEMORY`.
    pub async fn feature_read(&self, address: u64, len: usize) -> Result<Bytes, DeviceError> {
        if len == 4 {
            let value = self.read_register(address).await?;
            Ok(Bytes::copy_from_slice(&value.to_be_bytes()))
        } else {
            self.read_memory(address, len).await
        }
    }

    pub async fn feature_write(&self, address: u64, data: &[u8]) -> Result<(), DeviceError> {
        if data.len() == 4 {
            let value = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            self.write_register(address, value).await
        } else {
            self.write_memory(address, data).await
        }
    }

    /// Request control-channel privilege (`GevCCP`). Fails if another host
    /// already holds exclusive control.
    pub async fn take_control(&mut self) -> Result<(), DeviceError> {
        let current = self.read_register(REG_CONTROL_CHANNEL_PRIVILEGE).await?;
        if current & CCP_EXCLUSIVE_BIT != 0 {
            return Err(DeviceError::ControlDenied);
        }
        self.write_register(REG_CONTROL_CHANNEL_PRIVILEGE, CCP_CONTROL_BIT).await?;
        self.has_control.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Release control-channel privilege, if held.
    pub async fn leave_control(&mut self) -> Result<(), DeviceError> {
        if self.has_control.load(Ordering::SeqCst) {
            self.write_register(REG_CONTROL_CHANNEL_PRIVILEGE, 0).await?;
            self.has_control.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn has_control(&self) -> bool {
        self.has_control.load(Ordering::SeqCst)
    }

    pub async fn get_current_ip(&self) -> Result<Ipv4Addr, DeviceError> {
        Ok(Ipv4Addr::from(self.read_register(REG_CURRENT_IP).await?))
    }

    pub async fn get_persistent_ip(&self) -> Result<(Ipv4Addr, Ipv4Addr, Ipv4Addr), DeviceError> {
        let ip = Ipv4Addr::from(self.read_register(REG_PERSISTENT_IP).await?);
        let subnet = Ipv4Addr::from(self.read_register(REG_PERSISTENT_SUBNET).await?);
        let gateway = Ipv4Addr::from(self.read_register(REG_PERSISTENT_GATEWAY).await?);
        Ok((ip, subnet, gateway))
    }

    pub async fn set_persistent_ip(
        &mut self,
        ip: Ipv4Addr,
        subnet: Ipv4Addr,
        gateway: Ipv4Addr,
    ) -> Result<(), DeviceError> {
        self.write_register(REG_PERSISTENT_IP, u32::from(ip)).await?;
        self.write_register(REG_PERSISTENT_SUBNET, u32::from(subnet)).await?;
        self.write_register(REG_PERSISTENT_GATEWAY, u32::from(gateway)).await
    }

    pub async fn set_ip_configuration_mode(&mut self, mode: IpConfigMode) -> Result<(), DeviceError> {
        self.write_register(REG_CURRENT_IP_CONFIG, mode.bit()).await
    }

    /// Configure stream channel `channel`'s destination host/port.
    pub async fn set_stream_destination(&mut self, channel: u32, host: Ipv4Addr, port: u16) -> Result<(), DeviceError> {
        self.write_register(stream_channel_reg(channel, SC_OFFSET_DEST_IP), u32::from(host))
            .await?;
        let dest_port_reg = (port as u32) << 16;
        self.write_register(stream_channel_reg(channel, SC_OFFSET_DEST_PORT), dest_port_reg)
            .await
    }

    pub async fn set_stream_packet_size(&mut self, channel: u32, packet_size: u32) -> Result<(), DeviceError> {
        self.write_register(stream_channel_reg(channel, SC_OFFSET_PACKET_SIZE), packet_size)
            .await
    }

    pub async fn set_stream_packet_delay(&mut self, channel: u32, packet_delay: u32) -> Result<(), DeviceError> {
        self.write_register(stream_channel_reg(channel, SC_OFFSET_PACKET_DELAY), packet_delay)
            .await
    }

    /// Point the GVCP message (event) channel at `local_ip:port`.
    pub async fn set_message_destination(&mut self, local_ip: Ipv4Addr, port: u16) -> Result<(), DeviceError> {
        self.write_register(REG_MESSAGE_CHANNEL_DEST_IP, u32::from(local_ip)).await?;
        let port_reg = (port as u32) << 16;
        self.write_register(REG_MESSAGE_CHANNEL_PORT, port_reg).await
    }

    /// Enable or disable delivery of a single event id over the message channel.
    pub async fn enable_event(&mut self, event_id: u16, enable: bool) -> Result<(), DeviceError> {
        let reg = MESSAGE_CHANNEL_EVENT_ENABLE_BASE + event_id as u64 * 4;
        self.write_register(reg, enable as u32).await
    }

    /// Negotiate (per `mode`), bind, and start a GVSP receiver for `channel`,
    /// returning a handle the caller pops completed [`crate::buffer::Buffer`]s
    /// from.
    ///
    /// The node map that would normally report `GevSCPSPacketSize`'s bounds
    /// lives outside this crate (GenApi XML is out of scope here), so callers
    /// that want real negotiation must supply `bounds`; without it, the probe
    /// runs between [`psize::MINIMUM_PACKET_SIZE`] and
    /// [`psize::MAXIMUM_PACKET_SIZE`].
    pub async fn create_stream(&mut self, options: StreamOptions) -> Result<StreamHandle, DeviceError> {
        if !self.has_control() {
            return Err(DeviceError::NotController);
        }
        let channel_count = self.read_register(REG_STREAM_CHANNEL_COUNT).await?;
        if channel_count < 1 {
            return Err(DeviceError::NoStreamChannel);
        }

        let host_ip = options
            .iface
            .ipv4()
            .ok_or(DeviceError::Protocol("interface lacks an IPv4 address"))?;
        let default_port = if options.dst_port == 0 { 0x5FFF } else { options.dst_port };
        let mut dest = options.dest.unwrap_or(StreamDest::Unicast {
            dst_ip: host_ip,
            dst_port: default_port,
        });
        match &mut dest {
            StreamDest::Unicast { dst_port, .. } if *dst_port == 0 => *dst_port = default_port,
            StreamDest::Multicast { port, .. } if *port == 0 => *port = default_port,
            _ => {}
        }

        let mtu = nic::mtu(&options.iface).map_err(|_| DeviceError::Protocol("mtu lookup failed"))?;
        let current_size = options.packet_size.unwrap_or_else(|| nic::best_packet_size(mtu));

        // `Once`/`OnFailureOnce` only ever negotiate on the device's first
        // stream; later streams on the same device keep whatever size is
        // already configured.
        let packet_size = match options.packet_size_mode {
            PsizeMode::Never => current_size,
            PsizeMode::Once | PsizeMode::OnFailureOnce if self.first_stream_created => current_size,
            mode => {
                let bounds = options.bounds.unwrap_or(PsizeBounds {
                    min: psize::MINIMUM_PACKET_SIZE,
                    max: psize::MAXIMUM_PACKET_SIZE,
                    increment: 4,
                });
                // `OnFailure`/`OnFailureOnce` try the current size first and
                // only fall through to the full bisection if it fails.
                let exit_early = matches!(mode, PsizeMode::OnFailure | PsizeMode::OnFailureOnce);
                let already_works = exit_early
                    && psize::check_current(self, options.channel, host_ip, current_size)
                        .await
                        .unwrap_or(false);
                if already_works {
                    current_size
                } else {
                    match psize::negotiate(self, options.channel, host_ip, bounds, current_size).await {
                        Ok(size) => size,
                        Err(err) => {
                            info!(?err, "packet-size negotiation failed, falling back");
                            psize::FALLBACK_PACKET_SIZE.min(current_size.max(psize::FALLBACK_PACKET_SIZE))
                        }
                    }
                }
            }
        };
        self.first_stream_created = true;

        match &dest {
            StreamDest::Unicast { dst_ip, dst_port } => {
                self.set_stream_destination(options.channel, *dst_ip, *dst_port).await?;
            }
            StreamDest::Multicast { .. } => {}
        }
        self.set_stream_packet_size(options.channel, packet_size).await?;
        let packet_delay = options.packet_delay.unwrap_or(0);
        self.set_stream_packet_delay(options.channel, packet_delay).await?;

        let socket = match &dest {
            StreamDest::Unicast { dst_port, .. } => {
                nic::bind_udp(IpAddr::V4(Ipv4Addr::UNSPECIFIED), *dst_port, Some(options.iface.clone()), options.rcvbuf_bytes)
                    .await
                    .map_err(|_| DeviceError::Protocol("failed to bind stream socket"))?
            }
            StreamDest::Multicast { group, port, loopback, ttl } => {
                let opts = McOptions {
                    loopback: *loopback,
                    ttl: *ttl,
                    rcvbuf_bytes: options.rcvbuf_bytes.unwrap_or(DEFAULT_RCVBUF_BYTES),
                };
                nic::bind_multicast(&options.iface, *group, *port, &opts)
                    .await
                    .map_err(|_| DeviceError::Protocol("failed to bind multicast stream socket"))?
            }
        };

        let source_filter = if dest.is_multicast() { None } else { Some(dest.addr()) };
        let resend_enabled = !dest.is_multicast() && self.capabilities.packet_resend;
        let params = StreamParams {
            packet_size,
            packet_delay,
            mtu,
            host: dest.addr(),
            port: dest.port(),
        };
        let config = StreamConfig {
            dest,
            iface: options.iface,
            packet_size: Some(packet_size),
            packet_delay: Some(packet_delay),
            source_filter,
            resend_enabled,
        };

        let pool = BufferPool::new();
        let stats = StreamStatsAccumulator::new();
        let receiver = StreamReceiver::new(socket, Arc::clone(&self.control), pool.clone(), stats.clone(), config, options.channel);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(receiver.run(stop_rx));

        Ok(StreamHandle {
            pool,
            stats,
            params,
            stop_tx,
            task,
        })
    }
}

/// Options passed to [`GigeDevice::create_stream`].
pub struct StreamOptions {
    pub iface: Iface,
    pub dest: Option<StreamDest>,
    pub channel: u32,
    pub dst_port: u16,
    pub rcvbuf_bytes: Option<usize>,
    pub packet_size_mode: PsizeMode,
    pub packet_size: Option<u32>,
    pub packet_delay: Option<u32>,
    pub bounds: Option<PsizeBounds>,
}

impl StreamOptions {
    pub fn new(iface: Iface) -> Self {
        Self {
            iface,
            dest: None,
            channel: 0,
            dst_port: 0,
            rcvbuf_bytes: None,
            packet_size_mode: PsizeMode::OnFailureOnce,
            packet_size: None,
            packet_delay: None,
            bounds: None,
        }
    }
}

/// A running GVSP receiver, returned by [`GigeDevice::create_stream`].
///
/// Completed (or aborted) buffers arrive on [`StreamHandle::pool`]'s output
/// FIFO; dropping the handle without calling [`StreamHandle::stop`] leaves
/// the receiver task running detached (it still shuts down once the last
/// `BufferPool` clone is dropped and its sockets close).
pub struct StreamHandle {
    pool: BufferPool,
    stats: StreamStatsAccumulator,
    params: StreamParams,
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl StreamHandle {
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn stats(&self) -> StreamStats {
        self.stats.snapshot()
    }

    pub fn params(&self) -> StreamParams {
        self.params
    }

    /// Signal the receiver to stop and wait for its task to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_config_mode_bits_are_distinct() {
        assert_ne!(IpConfigMode::Persistent.bit(), IpConfigMode::Dhcp.bit());
        assert_ne!(IpConfigMode::Dhcp.bit(), IpConfigMode::LinkLocal.bit());
    }

    #[test]
    fn stream_dest_port_register_shifts_port_into_high_word() {
        let port: u16 = 0x5FFF;
        let reg = (port as u32) << 16;
        assert_eq!(reg >> 16, port as u32);
    }
}
