//! Network interface helpers: enumeration, MTU lookup, and GVSP socket
//! binding (unicast and multicast).

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use if_addrs::get_if_addrs;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Default receive-buffer size requested for GVSP sockets that don't
/// override it explicitly.
pub const DEFAULT_RCVBUF_BYTES: usize = 4 * 1024 * 1024;

const IP_UDP_OVERHEAD: u32 = 20 + 8;
const MIN_PACKET_SIZE: u32 = 576;

/// A network interface usable for GVSP reception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iface {
    name: String,
    ipv4: Option<Ipv4Addr>,
}

impl Iface {
    /// Build an interface descriptor directly, bypassing OS enumeration.
    ///
    /// Useful when the caller already knows which address to bind (a saved
    /// configuration, a loopback address in tests) rather than resolving it
    /// through [`interfaces`], which excludes loopback.
    pub fn synthetic(name: impl Into<String>, ipv4: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            ipv4: Some(ipv4),
        }
    }

    /// Look up the interface carrying `ip` as one of its addresses.
    pub fn from_ipv4(ip: Ipv4Addr) -> io::Result<Self> {
        interfaces()?
            .into_iter()
            .find(|iface| iface.ipv4 == Some(ip))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no interface bound to {ip}")))
    }

    /// Interface name as reported by the OS (e.g. `eth0`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// IPv4 address bound to this interface, if any.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.ipv4
    }
}

/// Enumerate interfaces carrying an IPv4 address, excluding loopback.
pub fn interfaces() -> io::Result<Vec<Iface>> {
    let all = get_if_addrs()?;
    Ok(all
        .into_iter()
        .filter(|i| !i.is_loopback())
        .filter_map(|i| match i.addr {
            if_addrs::IfAddr::V4(v4) => Some(Iface {
                name: i.name,
                ipv4: Some(v4.ip),
            }),
            if_addrs::IfAddr::V6(_) => None,
        })
        .collect())
}

/// Multicast reception options for [`bind_multicast`].
#[derive(Debug, Clone, Copy)]
pub struct McOptions {
    /// Whether packets this host sends to the group loop back to itself.
    pub loopback: bool,
    /// Multicast TTL applied to outgoing packets (resends, discovery replies).
    pub ttl: u32,
    /// Socket receive-buffer size to request.
    pub rcvbuf_bytes: usize,
}

impl Default for McOptions {
    fn default() -> Self {
        Self {
            loopback: false,
            ttl: 1,
            rcvbuf_bytes: DEFAULT_RCVBUF_BYTES,
        }
    }
}

/// Best-effort MTU lookup for `iface`.
///
/// `if-addrs` does not expose the kernel's interface MTU table, so this
/// assumes the standard Ethernet MTU unless the caller overrides it with
/// [`crate::psize`]'s `FireTestPacket` negotiation, which probes the actual
/// path rather than trusting a locally reported number.
pub fn mtu(_iface: &Iface) -> io::Result<u32> {
    Ok(1500)
}

/// Compute the largest GVSP packet payload that fits within `mtu` once IPv4
/// and UDP headers are accounted for.
pub fn best_packet_size(mtu: u32) -> u32 {
    mtu.saturating_sub(IP_UDP_OVERHEAD).max(MIN_PACKET_SIZE).min(mtu)
}

/// Bind a UDP socket for unicast GVSP reception.
pub async fn bind_udp(
    bind_ip: IpAddr,
    port: u16,
    _iface: Option<Iface>,
    rcvbuf_bytes: Option<usize>,
) -> io::Result<UdpSocket> {
    let addr = SocketAddr::new(bind_ip, port);
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    if let Some(bytes) = rcvbuf_bytes {
        let _ = socket.set_recv_buffer_size(bytes);
    }
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Bind a UDP socket joined to `group` for multicast GVSP reception.
pub async fn bind_multicast(iface: &Iface, group: Ipv4Addr, port: u16, opts: &McOptions) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.set_multicast_loop_v4(opts.loopback)?;
    socket.set_multicast_ttl_v4(opts.ttl)?;
    let _ = socket.set_recv_buffer_size(opts.rcvbuf_bytes);
    socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port).into())?;
    let join_if = iface.ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED);
    socket.join_multicast_v4(&group, &join_if)?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_packet_size_respects_floor_and_overhead() {
        assert_eq!(best_packet_size(1500), 1500 - IP_UDP_OVERHEAD);
        assert_eq!(best_packet_size(9000), 9000 - IP_UDP_OVERHEAD);
        assert_eq!(best_packet_size(100), MIN_PACKET_SIZE.min(100));
    }

    #[tokio::test]
    async fn bind_udp_ephemeral_port_succeeds() {
        let socket = bind_udp(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, None, None)
            .await
            .expect("bind");
        assert!(socket.local_addr().unwrap().port() > 0);
    }
}
