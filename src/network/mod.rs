use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Kernel receive buffer asked for on UDP inputs; a multiplex at 50 Mbit/s
/// fills this in about half a second.
const RECV_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Creates and configures a UDP socket for TS packet reception.
/// Multicast groups are joined on `iface`, or on the default interface.
pub fn create_udp_socket(addr: SocketAddr, iface: Option<Ipv4Addr>) -> anyhow::Result<Socket> {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => v4,
        _ => anyhow::bail!("only IPv4 is supported"),
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if let Err(err) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
        tracing::warn!(%err, "could not enlarge UDP receive buffer");
    }
    socket.bind(&addr.into())?;

    if ip.is_multicast() {
        let iface = iface.unwrap_or(Ipv4Addr::UNSPECIFIED);
        socket.join_multicast_v4(&ip, &iface)?;
        tracing::debug!(group = %ip, %iface, "joined multicast group");
    }

    socket.set_nonblocking(true)?;
    Ok(socket)
}
