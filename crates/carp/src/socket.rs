//! Raw socket backend for [`NetworkPort`].
//!
//! Advertisements travel over an IPv4 raw socket on protocol 112, bound to
//! the interface and joined to 224.0.0.18. Outbound TTL is 255 and multicast
//! loopback is off. The kernel hands us whole IP datagrams on receive, so
//! the source address and TTL come straight from the IP header.
//!
//! Gratuitous ARP frames go out through a separate `AF_PACKET` socket.

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, ErrorKind, Read};
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};
use tokio::io::unix::AsyncFd;
use tracing::{debug, trace, warn};

use crate::failover::arp_announcement;
use crate::port::{AnnounceReport, NetworkPort, Received};
use crate::types::{CARP_MULTICAST_ADDR_V4, CARP_PROTOCOL, CARP_TTL, MacAddr};

/// Large enough for any advertisement datagram on a standard MTU
const RECV_BUF_LEN: usize = 1500;

/// Minimum IPv4 header length
const IPV4_HEADER_MIN: usize = 20;

/// CARP port over raw sockets on one interface
pub struct RawPort {
    name: String,
    ifindex: u32,
    address: Option<Ipv4Addr>,
    socket: AsyncFd<Socket>,
    arp: Socket,
}

impl RawPort {
    /// Open the CARP and ARP sockets on `interface`.
    ///
    /// Requires CAP_NET_RAW.
    pub fn open(interface: &str) -> io::Result<Self> {
        let ifindex = nix::net::if_::if_nametoindex(interface)
            .map_err(|e| io::Error::new(ErrorKind::NotFound, format!("{interface}: {e}")))?;

        let socket = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(i32::from(CARP_PROTOCOL))),
        )?;
        socket.set_nonblocking(true)?;
        socket.bind_device(Some(interface.as_bytes()))?;

        let fd = socket.as_raw_fd();
        let ttl = libc::c_int::from(CARP_TTL);
        setsockopt(fd, libc::IPPROTO_IP, libc::IP_TTL, &ttl)?;
        setsockopt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, &ttl)?;

        // Our own advertisements are not for us
        let loop_val: libc::c_int = 0;
        setsockopt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP, &loop_val)?;

        let mreq = membership(ifindex);
        setsockopt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_IF, &mreq)?;
        setsockopt(fd, libc::IPPROTO_IP, libc::IP_ADD_MEMBERSHIP, &mreq)?;

        let arp = Socket::new(Domain::PACKET, Type::RAW, None)?;
        arp.set_nonblocking(true)?;

        let address = primary_ipv4(interface);
        if address.is_none() {
            warn!(interface = %interface, "interface has no IPv4 address");
        }

        debug!(
            interface = %interface,
            ifindex,
            address = ?address,
            "opened CARP socket"
        );

        Ok(Self {
            name: interface.to_string(),
            ifindex,
            address,
            socket: AsyncFd::new(socket)?,
            arp,
        })
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    fn send_frame(&self, frame: &[u8]) -> io::Result<usize> {
        // sockaddr_ll (man 7 packet)
        let mut sa: libc::sockaddr_ll = unsafe { mem::zeroed() };
        sa.sll_family = libc::AF_PACKET as u16;
        sa.sll_protocol = (libc::ETH_P_ARP as u16).to_be();
        sa.sll_ifindex = self.ifindex as i32;
        sa.sll_halen = 6;
        sa.sll_addr[..6].copy_from_slice(&MacAddr::BROADCAST.octets());

        let sent = unsafe {
            libc::sendto(
                self.arp.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &sa as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };

        if sent < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(sent as usize)
        }
    }
}

#[async_trait]
impl NetworkPort for RawPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn primary_address(&self) -> Option<Ipv4Addr> {
        self.address
    }

    async fn send(&self, payload: Bytes) -> io::Result<usize> {
        let dest = SockAddr::from(SocketAddrV4::new(CARP_MULTICAST_ADDR_V4, 0));

        loop {
            let mut guard = self.socket.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_to(&payload, &dest)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn announce(&self, mac: MacAddr, addresses: &[Ipv4Addr]) -> AnnounceReport {
        let mut report = AnnounceReport::default();

        for address in addresses {
            match self.send_frame(&arp_announcement(mac, *address)) {
                Ok(_) => report.sent += 1,
                Err(err) => {
                    debug!(interface = %self.name, %address, error = %err, "ARP announcement failed");
                    report.fail(&err);
                }
            }
        }

        report
    }

    async fn receive(&self) -> io::Result<Option<Received>> {
        let mut buf = [0u8; RECV_BUF_LEN];

        loop {
            let mut guard = self.socket.readable().await?;
            let len = match guard.try_io(|inner| {
                let mut socket = inner.get_ref();
                socket.read(&mut buf)
            }) {
                Ok(result) => result?,
                Err(_would_block) => continue,
            };

            match parse_ipv4(&buf[..len]) {
                Some(received) => return Ok(Some(received)),
                None => trace!(interface = %self.name, len, "ignoring unparsable datagram"),
            }
        }
    }
}

impl Drop for RawPort {
    fn drop(&mut self) {
        // Best effort to leave the multicast group on cleanup
        let mreq = membership(self.ifindex);
        let _ = setsockopt(
            self.socket.get_ref().as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_DROP_MEMBERSHIP,
            &mreq,
        );
    }
}

fn membership(ifindex: u32) -> libc::ip_mreqn {
    libc::ip_mreqn {
        imr_multiaddr: libc::in_addr {
            s_addr: u32::from_ne_bytes(CARP_MULTICAST_ADDR_V4.octets()),
        },
        imr_address: libc::in_addr { s_addr: 0 },
        imr_ifindex: ifindex as libc::c_int,
    }
}

fn setsockopt<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// First IPv4 address configured on `interface`
fn primary_ipv4(interface: &str) -> Option<Ipv4Addr> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;

    addrs
        .filter(|ifa| ifa.interface_name == interface)
        .filter_map(|ifa| {
            ifa.address
                .as_ref()
                .and_then(|addr| addr.as_sockaddr_in().copied())
        })
        .map(|sin| *SocketAddrV4::from(sin).ip())
        .next()
}

/// Split an IPv4 datagram carrying CARP into the advertisement and the
/// header fields validation needs.
pub(crate) fn parse_ipv4(datagram: &[u8]) -> Option<Received> {
    if datagram.len() < IPV4_HEADER_MIN || datagram[0] >> 4 != 4 {
        return None;
    }

    let ihl = usize::from(datagram[0] & 0x0f) * 4;
    if ihl < IPV4_HEADER_MIN || datagram.len() < ihl || datagram[9] != CARP_PROTOCOL {
        return None;
    }

    Some(Received {
        payload: Bytes::copy_from_slice(&datagram[ihl..]),
        source: Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15]),
        ttl: datagram[8],
    })
}
