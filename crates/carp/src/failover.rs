//! Takeover announcements.
//!
//! When an instance becomes master it broadcasts a gratuitous ARP request
//! for every virtual address, sourced from the virtual MAC, so neighbours
//! update their caches without waiting for expiry. Announcing is
//! best-effort: failures are counted and never retried or propagated.

use bytes::{BufMut, BytesMut};
use std::net::Ipv4Addr;
use tracing::{debug, warn};

use crate::port::{AnnounceReport, NetworkPort};
use crate::types::MacAddr;

/// Length of an Ethernet II frame carrying an IPv4 ARP packet (no FCS)
pub const ARP_FRAME_LEN: usize = 42;

const ETHERTYPE_ARP: u16 = 0x0806;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ARP_HTYPE_ETHERNET: u16 = 1;
const ARP_OP_REQUEST: u16 = 1;

/// Addresses to bind to a virtual MAC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub vhid: u8,
    pub mac: MacAddr,
    pub addresses: Vec<Ipv4Addr>,
}

/// Build a gratuitous ARP request claiming `addr` for `mac`.
///
/// Sender and target protocol addresses are both `addr`; the frame is
/// broadcast.
pub fn arp_announcement(mac: MacAddr, addr: Ipv4Addr) -> [u8; ARP_FRAME_LEN] {
    let mut buf = BytesMut::with_capacity(ARP_FRAME_LEN);

    // Ethernet header
    buf.put_slice(&MacAddr::BROADCAST.octets());
    buf.put_slice(&mac.octets());
    buf.put_u16(ETHERTYPE_ARP);

    // ARP payload
    buf.put_u16(ARP_HTYPE_ETHERNET);
    buf.put_u16(ETHERTYPE_IPV4);
    buf.put_u8(6);
    buf.put_u8(4);
    buf.put_u16(ARP_OP_REQUEST);
    buf.put_slice(&mac.octets());
    buf.put_slice(&addr.octets());
    buf.put_slice(&[0; 6]);
    buf.put_slice(&addr.octets());

    let mut frame = [0u8; ARP_FRAME_LEN];
    frame.copy_from_slice(&buf);
    frame
}

/// Announce `announcement` on `port`
pub async fn announce(port: &dyn NetworkPort, announcement: &Announcement) -> AnnounceReport {
    if announcement.addresses.is_empty() {
        debug!(vhid = announcement.vhid, "no virtual addresses to announce");
        return AnnounceReport::default();
    }

    let report = port
        .announce(announcement.mac, &announcement.addresses)
        .await;

    if report.resource_errors + report.transmit_errors > 0 {
        warn!(
            vhid = announcement.vhid,
            interface = port.name(),
            sent = report.sent,
            resource_errors = report.resource_errors,
            transmit_errors = report.transmit_errors,
            "address announcement incomplete"
        );
    } else {
        debug!(
            vhid = announcement.vhid,
            interface = port.name(),
            mac = %announcement.mac,
            sent = report.sent,
            "announced virtual addresses"
        );
    }

    report
}
