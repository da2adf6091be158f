//! Ethernet/IPv4/UDP frames as sent through raw packet queue pairs, and the mapping from IPv4
//! multicast groups to Ethernet addresses and multicast GIDs.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::Gid;

/// An Ethernet MAC address.
pub type MacAddr = [u8; 6];

/// Length of the Ethernet header.
pub const ETH_HLEN: usize = 14;
/// Length of an IPv4 header without options.
pub const IPV4_HLEN: usize = 20;
/// Length of the UDP header.
pub const UDP_HLEN: usize = 8;
/// Length of all headers in front of the payload.
pub const HEADERS_LEN: usize = ETH_HLEN + IPV4_HLEN + UDP_HLEN;

/// EtherType of IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// IP protocol number of UDP.
pub const IPPROTO_UDP: u8 = 17;
/// Time to live used for generated frames.
pub const DEFAULT_TTL: u8 = 5;

const MAX_PAYLOAD: usize = u16::MAX as usize - IPV4_HLEN - UDP_HLEN;

/// The Ethernet address an IPv4 multicast group maps to: `01:00:5e` followed by the low 23
/// bits of the group address.
pub fn multicast_mac(group: Ipv4Addr) -> MacAddr {
    let o = group.octets();
    [0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]]
}

/// The GID a raw packet queue pair attaches to in order to receive frames sent to `group`: all
/// zeroes, with the group's multicast MAC in the last six bytes.
pub fn multicast_gid(group: Ipv4Addr) -> Gid {
    let mut raw = [0u8; 16];
    raw[10..].copy_from_slice(&multicast_mac(group));
    Gid::from(raw)
}

/// The Internet checksum of an IPv4 header, computed with the checksum field taken as zero.
///
/// # Errors
///
///  - `InvalidArgument`: `header` is shorter than 20 bytes.
pub fn ipv4_checksum(header: &[u8]) -> Result<u16> {
    if header.len() < IPV4_HLEN {
        return Err(Error::InvalidArgument("IPv4 header shorter than 20 bytes"));
    }
    let mut sum = header
        .chunks(2)
        .enumerate()
        .filter(|&(i, _)| i != 5)
        .map(|(_, w)| (u32::from(w[0]) << 8) | u32::from(*w.get(1).unwrap_or(&0)))
        .sum::<u32>();
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    Ok(!(sum as u16))
}

/// The addressing of a UDP datagram carried in an Ethernet frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpFrame {
    /// Source Ethernet address.
    pub src_mac: MacAddr,
    /// Destination Ethernet address.
    pub dst_mac: MacAddr,
    /// Source IPv4 address.
    pub src_ip: Ipv4Addr,
    /// Destination IPv4 address.
    pub dst_ip: Ipv4Addr,
    /// Source UDP port.
    pub src_port: u16,
    /// Destination UDP port.
    pub dst_port: u16,
    /// Sequence number, carried in the IPv4 identification field.
    pub seq: u16,
    /// IPv4 time to live.
    pub ttl: u8,
}

impl UdpFrame {
    /// A frame between two hosts, with ports and sequence number 0.
    pub fn new(src_mac: MacAddr, dst_mac: MacAddr, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> Self {
        UdpFrame {
            src_mac,
            dst_mac,
            src_ip,
            dst_ip,
            src_port: 0,
            dst_port: 0,
            seq: 0,
            ttl: DEFAULT_TTL,
        }
    }

    /// A frame addressed to an IPv4 multicast group.
    pub fn multicast(src_mac: MacAddr, src_ip: Ipv4Addr, group: Ipv4Addr) -> Self {
        UdpFrame::new(src_mac, multicast_mac(group), src_ip, group)
    }

    /// Set the UDP ports.
    pub fn ports(mut self, src_port: u16, dst_port: u16) -> Self {
        self.src_port = src_port;
        self.dst_port = dst_port;
        self
    }

    /// Set the sequence number.
    pub fn seq(mut self, seq: u16) -> Self {
        self.seq = seq;
        self
    }

    /// Encode the headers followed by `payload`, with a valid IPv4 header checksum.
    ///
    /// # Errors
    ///
    ///  - `InvalidArgument`: `payload` does not fit in a single IPv4 datagram.
    pub fn build(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut frame = self.build_without_checksum(payload)?;
        let csum = ipv4_checksum(&frame[ETH_HLEN..ETH_HLEN + IPV4_HLEN])?;
        frame[ETH_HLEN + 10..ETH_HLEN + 12].copy_from_slice(&csum.to_be_bytes());
        Ok(frame)
    }

    /// Like [`UdpFrame::build`], but leaves the IPv4 checksum zero so that it can be filled in
    /// by checksum offload (the `IP_CSUM` send flag).
    pub fn build_without_checksum(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::InvalidArgument("payload does not fit an IPv4 datagram"));
        }
        let udp_len = (UDP_HLEN + payload.len()) as u16;
        let total_len = (IPV4_HLEN + UDP_HLEN + payload.len()) as u16;

        let mut frame = Vec::with_capacity(HEADERS_LEN + payload.len());
        // ethernet
        frame.extend_from_slice(&self.dst_mac);
        frame.extend_from_slice(&self.src_mac);
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        // ipv4
        frame.push(0x45);
        frame.push(0);
        frame.extend_from_slice(&total_len.to_be_bytes());
        frame.extend_from_slice(&self.seq.to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.push(self.ttl);
        frame.push(IPPROTO_UDP);
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&self.src_ip.octets());
        frame.extend_from_slice(&self.dst_ip.octets());
        // udp, no checksum
        frame.extend_from_slice(&self.src_port.to_be_bytes());
        frame.extend_from_slice(&self.dst_port.to_be_bytes());
        frame.extend_from_slice(&udp_len.to_be_bytes());
        frame.extend_from_slice(&[0, 0]);

        frame.extend_from_slice(payload);
        Ok(frame)
    }
}

/// Encode an Ethernet/IPv4/UDP frame with a valid IPv4 header checksum.
#[allow(clippy::too_many_arguments)]
pub fn build_frame(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u16,
    payload: &[u8],
) -> Result<Vec<u8>> {
    UdpFrame::new(src_mac, dst_mac, src_ip, dst_ip)
        .ports(src_port, dst_port)
        .seq(seq)
        .build(payload)
}

/// A decoded Ethernet/IPv4/UDP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame<'a> {
    /// The addressing of the frame.
    pub header: UdpFrame,
    /// The IPv4 header checksum as found in the frame.
    pub ip_checksum: u16,
    /// The payload following the UDP header.
    pub payload: &'a [u8],
    ip_header: [u8; IPV4_HLEN],
}

impl ParsedFrame<'_> {
    /// Whether the IPv4 header checksum is correct.
    pub fn checksum_valid(&self) -> bool {
        ipv4_checksum(&self.ip_header).map_or(false, |csum| csum == self.ip_checksum)
    }
}

fn be16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

/// Decode a frame produced by [`UdpFrame::build`] (or any Ethernet frame carrying an IPv4 UDP
/// datagram without IP options).
///
/// # Errors
///
///  - `InvalidArgument`: the frame is truncated, or is not IPv4/UDP.
pub fn parse_frame(frame: &[u8]) -> Result<ParsedFrame<'_>> {
    if frame.len() < HEADERS_LEN {
        return Err(Error::InvalidArgument("frame shorter than its headers"));
    }
    if be16(frame, 12) != ETHERTYPE_IPV4 {
        return Err(Error::InvalidArgument("not an IPv4 frame"));
    }
    let ip = &frame[ETH_HLEN..ETH_HLEN + IPV4_HLEN];
    if ip[0] != 0x45 || ip[9] != IPPROTO_UDP {
        return Err(Error::InvalidArgument("not a UDP datagram without IP options"));
    }
    let total_len = usize::from(be16(ip, 2));
    if total_len < IPV4_HLEN + UDP_HLEN || ETH_HLEN + total_len > frame.len() {
        return Err(Error::InvalidArgument("IPv4 total length out of range"));
    }

    let mut ip_header = [0u8; IPV4_HLEN];
    ip_header.copy_from_slice(ip);
    let udp = &frame[ETH_HLEN + IPV4_HLEN..];
    let mut src_mac = [0u8; 6];
    let mut dst_mac = [0u8; 6];
    dst_mac.copy_from_slice(&frame[..6]);
    src_mac.copy_from_slice(&frame[6..12]);

    Ok(ParsedFrame {
        header: UdpFrame {
            src_mac,
            dst_mac,
            src_ip: Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]),
            dst_ip: Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]),
            src_port: be16(udp, 0),
            dst_port: be16(udp, 2),
            seq: be16(ip, 4),
            ttl: ip[8],
        },
        ip_checksum: be16(ip, 10),
        payload: &frame[HEADERS_LEN..ETH_HLEN + total_len],
        ip_header,
    })
}

/// Fill in the IPv4 header checksum of an outgoing frame, as checksum offload does. Frames that
/// do not carry IPv4 are left alone. Returns whether a checksum was written.
pub(crate) fn offload_ipv4_checksum(frame: &mut [u8]) -> bool {
    if frame.len() < ETH_HLEN + IPV4_HLEN || be16(frame, 12) != ETHERTYPE_IPV4 {
        return false;
    }
    match ipv4_checksum(&frame[ETH_HLEN..ETH_HLEN + IPV4_HLEN]) {
        Ok(csum) => {
            frame[ETH_HLEN + 10..ETH_HLEN + 12].copy_from_slice(&csum.to_be_bytes());
            true
        }
        Err(_) => false,
    }
}
