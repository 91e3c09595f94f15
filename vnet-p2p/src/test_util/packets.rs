//! Frame builders for integration tests
//!
//! Uses smoltcp for Ethernet/IPv4/UDP construction and for checksum
//! verification on the receiving side.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, IpAddress, IpProtocol,
    Ipv4Address, Ipv4Packet, Ipv4Repr, TcpPacket, UdpPacket, UdpRepr,
};
use vm_memory::Le16;

use crate::checksum::NetChecksum;
use crate::device::{VIRTIO_NET_HDR_F_NEEDS_CSUM, VirtioNetHdr};

/// Ethernet header size
pub const ETHERNET_HDR_SIZE: usize = 14;

/// IP header size (without options)
pub const IP_HDR_SIZE: usize = 20;

/// UDP header size
pub const UDP_HDR_SIZE: usize = 8;

/// TCP header size (without options)
pub const TCP_HDR_SIZE: usize = 20;

/// Where the transport header starts in a frame
pub const L4_START: u16 = (ETHERNET_HDR_SIZE + IP_HDR_SIZE) as u16;

/// Checksum field offsets inside the transport header
pub const UDP_CSUM_OFFSET: u16 = 6;
pub const TCP_CSUM_OFFSET: u16 = 16;

pub const GUEST_A_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x00, 0x00, 0x01];
pub const GUEST_B_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x00, 0x00, 0x02];
pub const GUEST_A_IP: [u8; 4] = [10, 0, 0, 1];
pub const GUEST_B_IP: [u8; 4] = [10, 0, 0, 2];

fn ipv4(a: [u8; 4]) -> Ipv4Address {
    Ipv4Address::new(a[0], a[1], a[2], a[3])
}

/// Ethernet + IPv4 headers for an L4 payload of `l4_len` bytes.
fn ip_frame(protocol: IpProtocol, l4_len: usize) -> (Vec<u8>, Ipv4Repr) {
    let mut frame = vec![0u8; ETHERNET_HDR_SIZE + IP_HDR_SIZE + l4_len];

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(GUEST_A_MAC),
        dst_addr: EthernetAddress(GUEST_B_MAC),
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut frame[..]);
    eth_repr.emit(&mut eth_frame);

    let ip_repr = Ipv4Repr {
        src_addr: ipv4(GUEST_A_IP),
        dst_addr: ipv4(GUEST_B_IP),
        next_header: protocol,
        payload_len: l4_len,
        hop_limit: 64,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
    ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());

    (frame, ip_repr)
}

/// A UDP frame with a complete checksum.
pub fn udp_frame(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let (mut frame, ip_repr) = ip_frame(IpProtocol::Udp, UDP_HDR_SIZE + payload.len());

    let udp_repr = UdpRepr { src_port, dst_port };
    let mut udp_packet = UdpPacket::new_unchecked(&mut frame[L4_START as usize..]);
    udp_repr.emit(
        &mut udp_packet,
        &ip_repr.src_addr.into(),
        &ip_repr.dst_addr.into(),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &ChecksumCapabilities::default(),
    );

    frame
}

/// A TCP segment (PSH|ACK, no options) with a complete checksum.
pub fn tcp_frame(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let (mut frame, _) = ip_frame(IpProtocol::Tcp, TCP_HDR_SIZE + payload.len());

    let tcp = &mut frame[L4_START as usize..];
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[4..8].copy_from_slice(&1000u32.to_be_bytes()); // seq
    tcp[8..12].copy_from_slice(&2000u32.to_be_bytes()); // ack
    tcp[12] = (TCP_HDR_SIZE as u8 / 4) << 4;
    tcp[13] = 0x18; // PSH | ACK
    tcp[14..16].copy_from_slice(&0xffffu16.to_be_bytes()); // window
    tcp[TCP_HDR_SIZE..].copy_from_slice(payload);

    let mut csum = NetChecksum::new();
    csum.add(&pseudo_header(IpProtocol::Tcp, tcp.len()));
    csum.add(tcp);
    let field = TCP_CSUM_OFFSET as usize;
    tcp[field..field + 2].copy_from_slice(&csum.finalize().to_be_bytes());

    frame
}

fn pseudo_header(protocol: IpProtocol, l4_len: usize) -> [u8; 12] {
    let mut ph = [0u8; 12];
    ph[0..4].copy_from_slice(&GUEST_A_IP);
    ph[4..8].copy_from_slice(&GUEST_B_IP);
    ph[9] = u8::from(protocol);
    ph[10..12].copy_from_slice(&(l4_len as u16).to_be_bytes());
    ph
}

/// Turn a finished frame into what an offloading guest hands over: the
/// transport checksum field holds only the pseudo-header sum.
pub fn make_partial(frame: &mut [u8], csum_offset: u16) {
    let protocol = IpProtocol::from(frame[ETHERNET_HDR_SIZE + 9]);
    let l4_len = frame.len() - L4_START as usize;

    let mut csum = NetChecksum::new();
    csum.add(&pseudo_header(protocol, l4_len));

    let field = (L4_START + csum_offset) as usize;
    frame[field..field + 2].copy_from_slice(&csum.folded().to_be_bytes());
}

/// Header asking the device to finish the transport checksum.
pub fn offload_hdr(csum_offset: u16) -> VirtioNetHdr {
    VirtioNetHdr {
        flags: VIRTIO_NET_HDR_F_NEEDS_CSUM,
        csum_start: Le16::from(L4_START),
        csum_offset: Le16::from(csum_offset),
        ..Default::default()
    }
}

/// Check the UDP or TCP checksum of an Ethernet/IPv4 frame.
pub fn l4_checksum_valid(frame: &[u8]) -> bool {
    let Ok(eth) = EthernetFrame::new_checked(frame) else {
        return false;
    };
    let Ok(ip) = Ipv4Packet::new_checked(eth.payload()) else {
        return false;
    };
    let src = IpAddress::Ipv4(ip.src_addr());
    let dst = IpAddress::Ipv4(ip.dst_addr());

    match ip.next_header() {
        IpProtocol::Udp => UdpPacket::new_checked(ip.payload())
            .map(|p| p.checksum() != 0 && p.verify_checksum(&src, &dst))
            .unwrap_or(false),
        IpProtocol::Tcp => TcpPacket::new_checked(ip.payload())
            .map(|p| p.verify_checksum(&src, &dst))
            .unwrap_or(false),
        _ => false,
    }
}
