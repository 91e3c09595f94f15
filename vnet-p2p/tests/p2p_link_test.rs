//! End-to-end tests of the point-to-point link
//!
//! Two simulated guests are bound to the ports of one `SockPair`. Each test
//! queues descriptors on the driver side, kicks the switch and inspects what
//! arrived in the other guest's memory.

use std::sync::Arc;

use vnet_p2p::device::{
    STATUS_NEEDS_RESET, VIRTIO_NET_F_GUEST_CSUM, VIRTIO_NET_F_MRG_RXBUF,
    VIRTIO_NET_HDR_F_DATA_VALID, VIRTIO_NET_HDR_F_NEEDS_CSUM, VIRTIO_NET_HDR_SIZE, VirtioNetHdr,
};
use vnet_p2p::irq::CountingIrq;
use vnet_p2p::sock_pair::{PortOp, SockPair};
use vnet_p2p::test_util::GuestPort;
use vnet_p2p::test_util::packets::{
    L4_START, TCP_CSUM_OFFSET, UDP_CSUM_OFFSET, l4_checksum_valid, make_partial, offload_hdr,
    tcp_frame, udp_frame,
};

const GUEST_A_BASE: u64 = 0;
const GUEST_B_BASE: u64 = 0x1000_0000;

/// Ethernet MTU sized receive buffer plus header
const RX_BUF: u32 = 1526;

struct Link {
    sp: SockPair,
    a: GuestPort,
    b: GuestPort,
    del_irq: Arc<CountingIrq>,
}

fn link(features_a: u32, features_b: u32) -> Link {
    let _ = tracing_subscriber::fmt::try_init();

    let del_irq = Arc::new(CountingIrq::new());
    let mut sp = SockPair::new(256, Arc::new(CountingIrq::new()), del_irq.clone());
    let a = GuestPort::connect(&mut sp, GUEST_A_BASE, features_a).expect("connect guest A");
    let b = GuestPort::connect(&mut sp, GUEST_B_BASE, features_b).expect("connect guest B");
    assert_eq!(a.cap().port(), 0);
    assert_eq!(b.cap().port(), 1);

    Link { sp, a, b, del_irq }
}

#[test]
fn test_frame_round_trip() {
    let mut l = link(0, 0);
    let frame = udp_frame(1234, 5678, b"ping from A");

    l.b.post_rx(RX_BUF).unwrap();
    l.a.send(&VirtioNetHdr::default(), &frame).unwrap();
    l.sp.kick();

    let rx = l.b.pop_rx().unwrap().expect("B received nothing");
    assert_eq!(rx.len as usize, VIRTIO_NET_HDR_SIZE + frame.len());
    assert_eq!(rx.frame, frame);
    assert_eq!(rx.hdr.flags, 0);
    assert!(l.b.pop_rx().unwrap().is_none());

    // The transmit chain comes back with a zero length
    let used = l.a.pop_tx().unwrap().expect("A's chain not returned");
    assert_eq!(used.len, 0);

    let stats = l.sp.stats();
    assert_eq!(stats[0].tx_packets, 1);
    assert_eq!(stats[1].rx_packets, 1);
    assert_eq!(stats[1].dropped, 0);
    assert_eq!(l.a.irqs(), 1);
    assert_eq!(l.b.irqs(), 1);
}

#[test]
fn test_both_directions() {
    let mut l = link(0, 0);
    let to_b = udp_frame(1000, 2000, b"to B");
    let to_a = udp_frame(2000, 1000, b"to A, a bit longer");

    l.a.post_rx(RX_BUF).unwrap();
    l.b.post_rx(RX_BUF).unwrap();
    l.a.send(&VirtioNetHdr::default(), &to_b).unwrap();
    l.b.send(&VirtioNetHdr::default(), &to_a).unwrap();
    l.sp.kick();

    assert_eq!(l.b.pop_rx().unwrap().unwrap().frame, to_b);
    assert_eq!(l.a.pop_rx().unwrap().unwrap().frame, to_a);
    assert!(l.a.pop_tx().unwrap().is_some());
    assert!(l.b.pop_tx().unwrap().is_some());
}

#[test]
fn test_segmented_chains() {
    let mut l = link(0, 0);
    let frame = udp_frame(1, 2, &[0x5a; 301]);

    // Odd sized pieces on both sides
    l.b.post_rx_chain(&[20, 100, 33, 1000]).unwrap();
    l.a.send_segmented(&VirtioNetHdr::default(), &frame, 5).unwrap();
    l.sp.kick();

    let used = l.b.pop_rx_buffer().unwrap().expect("B received nothing");
    assert_eq!(used.len as usize, VIRTIO_NET_HDR_SIZE + frame.len());

    // Reassemble from the descriptor layout
    let mut bytes = Vec::new();
    let mut addr = used.token;
    for len in [20u32, 100, 33, 1000] {
        bytes.extend(l.b.read(addr, len as usize).unwrap());
        addr = (addr + len as u64 + 15) & !15;
    }
    assert_eq!(&bytes[VIRTIO_NET_HDR_SIZE..VIRTIO_NET_HDR_SIZE + frame.len()], &frame[..]);
}

#[test]
fn test_checksum_fixed_up_for_receiver_without_offload() {
    let mut l = link(0, 0);
    let payload = b"checksum me, please";
    let mut frame = udp_frame(4000, 4001, payload);
    make_partial(&mut frame, UDP_CSUM_OFFSET);
    assert!(!l4_checksum_valid(&frame));

    l.b.post_rx(RX_BUF).unwrap();
    l.a.send(&offload_hdr(UDP_CSUM_OFFSET), &frame).unwrap();
    l.sp.kick();

    let rx = l.b.pop_rx().unwrap().unwrap();
    assert!(l4_checksum_valid(&rx.frame));
    assert_eq!(
        rx.hdr.flags & (VIRTIO_NET_HDR_F_NEEDS_CSUM | VIRTIO_NET_HDR_F_DATA_VALID),
        0
    );
    assert_eq!(&rx.frame[rx.frame.len() - payload.len()..], payload);
    assert_eq!(l.sp.stats()[1].dropped, 0);
}

#[test]
fn test_checksum_across_small_descriptors() {
    let mut l = link(0, 0);
    let mut frame = tcp_frame(5555, 80, &[0xa5; 123]);
    make_partial(&mut frame, TCP_CSUM_OFFSET);

    // Odd pieces on transmit, uneven ones on receive
    l.b.post_rx_chain(&[13, 29, 1000]).unwrap();
    l.a.send_segmented(&offload_hdr(TCP_CSUM_OFFSET), &frame, 3).unwrap();
    l.sp.kick();

    let used = l.b.pop_rx_buffer().unwrap().unwrap();
    assert_eq!(used.len as usize, VIRTIO_NET_HDR_SIZE + frame.len());

    let mut bytes = l.b.read(used.token, 13).unwrap();
    let second = (used.token + 13 + 15) & !15;
    bytes.extend(l.b.read(second, 29).unwrap());
    let third = (second + 29 + 15) & !15;
    bytes.extend(l.b.read(third, frame.len() + VIRTIO_NET_HDR_SIZE - 42).unwrap());

    assert_eq!(bytes[0] & VIRTIO_NET_HDR_F_NEEDS_CSUM, 0);
    assert!(l4_checksum_valid(&bytes[VIRTIO_NET_HDR_SIZE..]));
}

#[test]
fn test_checksum_left_to_receiver_with_guest_csum() {
    let mut l = link(0, VIRTIO_NET_F_GUEST_CSUM);
    let mut frame = udp_frame(4000, 4001, b"offloaded all the way");
    make_partial(&mut frame, UDP_CSUM_OFFSET);

    l.b.post_rx(RX_BUF).unwrap();
    l.a.send(&offload_hdr(UDP_CSUM_OFFSET), &frame).unwrap();
    l.sp.kick();

    let rx = l.b.pop_rx().unwrap().unwrap();
    assert_eq!(rx.frame, frame);
    assert!(rx.hdr.needs_csum());
    assert_eq!(rx.hdr.csum_start(), L4_START);
    assert_eq!(rx.hdr.csum_offset(), UDP_CSUM_OFFSET);
}

#[test]
fn test_checksum_field_outside_packet() {
    let mut l = link(0, 0);
    let frame = udp_frame(1, 2, b"short");

    let mut hdr = offload_hdr(UDP_CSUM_OFFSET);
    hdr.csum_start = (frame.len() as u16).into();

    l.b.post_rx(RX_BUF).unwrap();
    l.a.send(&hdr, &frame).unwrap();
    l.sp.kick();

    // Forwarded as is, counted as a checksum failure
    let rx = l.b.pop_rx().unwrap().unwrap();
    assert_eq!(rx.frame, frame);
    assert!(rx.hdr.needs_csum());
    assert_eq!(l.sp.stats()[1].dropped, 1);
    assert_eq!(l.sp.stats()[1].rx_packets, 1);
}

/// 60-byte TCP segment with checksum offload into a single MTU buffer.
#[test]
fn test_tcp_offload_into_single_buffer() {
    let mut l = link(0, 0);
    let mut frame = tcp_frame(43210, 80, b"abcdef");
    assert_eq!(frame.len(), 60);
    make_partial(&mut frame, TCP_CSUM_OFFSET);

    l.b.post_rx(RX_BUF).unwrap();
    l.a.send(&offload_hdr(TCP_CSUM_OFFSET), &frame).unwrap();
    l.sp.kick();

    let rx = l.b.pop_rx().unwrap().unwrap();
    assert_eq!(rx.len, 72);
    assert!(l4_checksum_valid(&rx.frame));
    assert_eq!(&rx.frame[..50], &frame[..50]);
    assert_eq!(&rx.frame[52..], &frame[52..]);
    assert_eq!(l.b.irqs(), 1);
}

#[test]
fn test_mergeable_receive_buffers() {
    let mut l = link(0, VIRTIO_NET_F_MRG_RXBUF);
    let frame = udp_frame(7, 8, &[0x42; 1000]);
    let total = VIRTIO_NET_HDR_SIZE + frame.len();
    assert_eq!(total, 1054);

    for _ in 0..4 {
        l.b.post_rx(512).unwrap();
    }
    l.a.send(&VirtioNetHdr::default(), &frame).unwrap();
    l.sp.kick();

    let mut bufs = Vec::new();
    while let Some(used) = l.b.pop_rx_buffer().unwrap() {
        bufs.push(used);
    }
    assert_eq!(bufs.len(), 3);
    assert_eq!(
        bufs.iter().map(|b| b.len).collect::<Vec<_>>(),
        vec![512, 512, 30]
    );

    let mut bytes = Vec::new();
    for used in &bufs {
        bytes.extend(l.b.read(used.token, used.len as usize).unwrap());
    }
    assert_eq!(bytes.len(), total);
    assert_eq!(&bytes[VIRTIO_NET_HDR_SIZE..], &frame[..]);

    let num_buffers = u16::from_le_bytes([bytes[10], bytes[11]]);
    assert_eq!(num_buffers, 3);

    // One burst, one interrupt
    assert_eq!(l.b.irqs(), 1);
    assert_eq!(l.sp.stats()[1].rx_packets, 1);
}

#[test]
fn test_mergeable_single_buffer_sets_count() {
    let mut l = link(0, VIRTIO_NET_F_MRG_RXBUF);
    let frame = udp_frame(7, 8, b"fits");

    l.b.post_rx(RX_BUF).unwrap();
    l.a.send(&VirtioNetHdr::default(), &frame).unwrap();
    l.sp.kick();

    let rx = l.b.pop_rx().unwrap().unwrap();
    assert_eq!(rx.hdr.num_buffers(), 1);
}

/// Reap every used receive buffer and concatenate what was written.
fn drain_rx(port: &mut GuestPort) -> (Vec<u32>, Vec<u8>) {
    let mut lens = Vec::new();
    let mut bytes = Vec::new();
    while let Some(used) = port.pop_rx_buffer().unwrap() {
        bytes.extend(port.read(used.token, used.len as usize).unwrap());
        lens.push(used.len);
    }
    (lens, bytes)
}

#[test]
fn test_merged_packet_resumes_after_more_buffers() {
    let mut l = link(0, VIRTIO_NET_F_MRG_RXBUF);
    let frame = udp_frame(7, 8, &[0x5a; 1000]);

    l.b.post_rx(512).unwrap();
    l.b.post_rx(512).unwrap();
    l.a.send(&VirtioNetHdr::default(), &frame).unwrap();
    l.sp.kick();

    // Ring ran dry part-way: nothing published yet
    assert!(l.b.pop_rx_buffer().unwrap().is_none());
    assert!(l.a.pop_tx().unwrap().is_none());
    assert_eq!(l.b.irqs(), 0);
    assert!(l.b.rx_needs_kick().unwrap());

    l.b.post_rx(512).unwrap();
    l.b.post_rx(512).unwrap();
    l.sp.kick();

    let (lens, bytes) = drain_rx(&mut l.b);
    assert_eq!(lens, vec![512, 512, 30]);
    assert_eq!(&bytes[VIRTIO_NET_HDR_SIZE..], &frame[..]);
    assert_eq!(u16::from_le_bytes([bytes[10], bytes[11]]), 3);
    assert_eq!(l.b.irqs(), 1);
    assert!(l.a.pop_tx().unwrap().is_some());
    assert_eq!(l.sp.stats()[1].rx_packets, 1);
}

#[test]
fn test_checksum_fixed_in_later_merged_buffer() {
    let mut l = link(0, VIRTIO_NET_F_MRG_RXBUF);
    let mut frame = udp_frame(4000, 4001, &[0x3c; 50]);
    assert_eq!(VIRTIO_NET_HDR_SIZE + frame.len(), 104);
    make_partial(&mut frame, UDP_CSUM_OFFSET);

    // Checksum field at byte 52 of the stream, inside the fourth buffer
    for _ in 0..8 {
        l.b.post_rx(16).unwrap();
    }
    l.a.send(&offload_hdr(UDP_CSUM_OFFSET), &frame).unwrap();
    l.sp.kick();

    let (lens, bytes) = drain_rx(&mut l.b);
    assert_eq!(lens, vec![16, 16, 16, 16, 16, 16, 8]);
    assert_eq!(bytes[0] & VIRTIO_NET_HDR_F_NEEDS_CSUM, 0);
    assert_eq!(u16::from_le_bytes([bytes[10], bytes[11]]), 7);

    let received = &bytes[VIRTIO_NET_HDR_SIZE..];
    assert!(l4_checksum_valid(received));
    let field = (L4_START + UDP_CSUM_OFFSET) as usize;
    assert_eq!(&received[..field], &frame[..field]);
    assert_eq!(&received[field + 2..], &frame[field + 2..]);
    assert_eq!(l.b.irqs(), 1);
}

#[test]
fn test_merge_depth_exceeded_drops_whole_packet() {
    let mut l = link(0, VIRTIO_NET_F_MRG_RXBUF);
    let frame = udp_frame(9, 10, &[0x77; 4958]);
    assert_eq!(frame.len(), 5000);

    // The whole ring holds 4096 bytes
    let first = l.b.post_rx(16).unwrap();
    for _ in 1..256 {
        l.b.post_rx(16).unwrap();
    }
    l.a.send(&VirtioNetHdr::default(), &frame).unwrap();
    l.sp.kick();

    let mut lens = Vec::new();
    while let Some(used) = l.b.pop_rx_buffer().unwrap() {
        lens.push(used.len);
    }
    assert_eq!(lens.len(), 256);
    assert!(lens.iter().all(|&len| len == 0));

    let hdr = l.b.read(first, VIRTIO_NET_HDR_SIZE).unwrap();
    assert_eq!(hdr[0], 0);
    assert_eq!(u16::from_le_bytes([hdr[10], hdr[11]]), 256);

    assert!(l.a.pop_tx().unwrap().is_some());
    assert_eq!(l.b.irqs(), 1);
    let stats = l.sp.stats();
    assert_eq!(stats[1].dropped, 1);
    assert_eq!(stats[1].rx_packets, 0);
}

#[test]
fn test_oversized_packet_truncated_without_merge() {
    let mut l = link(0, 0);
    let frame = udp_frame(9, 10, &[0x11; 200]);

    l.b.post_rx(100).unwrap();
    l.a.send(&offload_hdr(UDP_CSUM_OFFSET), &frame).unwrap();
    l.sp.kick();

    let rx = l.b.pop_rx().unwrap().expect("buffer not returned");
    assert_eq!(rx.len, 0);
    assert_eq!(rx.hdr.flags, 0);
    assert!(l.a.pop_tx().unwrap().is_some());

    let stats = l.sp.stats();
    assert_eq!(stats[1].dropped, 1);
    assert_eq!(stats[1].rx_packets, 0);

    // The link keeps working afterwards
    let small = udp_frame(9, 10, b"ok");
    l.b.post_rx(RX_BUF).unwrap();
    l.a.send(&VirtioNetHdr::default(), &small).unwrap();
    l.sp.kick();
    assert_eq!(l.b.pop_rx().unwrap().unwrap().frame, small);
}

#[test]
fn test_receive_buffer_shorter_than_header_dropped() {
    let mut l = link(0, 0);
    let frame = udp_frame(1, 2, b"x");

    l.b.post_rx(8).unwrap();
    l.b.post_rx(RX_BUF).unwrap();
    l.a.send(&VirtioNetHdr::default(), &frame).unwrap();
    l.sp.kick();

    let first = l.b.pop_rx_buffer().unwrap().unwrap();
    assert_eq!(first.len, 0);
    let second = l.b.pop_rx().unwrap().unwrap();
    assert_eq!(second.frame, frame);
    assert_eq!(l.sp.stats()[1].dropped, 1);
}

#[test]
fn test_bad_transmit_descriptor_isolated() {
    let mut l = link(0, 0);

    // Valid header, frame descriptor outside of A's memory
    let hdr_addr = l.a.alloc(VIRTIO_NET_HDR_SIZE).unwrap();
    l.a.write(hdr_addr, &[0u8; VIRTIO_NET_HDR_SIZE]).unwrap();
    let outside = l.a.end() + 0x1000;

    l.b.post_rx(RX_BUF).unwrap();
    l.a
        .send_raw(&[(hdr_addr, VIRTIO_NET_HDR_SIZE as u32), (outside, 64)], hdr_addr)
        .unwrap();
    l.sp.kick();

    // A is asked for a reset; the chain is never returned
    assert_ne!(l.a.status(&mut l.sp).unwrap() & STATUS_NEEDS_RESET, 0);
    assert!(l.a.pop_tx().unwrap().is_none());

    // B gets back what was already copied
    let used = l.b.pop_rx_buffer().unwrap().expect("partial buffer not published");
    assert_eq!(used.len as usize, VIRTIO_NET_HDR_SIZE);

    // A's receive side and B's transmit side are unaffected
    let frame = udp_frame(3, 4, b"still alive");
    l.a.post_rx(RX_BUF).unwrap();
    l.b.send(&VirtioNetHdr::default(), &frame).unwrap();
    l.sp.kick();
    assert_eq!(l.a.pop_rx().unwrap().unwrap().frame, frame);
    assert_eq!(l.b.status(&mut l.sp).unwrap() & STATUS_NEEDS_RESET, 0);
}

#[test]
fn test_bad_receive_descriptor_isolated() {
    let mut l = link(0, 0);
    let frame = udp_frame(5, 6, b"nowhere to go");

    let outside = l.b.end() + 0x1000;
    l.b.post_rx(RX_BUF).unwrap();
    l.a.send(&VirtioNetHdr::default(), &frame).unwrap();
    // Corrupt B's posted descriptor
    let desc = l.b.queue_config(0).desc_addr;
    l.b.write(desc, &outside.to_le_bytes()).unwrap();
    l.sp.kick();

    assert_ne!(l.b.status(&mut l.sp).unwrap() & STATUS_NEEDS_RESET, 0);
    // A's chain is handed back
    assert!(l.a.pop_tx().unwrap().is_some());
    assert_eq!(l.a.status(&mut l.sp).unwrap() & STATUS_NEEDS_RESET, 0);
}

#[test]
fn test_transmit_waits_for_receive_buffer() {
    let mut l = link(0, 0);
    let frame = udp_frame(11, 12, b"waiting");

    l.a.send(&VirtioNetHdr::default(), &frame).unwrap();
    l.sp.kick();
    assert!(l.a.pop_tx().unwrap().is_none());

    // Notifications are back on, so B's kick reaches the switch
    assert!(l.b.rx_needs_kick().unwrap());
    assert!(l.a.tx_needs_kick().unwrap());

    l.b.post_rx(RX_BUF).unwrap();
    l.sp.kick();
    assert_eq!(l.b.pop_rx().unwrap().unwrap().frame, frame);
    assert!(l.a.pop_tx().unwrap().is_some());
}

#[test]
fn test_receive_buffer_waits_for_transmit() {
    let mut l = link(0, 0);
    let frame = udp_frame(13, 14, b"late sender");

    l.b.post_rx(RX_BUF).unwrap();
    l.sp.kick();
    assert!(l.b.pop_rx().unwrap().is_none());
    assert!(l.a.tx_needs_kick().unwrap());

    l.a.send(&VirtioNetHdr::default(), &frame).unwrap();
    l.sp.kick();
    assert_eq!(l.b.pop_rx().unwrap().unwrap().frame, frame);
}

#[test]
fn test_irq_suppressed_by_guest() {
    let mut l = link(0, 0);
    l.b.suppress_rx_irq().unwrap();

    l.b.post_rx(RX_BUF).unwrap();
    l.a.send(&VirtioNetHdr::default(), &udp_frame(1, 2, b"quiet")).unwrap();
    l.sp.kick();

    assert!(l.b.pop_rx().unwrap().is_some());
    assert_eq!(l.b.irqs(), 0);
    assert_eq!(l.a.irqs(), 1);
}

#[test]
fn test_many_packets_in_one_kick() {
    let mut l = link(0, 0);
    for i in 0..32u16 {
        l.b.post_rx(RX_BUF).unwrap();
        l.a.send(&VirtioNetHdr::default(), &udp_frame(i, i, &[i as u8; 17]))
            .unwrap();
    }
    l.sp.kick();

    for i in 0..32u16 {
        let rx = l.b.pop_rx().unwrap().expect("packet missing");
        assert_eq!(rx.frame, udp_frame(i, i, &[i as u8; 17]));
    }
    assert_eq!(l.sp.stats()[1].rx_packets, 32);
}

#[test]
fn test_peer_reset_returns_inflight_chain() {
    let mut l = link(0, 0);
    l.a.send(&VirtioNetHdr::default(), &udp_frame(1, 2, b"stuck")).unwrap();
    l.sp.kick();
    assert!(l.a.pop_tx().unwrap().is_none());

    l.sp.port_op(l.b.cap(), PortOp::SetStatus(0)).unwrap();
    assert_eq!(l.b.status(&mut l.sp).unwrap(), 0);
    assert!(l.a.pop_tx().unwrap().is_some());
}

#[test]
fn test_disconnected_client_reclaimed() {
    let mut l = link(0, 0);
    drop(l.b);
    assert_eq!(l.del_irq.take(), 1);
    assert_eq!(l.sp.reclaim_clients(), 1);
    assert!(l.sp.port(1).unwrap().available());

    // Traffic towards the empty port just waits
    l.a.send(&VirtioNetHdr::default(), &udp_frame(1, 2, b"hello?")).unwrap();
    l.sp.kick();
    assert!(l.a.pop_tx().unwrap().is_none());

    // A new client takes the port and receives the pending frame
    let mut c = GuestPort::connect(&mut l.sp, GUEST_B_BASE, 0).unwrap();
    assert_eq!(c.cap().port(), 1);
    c.post_rx(RX_BUF).unwrap();
    l.sp.kick();
    assert_eq!(c.pop_rx().unwrap().unwrap().frame, udp_frame(1, 2, b"hello?"));
}

#[test]
fn test_transmit_chain_shorter_than_header_dropped() {
    let mut l = link(0, 0);
    let frame = udp_frame(1, 2, b"after the runt");

    let runt = l.a.alloc(8).unwrap();
    l.a.send_raw(&[(runt, 8)], runt).unwrap();
    l.a.send(&VirtioNetHdr::default(), &frame).unwrap();
    l.b.post_rx(RX_BUF).unwrap();
    l.sp.kick();

    let first = l.a.pop_tx().unwrap().unwrap();
    assert_eq!(first.token, runt);
    assert_eq!(l.b.pop_rx().unwrap().unwrap().frame, frame);
    assert_eq!(l.sp.stats()[0].dropped, 1);
    assert_eq!(l.sp.stats()[0].tx_packets, 1);
}
