//! Minimal IPv6 endpoint for the `usbnet` link.
//!
//! The device is the host's only on-link peer: it answers neighbour and
//! router discovery on its own, replies to echo requests, terminates TCP
//! and hands byte streams to small in-crate services (HTTP, echo, discard,
//! chargen). Frames move between the link and the stack as pooled buffers;
//! replies are built in place in the received buffer wherever possible.
//!
//! All protocol entry points are synchronous and take `now` explicitly;
//! [`Stack::run`] is a thin async loop around them.

#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod diag;
pub mod http;
mod icmpv6;
pub mod tcp;
pub mod wire;

use embassy_futures::select::{select, Either};
use embassy_time::{Instant, Timer};

use usbnet::{LinkHandle, PacketBox, PacketPool};

use tcp::{ConnState, Endpoint, Event};
use wire::{Frame, Ipv6Addr, MacAddr, ETHERTYPE_IPV6, IP_HEADER_SIZE, IP_NEXTHDR_ICMP6, IP_NEXTHDR_TCP};

pub use http::Httpd;
pub use tcp::{
    ConnCtx, ConnState as TcpState, Service, TcpIo, MAX_CONNECTIONS, MAX_LISTENERS, MAX_PAYLOAD,
    TCP_WINDOW,
};

/// MAC handed to the host-side adapter (ECM MAC string, RNDIS 802.3 OIDs).
/// Distinct from the device's own serial-derived MAC.
pub const HOST_MAC: MacAddr = MacAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);

/// Everything derived from the 32-bit serial number.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Identity {
    pub serial: u32,
    pub mac: MacAddr,
    /// Site-local style address the host routes to.
    pub addr: Ipv6Addr,
    pub link_local: Ipv6Addr,
}

impl Identity {
    pub fn from_serial(serial: u32) -> Self {
        let s = serial.to_be_bytes();
        let mac = MacAddr([0xDE, s[0], s[1], s[2], s[3], 0xCC]);

        let mut addr = [0u8; 16];
        addr[1] = 0xFD;
        addr[3] = 0xDE;
        addr[5] = s[0];
        addr[7] = s[1];
        addr[9] = s[2];
        addr[11] = s[3];
        addr[15] = 0x01;

        Self {
            serial,
            mac,
            addr: Ipv6Addr(addr),
            link_local: Ipv6Addr::link_local(mac),
        }
    }
}

/// Link handle plus local identity; what the protocol modules send through.
pub struct Interface<'d> {
    pub(crate) link: LinkHandle<'d>,
    pub(crate) pool: &'static PacketPool,
    pub(crate) ident: Identity,
}

impl<'d> Interface<'d> {
    pub(crate) fn is_ours(&self, addr: Ipv6Addr) -> bool {
        addr == self.ident.addr || addr == self.ident.link_local
    }

    pub(crate) fn transmit(&self, frame: PacketBox) {
        self.link.transmit(frame);
    }
}

/// The stack: one interface, the TCP endpoint, the HTTP router and the
/// advertisement beacons.
pub struct Stack<'d> {
    iface: Interface<'d>,
    tcp: Endpoint,
    http: Httpd,
    beacons: icmpv6::Beacons,
}

impl<'d> Stack<'d> {
    pub fn new(link: LinkHandle<'d>, pool: &'static PacketPool, serial: u32) -> Self {
        let ident = Identity::from_serial(serial);
        Self {
            iface: Interface { link, pool, ident },
            tcp: Endpoint::new(),
            http: Httpd::new(),
            beacons: icmpv6::Beacons::new(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.iface.ident
    }

    /// Registers a TCP listener. A full table logs and drops the request.
    pub fn listen(&mut self, port: u16, service: Service) {
        self.tcp.listen(port, service);
    }

    /// Echo, discard and chargen on their well-known ports.
    pub fn register_diagnostics(&mut self) {
        self.listen(7, Service::Echo);
        self.listen(9, Service::Discard);
        self.listen(19, Service::Chargen);
    }

    /// HTTP on port 80 with the index page routed.
    pub fn serve_http(&mut self) {
        self.listen(80, Service::Http);
        self.http.route("/", http::index);
    }

    /// URL table, for registering more routes.
    pub fn http_mut(&mut self) -> &mut Httpd {
        &mut self.http
    }

    /// Inbound dispatch for one Ethernet frame.
    pub fn handle_frame(&mut self, mut packet: PacketBox, now: Instant) {
        if packet.len() < IP_HEADER_SIZE {
            trace!("runt frame ({} bytes)", packet.len());
            return;
        }
        {
            let f = Frame::new(&packet[..]);
            if f.ethertype() != ETHERTYPE_IPV6 {
                trace!("ignoring ethertype {:04x}", f.ethertype());
                return;
            }
        }

        let declared = IP_HEADER_SIZE + Frame::new(&packet[..]).ipv6_payload_len() as usize;
        if packet.len() > declared {
            // Ethernet padding past the IPv6 payload.
            packet.set_len(declared);
        } else if packet.len() < declared {
            warn!("frame shorter than its declared IPv6 payload, dropping");
            return;
        }

        match Frame::new(&packet[..]).next_header() {
            IP_NEXTHDR_ICMP6 => icmpv6::handle(&self.iface, packet),
            IP_NEXTHDR_TCP => {
                let events = self.tcp.handle(&self.iface, packet, now);
                self.dispatch(events, now);
            }
            other => trace!("ignoring next-header {}", other),
        }
    }

    /// Periodic work: connection callbacks, pending ACKs, stale-connection
    /// reaping, advertisement beacons.
    pub fn poll(&mut self, now: Instant) {
        for slot in 0..MAX_CONNECTIONS {
            if self.tcp.conns[slot].state == ConnState::Established {
                self.dispatch_one(slot, Event::Poll, now);
                let events = self.tcp.finish_poll(&self.iface, slot, now);
                self.dispatch(events, now);
            }
        }
        self.beacons.poll(&self.iface, now);
    }

    /// Drives the stack forever: waits for frames, polls connections and
    /// beacons. Everything is gated on the link being up, like the frames
    /// themselves.
    pub async fn run(&mut self) -> ! {
        loop {
            let link = self.iface.link;
            match select(link.receive(), Timer::after_millis(10)).await {
                Either::First(frame) => {
                    if link.is_up() {
                        self.handle_frame(frame, Instant::now());
                        while let Some(frame) = link.try_receive() {
                            self.handle_frame(frame, Instant::now());
                        }
                    }
                }
                Either::Second(()) => {}
            }
            if link.is_up() {
                self.poll(Instant::now());
            }
        }
    }

    fn dispatch(&mut self, events: tcp::Events, now: Instant) {
        for (slot, event) in events {
            self.dispatch_one(slot, event, now);
        }
    }

    fn dispatch_one(&mut self, slot: usize, event: Event, now: Instant) {
        // A `Closed` event carries the wire-level close with it, after any
        // preceding `Data` has been delivered (so a service may still answer
        // the final bytes before the FIN-ACK goes out).
        if matches!(event, Event::Closed) {
            self.tcp.close(&self.iface, slot, now);
        }
        let service = self.tcp.conns[slot].service;
        let mut io = TcpIo {
            iface: &self.iface,
            conn: &mut self.tcp.conns[slot],
            now,
        };
        match service {
            Service::Echo => diag::echo(&mut io, event),
            Service::Discard => diag::discard(&mut io, event),
            Service::Chargen => diag::chargen(&mut io, event),
            Service::Http => http::service(&self.http, &mut io, event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usbnet::{LinkState, PacketPool, State, PACKET_SIZE};
    use wire::{
        fold_sum, ip_sum, ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_ECHO_REQUEST,
        ICMP_TYPE_NEIGHBOR_ADVERTISEMENT, ICMP_TYPE_NEIGHBOR_SOLICITATION,
        ICMP_TYPE_ROUTER_ADVERTISEMENT, ICMP_TYPE_ROUTER_SOLICITATION, TCPIP_HEADER_SIZE,
        TCP_ACK, TCP_FIN, TCP_HEADER_SIZE, TCP_RST, TCP_SYN,
    };

    const SERIAL: u32 = 0x1122_3344;

    struct Fixture {
        pool: &'static PacketPool,
        link: LinkHandle<'static>,
        stack: Stack<'static>,
    }

    fn fixture() -> Fixture {
        let pool: &'static PacketPool = Box::leak(Box::new(PacketPool::new()));
        let state: &'static State<'static> = Box::leak(Box::new(State::new(pool)));
        let link = state.link();
        link.set_state(LinkState::Ecm);
        let stack = Stack::new(link, pool, SERIAL);
        Fixture { pool, link, stack }
    }

    fn t(us: u64) -> Instant {
        Instant::from_micros(us)
    }

    fn host_ll() -> Ipv6Addr {
        Ipv6Addr::link_local(HOST_MAC)
    }

    fn ip_frame(
        pool: &'static PacketPool,
        next_header: u8,
        src: Ipv6Addr,
        dst: Ipv6Addr,
        payload: &[u8],
    ) -> PacketBox {
        let mut packet = pool.allocate(PACKET_SIZE).unwrap();
        packet.set_len(IP_HEADER_SIZE + payload.len());
        {
            let mut f = Frame::new(&mut packet[..]);
            f.set_eth_dest(MacAddr::BROADCAST);
            f.set_eth_source(HOST_MAC);
            f.set_ethertype(ETHERTYPE_IPV6);
            f.set_version_class();
            f.set_ipv6_payload_len(payload.len() as u16);
            f.set_next_header(next_header);
            f.set_hop_limit(64);
            f.set_ipv6_source(src);
            f.set_ipv6_dest(dst);
        }
        packet[IP_HEADER_SIZE..].copy_from_slice(payload);
        packet
    }

    #[allow(clippy::too_many_arguments)]
    fn tcp_frame(
        pool: &'static PacketPool,
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        control: u16,
        data: &[u8],
        dst: Ipv6Addr,
    ) -> PacketBox {
        let mut seg = vec![0u8; TCP_HEADER_SIZE + data.len()];
        seg[0..2].copy_from_slice(&src_port.to_be_bytes());
        seg[2..4].copy_from_slice(&dst_port.to_be_bytes());
        seg[4..8].copy_from_slice(&seq.to_be_bytes());
        seg[8..12].copy_from_slice(&ack.to_be_bytes());
        seg[12..14].copy_from_slice(&(0x5000 | control).to_be_bytes());
        seg[14..16].copy_from_slice(&0xFFFFu16.to_be_bytes());
        seg[TCP_HEADER_SIZE..].copy_from_slice(data);
        ip_frame(pool, IP_NEXTHDR_TCP, host_ll(), dst, &seg)
    }

    fn checksum_ok(frame: &[u8]) -> bool {
        let payload_len =
            u16::from_be_bytes([frame[18], frame[19]]) as usize;
        let mut sum = ip_sum(&frame[22..54]);
        sum += ip_sum(&frame[18..20]);
        sum += frame[20] as u32;
        sum += ip_sum(&frame[54..54 + payload_len]);
        fold_sum(sum) == 0
    }

    /// SYN/SYN-ACK exchange; returns the device's next sequence number.
    fn handshake(fix: &mut Fixture, port: u16, host_seq: u32, now: Instant) -> u32 {
        let ident = *fix.stack.identity();
        let syn = tcp_frame(fix.pool, 40000, port, host_seq, 0, TCP_SYN, &[], ident.addr);
        fix.stack.handle_frame(syn, now);
        let syn_ack = fix.link.dequeue_tx().expect("no SYN-ACK");
        let f = Frame::new(&syn_ack[..]);
        assert_eq!(f.tcp_control() & (TCP_SYN | TCP_ACK), TCP_SYN | TCP_ACK);
        assert_eq!(f.tcp_ack(), host_seq.wrapping_add(1));
        f.tcp_sequence().wrapping_add(1)
    }

    fn drain(fix: &Fixture) {
        while fix.link.dequeue_tx().is_some() {}
    }

    #[test]
    fn identity_from_serial() {
        let ident = Identity::from_serial(SERIAL);
        assert_eq!(ident.mac, MacAddr([0xDE, 0x11, 0x22, 0x33, 0x44, 0xCC]));
        assert_eq!(
            ident.addr,
            Ipv6Addr([0, 0xFD, 0, 0xDE, 0, 0x11, 0, 0x22, 0, 0x33, 0, 0x44, 0, 0, 0, 1])
        );
        assert_eq!(ident.link_local.0[0], 0xFE);
        assert_eq!(ident.link_local.0[1], 0x80);
        assert_eq!(&ident.link_local.0[10..], &ident.mac.0);
    }

    #[test]
    fn ping_gets_echo_reply() {
        let mut fix = fixture();
        let ident = *fix.stack.identity();

        let mut icmp = vec![ICMP_TYPE_ECHO_REQUEST, 0, 0, 0, 0xAB, 0xCD, 0x00, 0x01];
        icmp.extend_from_slice(b"abcdefgh");
        let frame = ip_frame(fix.pool, wire::IP_NEXTHDR_ICMP6, host_ll(), ident.addr, &icmp);
        fix.stack.handle_frame(frame, t(1_000));

        let reply = fix.link.dequeue_tx().expect("no echo reply");
        let f = Frame::new(&reply[..]);
        assert_eq!(f.icmp_type(), ICMP_TYPE_ECHO_REPLY);
        assert_eq!(f.ipv6_source(), ident.addr);
        assert_eq!(f.ipv6_dest(), host_ll());
        assert_eq!(f.eth_dest(), HOST_MAC);
        assert_eq!(f.eth_source(), ident.mac);
        // Identifier, sequence and payload come back verbatim.
        assert_eq!(&reply[58..62], &[0xAB, 0xCD, 0x00, 0x01]);
        assert_eq!(&reply[62..70], b"abcdefgh");
        assert!(checksum_ok(&reply[..]));
    }

    #[test]
    fn echo_request_for_foreign_address_is_dropped() {
        let mut fix = fixture();
        let foreign = Ipv6Addr([0x20; 16]);
        let icmp = [ICMP_TYPE_ECHO_REQUEST, 0, 0, 0, 0, 0, 0, 0];
        let frame = ip_frame(fix.pool, wire::IP_NEXTHDR_ICMP6, host_ll(), foreign, &icmp);
        fix.stack.handle_frame(frame, t(1_000));
        assert!(fix.link.dequeue_tx().is_none());
    }

    #[test]
    fn neighbor_solicitation_gets_advertisement() {
        let mut fix = fixture();
        let ident = *fix.stack.identity();

        let mut ns = vec![ICMP_TYPE_NEIGHBOR_SOLICITATION, 0, 0, 0, 0, 0, 0, 0];
        ns.extend_from_slice(&ident.addr.0);
        ns.extend_from_slice(&[1, 1]);
        ns.extend_from_slice(&HOST_MAC.0);
        let frame = ip_frame(fix.pool, wire::IP_NEXTHDR_ICMP6, host_ll(), ident.addr, &ns);
        fix.stack.handle_frame(frame, t(1_000));

        let na = fix.link.dequeue_tx().expect("no NA");
        let f = Frame::new(&na[..]);
        assert_eq!(f.icmp_type(), ICMP_TYPE_NEIGHBOR_ADVERTISEMENT);
        assert_eq!(na[58], 0x60); // solicited + override
        assert_eq!(&na[62..78], &ident.addr.0); // target
        assert_eq!(na[78], 2); // target link-layer address option
        assert_eq!(na[79], 1);
        assert_eq!(&na[80..86], &ident.mac.0);
        assert!(checksum_ok(&na[..]));
    }

    #[test]
    fn link_local_solicitation_advertises_link_local() {
        let mut fix = fixture();
        let ident = *fix.stack.identity();

        let mut ns = vec![ICMP_TYPE_NEIGHBOR_SOLICITATION, 0, 0, 0, 0, 0, 0, 0];
        ns.extend_from_slice(&ident.link_local.0);
        let frame = ip_frame(fix.pool, wire::IP_NEXTHDR_ICMP6, host_ll(), ident.link_local, &ns);
        fix.stack.handle_frame(frame, t(1_000));

        let na = fix.link.dequeue_tx().expect("no NA");
        assert_eq!(&na[62..78], &ident.link_local.0);
    }

    #[test]
    fn solicitation_for_foreign_target_is_dropped() {
        let mut fix = fixture();
        let ident = *fix.stack.identity();

        let mut ns = vec![ICMP_TYPE_NEIGHBOR_SOLICITATION, 0, 0, 0, 0, 0, 0, 0];
        ns.extend_from_slice(&[0x99; 16]);
        let frame = ip_frame(fix.pool, wire::IP_NEXTHDR_ICMP6, host_ll(), ident.addr, &ns);
        fix.stack.handle_frame(frame, t(1_000));
        assert!(fix.link.dequeue_tx().is_none());
    }

    #[test]
    fn router_solicitation_gets_advertisement() {
        let mut fix = fixture();
        let ident = *fix.stack.identity();

        let rs = [ICMP_TYPE_ROUTER_SOLICITATION, 0, 0, 0, 0, 0, 0, 0];
        let frame = ip_frame(fix.pool, wire::IP_NEXTHDR_ICMP6, host_ll(), ident.addr, &rs);
        fix.stack.handle_frame(frame, t(1_000));

        let ra = fix.link.dequeue_tx().expect("no RA");
        let f = Frame::new(&ra[..]);
        assert_eq!(f.icmp_type(), ICMP_TYPE_ROUTER_ADVERTISEMENT);
        assert_eq!(f.ipv6_source(), ident.link_local);
        assert_eq!(f.hop_limit(), 255);
        assert_eq!(u16::from_be_bytes([ra[60], ra[61]]), 3600); // lifetime
        assert_eq!(ra[72], 64); // prefix length
        assert_eq!(ra[73], 0xC0); // on-link + autonomous
        let mut prefix = ident.addr.0;
        prefix[8..].fill(0);
        assert_eq!(&ra[86..102], &prefix);
        assert_eq!(
            u32::from_be_bytes([ra[106], ra[107], ra[108], ra[109]]),
            PACKET_SIZE as u32
        ); // MTU option
        assert!(checksum_ok(&ra[..]));
    }

    #[test]
    fn beacon_cadence_speeds_then_slows() {
        let mut fix = fixture();

        // Nothing within the first second of uptime.
        fix.stack.poll(t(500_000));
        assert!(fix.link.dequeue_tx().is_none());

        // RA first; the NA beacon waits until the queue drains.
        fix.stack.poll(t(1_100_000));
        let ra = fix.link.dequeue_tx().expect("no RA beacon");
        assert_eq!(Frame::new(&ra[..]).icmp_type(), ICMP_TYPE_ROUTER_ADVERTISEMENT);
        assert_eq!(Frame::new(&ra[..]).eth_dest(), MacAddr::BROADCAST);
        assert!(fix.link.dequeue_tx().is_none());
        drop(ra);

        fix.stack.poll(t(1_150_000));
        let na = fix.link.dequeue_tx().expect("no NA beacon");
        assert_eq!(Frame::new(&na[..]).icmp_type(), ICMP_TYPE_NEIGHBOR_ADVERTISEMENT);
        assert_eq!(na[58], 0x20); // override, not solicited
        drop(na);

        // One-second cadence while the device is young.
        fix.stack.poll(t(1_600_000));
        assert!(fix.link.dequeue_tx().is_none());
        fix.stack.poll(t(2_200_000));
        assert!(fix.link.dequeue_tx().is_some());
        drain(&fix);
        fix.stack.poll(t(2_250_000));
        drain(&fix);

        // After 30 s of uptime the interval stretches to 30 s.
        fix.stack.poll(t(40_000_000));
        assert!(fix.link.dequeue_tx().is_some());
        drain(&fix);
        fix.stack.poll(t(41_000_000));
        drain(&fix);
        fix.stack.poll(t(60_000_000));
        assert!(fix.link.dequeue_tx().is_none());
        fix.stack.poll(t(75_000_000));
        assert!(fix.link.dequeue_tx().is_some());
        drain(&fix);
    }

    #[test]
    fn beacons_wait_for_idle_line() {
        let mut fix = fixture();
        fix.link.transmit(fix.pool.allocate(64).unwrap());
        fix.stack.poll(t(5_000_000));
        // Only the frame we queued ourselves.
        assert!(fix.link.dequeue_tx().is_some());
        assert!(fix.link.dequeue_tx().is_none());
    }

    #[test]
    fn syn_ack_carries_mss_option() {
        let mut fix = fixture();
        fix.stack.register_diagnostics();
        let ident = *fix.stack.identity();

        let syn = tcp_frame(fix.pool, 40000, 9, 1000, 0, TCP_SYN, &[], ident.addr);
        fix.stack.handle_frame(syn, t(77));

        let syn_ack = fix.link.dequeue_tx().expect("no SYN-ACK");
        let f = Frame::new(&syn_ack[..]);
        assert_eq!(f.tcp_control(), 0x6000 | TCP_SYN | TCP_ACK);
        assert_eq!(f.tcp_ack(), 1001);
        assert_eq!(f.tcp_window(), TCP_WINDOW as u16);
        assert_eq!(f.tcp_source_port(), 9);
        assert_eq!(f.tcp_dest_port(), 40000);
        // MSS option: kind 2, length 4, 768 - 74.
        assert_eq!(&syn_ack[74..78], &[0x02, 0x04, 0x02, 0xB6]);
        assert!(checksum_ok(&syn_ack[..]));
    }

    #[test]
    fn syn_to_closed_port_gets_rst() {
        let mut fix = fixture();
        let ident = *fix.stack.identity();

        let syn = tcp_frame(fix.pool, 40000, 81, 5000, 0, TCP_SYN, &[], ident.addr);
        fix.stack.handle_frame(syn, t(77));

        let rst = fix.link.dequeue_tx().expect("no RST");
        let f = Frame::new(&rst[..]);
        assert_eq!(f.tcp_control() & (TCP_RST | TCP_ACK), TCP_RST | TCP_ACK);
        assert_eq!(f.tcp_ack(), 5001); // SYN consumes one
        assert_eq!(f.tcp_source_port(), 81);
        assert_eq!(f.tcp_dest_port(), 40000);
        assert!(checksum_ok(&rst[..]));
    }

    #[test]
    fn data_for_unknown_connection_gets_rst() {
        let mut fix = fixture();
        let ident = *fix.stack.identity();

        let seg = tcp_frame(fix.pool, 40000, 7, 1, 2, TCP_ACK, b"stray", ident.addr);
        fix.stack.handle_frame(seg, t(77));
        let rst = fix.link.dequeue_tx().expect("no RST");
        assert_eq!(Frame::new(&rst[..]).tcp_control() & TCP_RST, TCP_RST);
    }

    #[test]
    fn late_ack_is_dropped_silently() {
        let mut fix = fixture();
        let ident = *fix.stack.identity();

        let ack = tcp_frame(fix.pool, 40000, 7, 1, 2, TCP_ACK, &[], ident.addr);
        fix.stack.handle_frame(ack, t(77));
        assert!(fix.link.dequeue_tx().is_none());
    }

    #[test]
    fn echo_round_trip() {
        let mut fix = fixture();
        fix.stack.register_diagnostics();
        let ident = *fix.stack.identity();

        let ack = handshake(&mut fix, 7, 1000, t(50));
        let seg = tcp_frame(fix.pool, 40000, 7, 1001, ack, TCP_ACK, b"ping!", ident.addr);
        fix.stack.handle_frame(seg, t(60));

        let reply = fix.link.dequeue_tx().expect("no echo segment");
        let f = Frame::new(&reply[..]);
        assert_eq!(&reply[TCPIP_HEADER_SIZE..], b"ping!");
        assert_eq!(f.tcp_sequence(), ack);
        assert_eq!(f.tcp_ack(), 1006);
        assert!(checksum_ok(&reply[..]));
    }

    #[test]
    fn options_are_stripped_before_delivery() {
        let mut fix = fixture();
        fix.stack.register_diagnostics();
        let ident = *fix.stack.identity();

        let ack = handshake(&mut fix, 7, 1000, t(50));

        // Segment with 4 bytes of options (data offset 6).
        let mut seg = vec![0u8; TCP_HEADER_SIZE + 4 + 5];
        seg[0..2].copy_from_slice(&40000u16.to_be_bytes());
        seg[2..4].copy_from_slice(&7u16.to_be_bytes());
        seg[4..8].copy_from_slice(&1001u32.to_be_bytes());
        seg[8..12].copy_from_slice(&ack.to_be_bytes());
        seg[12..14].copy_from_slice(&(0x6000 | TCP_ACK).to_be_bytes());
        seg[20..24].copy_from_slice(&[1, 1, 1, 1]); // NOPs
        seg[24..].copy_from_slice(b"hello");
        let frame = ip_frame(fix.pool, IP_NEXTHDR_TCP, host_ll(), ident.addr, &seg);
        fix.stack.handle_frame(frame, t(60));

        let reply = fix.link.dequeue_tx().expect("no echo segment");
        assert_eq!(&reply[TCPIP_HEADER_SIZE..], b"hello");
    }

    #[test]
    fn duplicate_segment_is_dropped() {
        let mut fix = fixture();
        fix.stack.register_diagnostics();
        let ident = *fix.stack.identity();

        let ack = handshake(&mut fix, 7, 1000, t(50));
        let seg = tcp_frame(fix.pool, 40000, 7, 1001, ack, TCP_ACK, b"data", ident.addr);
        fix.stack.handle_frame(seg, t(60));
        assert!(fix.link.dequeue_tx().is_some()); // echoed once

        // Exact replay: no callback, no reply, connection stays up.
        let dup = tcp_frame(fix.pool, 40000, 7, 1001, ack, TCP_ACK, b"data", ident.addr);
        fix.stack.handle_frame(dup, t(70));
        assert!(fix.link.dequeue_tx().is_none());

        let seg = tcp_frame(fix.pool, 40000, 7, 1005, ack, TCP_ACK, b"more", ident.addr);
        fix.stack.handle_frame(seg, t(80));
        assert_eq!(&fix.link.dequeue_tx().expect("conn died")[TCPIP_HEADER_SIZE..], b"more");
    }

    #[test]
    fn data_far_behind_the_window_is_taken_as_current() {
        let mut fix = fixture();
        fix.stack.register_diagnostics();
        let ident = *fix.stack.identity();

        let ack = handshake(&mut fix, 7, 100_000, t(50));
        // A sequence more than one window below rx_seq is neither a recent
        // retransmission nor a gap; it advances the receive sequence like
        // in-order data.
        let seg = tcp_frame(fix.pool, 40000, 7, 50_000, ack, TCP_ACK, b"old?", ident.addr);
        fix.stack.handle_frame(seg, t(60));

        let reply = fix.link.dequeue_tx().expect("segment was not delivered");
        assert_eq!(&reply[TCPIP_HEADER_SIZE..], b"old?");
        assert_eq!(Frame::new(&reply[..]).tcp_ack(), 100_001 + 4);
        assert_eq!(fix.stack.tcp.conns[0].state, ConnState::Established);
    }

    #[test]
    fn sequence_gap_closes_connection() {
        let mut fix = fixture();
        fix.stack.register_diagnostics();
        let ident = *fix.stack.identity();

        let ack = handshake(&mut fix, 7, 1000, t(50));
        let seg = tcp_frame(fix.pool, 40000, 7, 999_000, ack, TCP_ACK, b"oops", ident.addr);
        fix.stack.handle_frame(seg, t(60));

        let fin = fix.link.dequeue_tx().expect("no FIN-ACK");
        assert_eq!(
            Frame::new(&fin[..]).tcp_control() & (TCP_FIN | TCP_ACK),
            TCP_FIN | TCP_ACK
        );
        // Slot is free again: a new SYN takes it without eviction noise.
        let _ = handshake(&mut fix, 7, 2000, t(70));
    }

    #[test]
    fn fin_closes_and_final_data_is_delivered() {
        let mut fix = fixture();
        fix.stack.register_diagnostics();
        let ident = *fix.stack.identity();

        let ack = handshake(&mut fix, 7, 1000, t(50));
        let seg = tcp_frame(fix.pool, 40000, 7, 1001, ack, TCP_ACK | TCP_FIN, b"bye", ident.addr);
        fix.stack.handle_frame(seg, t(60));

        // Echo of the final bytes, then our FIN-ACK covering data + FIN.
        let echo = fix.link.dequeue_tx().expect("no final echo");
        assert_eq!(&echo[TCPIP_HEADER_SIZE..], b"bye");
        let fin = fix.link.dequeue_tx().expect("no FIN-ACK");
        let f = Frame::new(&fin[..]);
        assert_eq!(f.tcp_control() & (TCP_FIN | TCP_ACK), TCP_FIN | TCP_ACK);
        assert_eq!(f.tcp_ack(), 1005); // 3 data bytes + FIN
    }

    #[test]
    fn poll_acknowledges_received_data() {
        let mut fix = fixture();
        fix.stack.register_diagnostics();
        let ident = *fix.stack.identity();

        let ack = handshake(&mut fix, 9, 1000, t(50));
        let seg = tcp_frame(fix.pool, 40000, 9, 1001, ack, TCP_ACK, b"discarded", ident.addr);
        fix.stack.handle_frame(seg, t(60));
        // Discard says nothing on its own...
        assert!(fix.link.dequeue_tx().is_none());

        // ...so the poll pass owes the peer a bare ACK.
        fix.stack.poll(t(70));
        let bare = fix.link.dequeue_tx().expect("no bare ACK");
        let f = Frame::new(&bare[..]);
        assert_eq!(f.tcp_control(), 0x5000 | TCP_ACK);
        assert_eq!(f.tcp_ack(), 1010);
        assert_eq!(bare.len(), TCPIP_HEADER_SIZE);
    }

    #[test]
    fn oldest_connection_is_evicted_when_table_fills() {
        let mut fix = fixture();
        fix.stack.register_diagnostics();

        for i in 0..MAX_CONNECTIONS as u32 {
            let ident = *fix.stack.identity();
            let syn = tcp_frame(
                fix.pool,
                50000 + i as u16,
                9,
                1000,
                0,
                TCP_SYN,
                &[],
                ident.addr,
            );
            fix.stack.handle_frame(syn, t(100 * (i as u64 + 1)));
            assert!(fix.link.dequeue_tx().is_some());
        }

        let ident = *fix.stack.identity();
        let syn = tcp_frame(fix.pool, 60000, 9, 1000, 0, TCP_SYN, &[], ident.addr);
        fix.stack.handle_frame(syn, t(10_000));

        // FIN-ACK to the oldest peer, then the SYN-ACK for the newcomer.
        let fin = fix.link.dequeue_tx().expect("no eviction FIN");
        let f = Frame::new(&fin[..]);
        assert_eq!(f.tcp_control() & (TCP_FIN | TCP_ACK), TCP_FIN | TCP_ACK);
        assert_eq!(f.tcp_dest_port(), 50000);
        let syn_ack = fix.link.dequeue_tx().expect("no SYN-ACK");
        assert_eq!(Frame::new(&syn_ack[..]).tcp_dest_port(), 60000);
    }

    #[test]
    fn stale_unacked_connection_is_killed() {
        let mut fix = fixture();
        fix.stack.register_diagnostics();

        let _ = handshake(&mut fix, 9, 1000, t(50));
        // Pretend we pushed far beyond what the peer acknowledged.
        fix.stack.tcp.conns[0].tx_seq = fix.stack.tcp.conns[0]
            .last_ack_rx
            .wrapping_add(2 * TCP_WINDOW + 1);

        fix.stack.poll(t(60));
        let fin = fix.link.dequeue_tx().expect("no FIN-ACK");
        assert_eq!(
            Frame::new(&fin[..]).tcp_control() & (TCP_FIN | TCP_ACK),
            TCP_FIN | TCP_ACK
        );
        assert_eq!(fix.stack.tcp.conns[0].state, ConnState::Closed);
    }

    #[test]
    fn http_get_root_returns_time_page() {
        let mut fix = fixture();
        fix.stack.serve_http();
        let ident = *fix.stack.identity();

        let ack = handshake(&mut fix, 80, 1000, t(5_000_000));
        let req = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let seg = tcp_frame(fix.pool, 40000, 80, 1001, ack, TCP_ACK, req, ident.addr);
        fix.stack.handle_frame(seg, t(5_000_000));

        let resp = fix.link.dequeue_tx().expect("no HTTP response");
        let f = Frame::new(&resp[..]);
        assert_eq!(f.tcp_ack(), 1001 + req.len() as u32);
        // Keep-alive: no FIN.
        assert_eq!(f.tcp_control() & TCP_FIN, 0);

        let body = core::str::from_utf8(&resp[TCPIP_HEADER_SIZE..]).unwrap();
        assert!(body.starts_with("HTTP/1.1 200 OK\r\n"), "{}", body);
        assert!(body.contains("Content-Type: text/plain\r\n"));
        assert!(body.contains("Content-Length: "));
        assert!(body.contains("Connection: keep-alive\r\n"));
        assert!(body.contains("Hello, time is now 5000000!\n"));
        assert!(checksum_ok(&resp[..]));

        // Connection survives for the next request.
        assert_eq!(fix.stack.tcp.conns[0].state, ConnState::Established);
    }

    #[test]
    fn http_unknown_path_is_404() {
        let mut fix = fixture();
        fix.stack.serve_http();
        let ident = *fix.stack.identity();

        let ack = handshake(&mut fix, 80, 1000, t(1_000));
        let req = b"GET /missing HTTP/1.1\r\n\r\n";
        let seg = tcp_frame(fix.pool, 40000, 80, 1001, ack, TCP_ACK, req, ident.addr);
        fix.stack.handle_frame(seg, t(2_000));

        let resp = fix.link.dequeue_tx().expect("no HTTP response");
        let body = core::str::from_utf8(&resp[TCPIP_HEADER_SIZE..]).unwrap();
        assert!(body.starts_with("HTTP/1.1 404 Error\r\n"));
        assert!(body.ends_with("Not found"));
    }

    #[test]
    fn http_bad_method_is_400() {
        let mut fix = fixture();
        fix.stack.serve_http();
        let ident = *fix.stack.identity();

        let ack = handshake(&mut fix, 80, 1000, t(1_000));
        let seg = tcp_frame(
            fix.pool,
            40000,
            80,
            1001,
            ack,
            TCP_ACK,
            b"BREW /pot HTTP/1.1\r\n\r\n",
            ident.addr,
        );
        fix.stack.handle_frame(seg, t(2_000));

        let resp = fix.link.dequeue_tx().expect("no HTTP response");
        let body = core::str::from_utf8(&resp[TCPIP_HEADER_SIZE..]).unwrap();
        assert!(body.starts_with("HTTP/1.1 400 Error\r\n"));
    }

    fn blob_handler(io: &mut TcpIo<'_, '_>, request: Option<&http::HttpRequest<'_>>) {
        const BLOB: &[u8] = &[0x5A; 1000];
        match request {
            Some(_) => {
                http::start_response(io, 200, "application/octet-stream", "", false);
            }
            None => {
                if io.tx_pending() >= 2 {
                    return;
                }
                let cursor = match io.ctx() {
                    ConnCtx::Http(h) => h.cursor as usize,
                    _ => return,
                };
                if cursor >= BLOB.len() {
                    http::end_response(io);
                    return;
                }
                let n = (BLOB.len() - cursor).min(http::CHUNK_SIZE);
                let Some(mut chunk) = http::allocate_chunk(io, n) else {
                    return;
                };
                chunk.append(&BLOB[cursor..cursor + n]);
                if let ConnCtx::Http(h) = io.ctx() {
                    h.cursor = (cursor + n) as u32;
                }
                http::send_chunk(io, chunk);
            }
        }
    }

    #[test]
    fn http_chunked_download_streams_and_terminates() {
        let mut fix = fixture();
        fix.stack.serve_http();
        fix.stack.http_mut().route("/api/blob", blob_handler);
        let ident = *fix.stack.identity();

        let ack = handshake(&mut fix, 80, 1000, t(1_000));
        let seg = tcp_frame(
            fix.pool,
            40000,
            80,
            1001,
            ack,
            TCP_ACK,
            b"GET /api/blob HTTP/1.1\r\n\r\n",
            ident.addr,
        );
        fix.stack.handle_frame(seg, t(2_000));

        let head = fix.link.dequeue_tx().expect("no response head");
        let text = core::str::from_utf8(&head[TCPIP_HEADER_SIZE..]).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        drop(head);

        // First poll streams a full chunk.
        fix.stack.poll(t(3_000));
        let chunk = fix.link.dequeue_tx().expect("no chunk");
        let payload = &chunk[TCPIP_HEADER_SIZE..];
        assert!(payload.starts_with(b"000002aa\r\n")); // 682 bytes
        assert_eq!(payload.len(), 10 + http::CHUNK_SIZE + 2);
        assert!(payload.ends_with(b"\r\n"));
        drop(chunk);

        // Second chunk carries the remainder.
        fix.stack.poll(t(4_000));
        let chunk = fix.link.dequeue_tx().expect("no second chunk");
        assert!(chunk[TCPIP_HEADER_SIZE..].starts_with(b"0000013e\r\n")); // 318 bytes
        drop(chunk);

        // Then the terminal chunk, and the stream goes quiet.
        fix.stack.poll(t(5_000));
        let last = fix.link.dequeue_tx().expect("no terminal chunk");
        assert_eq!(&last[TCPIP_HEADER_SIZE..], b"0\r\n\r\n");
        drop(last);
        fix.stack.poll(t(6_000));
        assert!(fix.link.dequeue_tx().is_none());
    }

    #[test]
    fn chargen_pushes_until_send_window_fills() {
        let mut fix = fixture();
        fix.stack.register_diagnostics();

        let mut next_seq = handshake(&mut fix, 19, 1000, t(50));
        // The open callback already queued the first burst.
        let first = fix.link.dequeue_tx().expect("no chargen data");
        assert_eq!(Frame::new(&first[..]).tcp_sequence(), next_seq);
        let payload = &first[TCPIP_HEADER_SIZE..];
        assert_eq!(payload.len(), MAX_PAYLOAD);
        // RFC 864 pattern: 72 printable characters, then CRLF.
        assert_eq!(payload[0], b'!');
        assert_eq!(&payload[72..74], b"\r\n");
        assert_eq!(payload[74], b'"');
        next_seq = next_seq.wrapping_add(payload.len() as u32);
        drop(first);

        // Without acknowledgements the generator stalls near 2 * WINDOW.
        let mut pushed = 1usize;
        for i in 0u64..100 {
            fix.stack.poll(t(100 + i));
            match fix.link.dequeue_tx() {
                Some(frame) => {
                    pushed += 1;
                    next_seq = next_seq
                        .wrapping_add((frame.len() - TCPIP_HEADER_SIZE) as u32);
                }
                None => break,
            }
        }
        assert!(pushed < 100, "chargen never paced itself");
        let unacked = pushed as u32 * MAX_PAYLOAD as u32 + 1;
        assert!(unacked <= 2 * TCP_WINDOW);
        assert_eq!(fix.stack.tcp.conns[0].state, ConnState::Established);

        // Acknowledge everything; the stream resumes.
        let ident = *fix.stack.identity();
        let ack_seg = tcp_frame(fix.pool, 40000, 19, 1001, next_seq, TCP_ACK, &[], ident.addr);
        fix.stack.handle_frame(ack_seg, t(10_000));
        fix.stack.poll(t(10_100));
        assert!(fix.link.dequeue_tx().is_some());
    }

    #[test]
    fn listener_table_rejects_duplicates_and_overflow() {
        let mut fix = fixture();
        for port in 1..=MAX_LISTENERS as u16 {
            fix.stack.listen(port, Service::Discard);
        }
        // Both of these are dropped with a warning.
        fix.stack.listen(1, Service::Echo);
        fix.stack.listen(99, Service::Echo);

        let ident = *fix.stack.identity();
        let syn = tcp_frame(fix.pool, 40000, 99, 1, 0, TCP_SYN, &[], ident.addr);
        fix.stack.handle_frame(syn, t(10));
        let rst = fix.link.dequeue_tx().expect("no RST for unregistered port");
        assert_eq!(Frame::new(&rst[..]).tcp_control() & TCP_RST, TCP_RST);
    }
}
