//! ICMPv6 responder: neighbour/router discovery replies, echo, and the
//! unsolicited advertisement beacons that autoconfigure the host.

use embassy_time::Instant;

use usbnet::{PacketBox, PACKET_SIZE};

use crate::wire::{
    Frame, Ipv6Addr, ICMP_HEADER_SIZE, ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_ECHO_REQUEST,
    ICMP_TYPE_NEIGHBOR_ADVERTISEMENT, ICMP_TYPE_NEIGHBOR_SOLICITATION,
    ICMP_TYPE_ROUTER_ADVERTISEMENT, ICMP_TYPE_ROUTER_SOLICITATION, IP_HEADER_SIZE,
    IP_NEXTHDR_ICMP6,
};
use crate::Interface;

/// Ethernet + IPv6 + ICMP + flags + target + link-address option.
const NA_FRAME_SIZE: usize = IP_HEADER_SIZE + 32;
/// Ethernet + IPv6 + RA fields + prefix option + MTU option.
const RA_FRAME_SIZE: usize = IP_HEADER_SIZE + 56;

const NS_TARGET: usize = IP_HEADER_SIZE + 8;

pub(crate) fn handle(iface: &Interface, packet: PacketBox) {
    if packet.len() < IP_HEADER_SIZE + ICMP_HEADER_SIZE {
        return;
    }
    let (icmp_type, code, dest) = {
        let f = Frame::new(&packet[..]);
        (f.icmp_type(), f.icmp_code(), f.ipv6_dest())
    };
    trace!("ICMP type {} code {:02x}", icmp_type, code);

    match icmp_type {
        ICMP_TYPE_NEIGHBOR_SOLICITATION => send_neighbor_advertisement(iface, Some(packet)),
        ICMP_TYPE_ROUTER_SOLICITATION => send_router_advertisement(iface, Some(packet)),
        ICMP_TYPE_ECHO_REQUEST if iface.is_ours(dest) => send_echo_reply(iface, packet),
        _ => {} // released on drop
    }
}

/// NA, solicited (reply to an NS naming one of our addresses, in place) or
/// unsolicited (multicast beacon, flags 0x20).
pub(crate) fn send_neighbor_advertisement(iface: &Interface, request: Option<PacketBox>) {
    let solicited = request.is_some();

    let (mut packet, target) = match request {
        Some(mut packet) => {
            if packet.len() < NS_TARGET + 16 {
                return;
            }
            let mut target = [0u8; 16];
            target.copy_from_slice(&packet[NS_TARGET..NS_TARGET + 16]);
            let target = Ipv6Addr(target);
            if !iface.is_ours(target) {
                trace!("NS target not ours");
                return;
            }
            // Answer a link-local query with the link-local identity.
            let advertised = if target.is_link_local() {
                iface.ident.link_local
            } else {
                iface.ident.addr
            };
            let mut f = Frame::new(&mut packet[..]);
            f.prepare_reply(iface.ident.mac, iface.ident.addr);
            (packet, advertised)
        }
        None => {
            let Some(mut packet) = iface.pool.allocate(NA_FRAME_SIZE) else {
                return;
            };
            packet.set_len(NA_FRAME_SIZE);
            let mut f = Frame::new(&mut packet[..]);
            f.prepare_multicast(iface.ident.mac, iface.ident.addr);
            (packet, iface.ident.addr)
        }
    };

    packet.set_len(NA_FRAME_SIZE);
    {
        let mut f = Frame::new(&mut packet[..]);
        f.set_ipv6_payload_len(32);
        f.set_next_header(IP_NEXTHDR_ICMP6);
    }
    packet[IP_HEADER_SIZE..NA_FRAME_SIZE].fill(0);
    packet[IP_HEADER_SIZE] = ICMP_TYPE_NEIGHBOR_ADVERTISEMENT;
    // R=0, S+O for solicited replies, O alone for beacons.
    packet[IP_HEADER_SIZE + 4] = if solicited { 0x60 } else { 0x20 };
    packet[IP_HEADER_SIZE + 8..IP_HEADER_SIZE + 24].copy_from_slice(&target.0);
    packet[IP_HEADER_SIZE + 24] = 2; // option: target link-layer address
    packet[IP_HEADER_SIZE + 25] = 1;
    packet[IP_HEADER_SIZE + 26..IP_HEADER_SIZE + 32].copy_from_slice(&iface.ident.mac.0);

    Frame::new(&mut packet[..]).fill_icmp_checksum();
    iface.transmit(packet);
    debug!("neighbour advertisement sent");
}

/// RA carrying the on-link /64 prefix and the link MTU, solicited or as the
/// periodic beacon. Always sourced from the link-local address.
pub(crate) fn send_router_advertisement(iface: &Interface, request: Option<PacketBox>) {
    let mut packet = match request {
        Some(mut packet) => {
            let mut f = Frame::new(&mut packet[..]);
            f.prepare_reply(iface.ident.mac, iface.ident.addr);
            packet
        }
        None => {
            let Some(mut packet) = iface.pool.allocate(RA_FRAME_SIZE) else {
                return;
            };
            packet.set_len(RA_FRAME_SIZE);
            let mut f = Frame::new(&mut packet[..]);
            f.prepare_multicast(iface.ident.mac, iface.ident.addr);
            packet
        }
    };

    packet.set_len(RA_FRAME_SIZE);
    {
        let mut f = Frame::new(&mut packet[..]);
        f.set_ipv6_payload_len(56);
        f.set_next_header(IP_NEXTHDR_ICMP6);
        f.set_ipv6_source(iface.ident.link_local);
    }

    let p = IP_HEADER_SIZE;
    packet[p..RA_FRAME_SIZE].fill(0);
    packet[p] = ICMP_TYPE_ROUTER_ADVERTISEMENT;
    packet[p + 4] = 255; // current hop limit
    packet[p + 6..p + 8].copy_from_slice(&3600u16.to_be_bytes()); // router lifetime
    packet[p + 8..p + 12].copy_from_slice(&0xFFFF_FFFFu32.to_be_bytes()); // reachable time
    packet[p + 12..p + 16].copy_from_slice(&4000u32.to_be_bytes()); // retransmit timer

    // Prefix information option: on-link + autonomous, infinite lifetimes.
    packet[p + 16] = 3;
    packet[p + 17] = 4;
    packet[p + 18] = 64;
    packet[p + 19] = 0xC0;
    packet[p + 20..p + 24].copy_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
    packet[p + 24..p + 28].copy_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
    let mut prefix = iface.ident.addr.0;
    prefix[8..].fill(0);
    packet[p + 32..p + 48].copy_from_slice(&prefix);

    // MTU option: what fits our frame buffers.
    packet[p + 48] = 5;
    packet[p + 49] = 1;
    packet[p + 52..p + 56].copy_from_slice(&(PACKET_SIZE as u32).to_be_bytes());

    Frame::new(&mut packet[..]).fill_icmp_checksum();
    iface.transmit(packet);
    debug!("router advertisement sent");
}

/// Echo reply reusing the request buffer in place.
fn send_echo_reply(iface: &Interface, mut packet: PacketBox) {
    let mut f = Frame::new(&mut packet[..]);
    f.prepare_reply(iface.ident.mac, iface.ident.addr);
    f.set_icmp_type(ICMP_TYPE_ECHO_REPLY);
    f.fill_icmp_checksum();
    iface.transmit(packet);
    debug!("echo reply sent");
}

/// Unsolicited RA + NA cadence: every second for the first 30 s after boot,
/// every 30 s after that. Both are skipped while transmissions are pending.
pub(crate) struct Beacons {
    last_ra: Instant,
    last_na: Instant,
}

impl Beacons {
    pub(crate) fn new() -> Self {
        Self {
            last_ra: Instant::from_ticks(0),
            last_na: Instant::from_ticks(0),
        }
    }

    pub(crate) fn poll(&mut self, iface: &Interface, now: Instant) {
        let interval_us: u64 = if now.as_micros() > 30_000_000 {
            30_000_000
        } else {
            1_000_000
        };

        if now.duration_since(self.last_ra).as_micros() > interval_us && iface.link.tx_pending() == 0
        {
            self.last_ra = now;
            send_router_advertisement(iface, None);
        }

        if now.duration_since(self.last_na).as_micros() > interval_us && iface.link.tx_pending() == 0
        {
            self.last_na = now;
            send_neighbor_advertisement(iface, None);
        }
    }
}
