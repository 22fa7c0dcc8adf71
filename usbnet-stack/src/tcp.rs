//! Embedded TCP endpoint: fixed listener and connection tables, passive
//! opens only.
//!
//! There is no accept queue; a SYN is served straight into a connection
//! slot, evicting the least recently active connection when the table is
//! full. Slots know only two states: a slot either carries an established
//! connection or it is free. Everything else (retransmission, congestion
//! control, active opens) is out of scope; a sequence gap kills the
//! connection instead of resynchronising it.

use embassy_time::Instant;

use usbnet::{PacketBox, Payload, PACKET_SIZE};

use crate::wire::{
    Frame, Ipv6Addr, MacAddr, ETHERTYPE_IPV6, IPV6_HOP_LIMIT, IP_NEXTHDR_TCP, TCPIP_HEADER_SIZE,
    TCP_ACK, TCP_FIN, TCP_HEADER_SIZE, TCP_RST, TCP_SYN,
};
use crate::{diag, http, Interface};

pub const MAX_CONNECTIONS: usize = 4;
pub const MAX_LISTENERS: usize = 8;
/// Receive window advertised in every segment.
pub const TCP_WINDOW: u32 = 16384;
/// Largest payload that fits a pool buffer behind the fixed headers. Also
/// the MSS announced in SYN-ACKs.
pub const MAX_PAYLOAD: usize = PACKET_SIZE - TCPIP_HEADER_SIZE;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnState {
    Closed,
    Established,
}

/// Application wired to a listener at registration time.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Service {
    Echo,
    Discard,
    Chargen,
    Http,
}

/// Per-connection application state, chosen by the service.
#[derive(Default)]
pub enum ConnCtx {
    #[default]
    None,
    Http(http::HttpConn),
    Chargen(diag::ChargenState),
}

/// What a connection slot has to tell its service.
pub enum Event {
    /// Three-way handshake finished (from our side: SYN-ACK sent).
    Open,
    /// In-order payload, options already stripped.
    Data(Payload),
    /// Periodic chance to push data.
    Poll,
    /// Connection left the table; last chance to drop per-connection state.
    Closed,
}

pub(crate) type Events = heapless::Vec<(usize, Event), 2>;

#[derive(Clone, Copy)]
struct Listener {
    port: u16,
    service: Service,
}

pub struct Conn {
    pub(crate) state: ConnState,
    pub(crate) service: Service,
    pub(crate) peer_addr: Ipv6Addr,
    pub(crate) peer_mac: MacAddr,
    pub(crate) peer_port: u16,
    pub(crate) local_port: u16,
    pub(crate) tx_seq: u32,
    pub(crate) rx_seq: u32,
    pub(crate) last_ack_sent: u32,
    pub(crate) last_ack_rx: u32,
    pub(crate) last_event: Instant,
    pub(crate) ctx: ConnCtx,
}

impl Conn {
    fn idle() -> Self {
        Self {
            state: ConnState::Closed,
            service: Service::Discard,
            peer_addr: Ipv6Addr::UNSPECIFIED,
            peer_mac: MacAddr::default(),
            peer_port: 0,
            local_port: 0,
            tx_seq: 0,
            rx_seq: 0,
            last_ack_sent: 0,
            last_ack_rx: 0,
            last_event: Instant::from_ticks(0),
            ctx: ConnCtx::None,
        }
    }
}

pub(crate) struct Endpoint {
    listeners: [Option<Listener>; MAX_LISTENERS],
    pub(crate) conns: [Conn; MAX_CONNECTIONS],
}

impl Endpoint {
    pub(crate) fn new() -> Self {
        Self {
            listeners: [None; MAX_LISTENERS],
            conns: core::array::from_fn(|_| Conn::idle()),
        }
    }

    pub(crate) fn listen(&mut self, port: u16, service: Service) {
        if self
            .listeners
            .iter()
            .flatten()
            .any(|l| l.port == port)
        {
            warn!("TCP listener for port {} already registered", port);
            return;
        }
        match self.listeners.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => *slot = Some(Listener { port, service }),
            None => warn!("TCP listener slots all in use, not registering port {}", port),
        }
    }

    /// Full segment input path. The caller has already length-checked the
    /// frame down to the IPv6 payload.
    pub(crate) fn handle(&mut self, iface: &Interface, packet: PacketBox, now: Instant) -> Events {
        let mut events = Events::new();
        if packet.len() < TCPIP_HEADER_SIZE {
            return events;
        }
        let control = Frame::new(&packet[..]).tcp_control();
        trace!("TCP segment ctrl={:04x}", control);
        if control & TCP_SYN != 0 {
            self.handle_syn(iface, packet, now, &mut events);
        } else {
            self.handle_active(iface, packet, now, &mut events);
        }
        events
    }

    fn handle_syn(
        &mut self,
        iface: &Interface,
        mut packet: PacketBox,
        now: Instant,
        events: &mut Events,
    ) {
        let (dest_port, src_port, peer_addr, peer_mac, seq) = {
            let f = Frame::new(&packet[..]);
            (
                f.tcp_dest_port(),
                f.tcp_source_port(),
                f.ipv6_source(),
                f.eth_source(),
                f.tcp_sequence(),
            )
        };

        let Some(listener) = self
            .listeners
            .iter()
            .flatten()
            .find(|l| l.port == dest_port)
            .copied()
        else {
            warn!("TCP no listener for port {}", dest_port);
            send_rst(iface, packet);
            return;
        };

        let slot = self.allocate_slot(iface, now);
        let conn = &mut self.conns[slot];
        *conn = Conn::idle();
        conn.state = ConnState::Established;
        conn.service = listener.service;
        conn.local_port = listener.port;
        conn.peer_addr = peer_addr;
        conn.peer_mac = peer_mac;
        conn.peer_port = src_port;
        conn.rx_seq = seq.wrapping_add(1);
        // Deterministic pseudo-ISN from the free-running clock.
        conn.tx_seq = conn.rx_seq.wrapping_add(now.as_micros() as u32);
        conn.last_ack_rx = conn.tx_seq;

        debug!("TCP open port {}", listener.port);

        packet.set_len(TCPIP_HEADER_SIZE);
        send_segment(iface, conn, Some(packet), TCP_SYN | TCP_ACK, now);
        conn.tx_seq = conn.tx_seq.wrapping_add(1);

        let _ = events.push((slot, Event::Open));
    }

    fn handle_active(
        &mut self,
        iface: &Interface,
        mut packet: PacketBox,
        now: Instant,
        events: &mut Events,
    ) {
        let (src_port, dest_port, seq, ack, control, peer_addr, payload_off) = {
            let f = Frame::new(&packet[..]);
            (
                f.tcp_source_port(),
                f.tcp_dest_port(),
                f.tcp_sequence(),
                f.tcp_ack(),
                f.tcp_control(),
                f.ipv6_source(),
                f.tcp_payload_offset(),
            )
        };
        let data_len = packet.len().saturating_sub(payload_off);

        let slot = self.conns.iter().position(|c| {
            c.state == ConnState::Established
                && c.local_port == dest_port
                && c.peer_port == src_port
                && c.peer_addr == peer_addr
        });

        let Some(slot) = slot else {
            if control & TCP_ACK != 0 && data_len == 0 {
                // Most likely the ACK of our FIN-ACK; the slot is gone.
                return;
            }
            warn!("TCP no connection for port {}", dest_port);
            send_rst(iface, packet);
            return;
        };

        {
            let conn = &mut self.conns[slot];
            conn.last_ack_rx = ack;
            conn.last_event = now;
            trace!("TCP len={} port={}", data_len, conn.local_port);
        }

        if data_len > 0 {
            let rx_seq = self.conns[slot].rx_seq;
            if seq < rx_seq && seq.wrapping_add(TCP_WINDOW) > rx_seq {
                warn!("ignoring TCP retransmission");
                return;
            }
            if seq > rx_seq {
                warn!("TCP sequence gap: expected {:08x}, got {:08x}", rx_seq, seq);
                drop(packet);
                let _ = events.push((slot, Event::Closed));
                return;
            }
            // Only the range just below rx_seq counts as a retransmission;
            // anything older falls through here as current data.

            self.conns[slot].rx_seq = rx_seq.wrapping_add(data_len as u32);

            if payload_off > TCPIP_HEADER_SIZE {
                // Strip the options so the payload starts right behind the
                // fixed header before slicing it off for the service.
                let total = packet.len();
                packet.copy_within(payload_off..total, TCPIP_HEADER_SIZE);
                packet.set_len(TCPIP_HEADER_SIZE + data_len);
            }
            let _ = events.push((slot, Event::Data(packet.slice(TCPIP_HEADER_SIZE, 0))));
        } else {
            drop(packet);
        }

        if control & (TCP_FIN | TCP_RST) != 0 {
            // The FIN occupies one sequence number; the close that follows
            // the event dispatch acknowledges it.
            self.conns[slot].rx_seq = self.conns[slot].rx_seq.wrapping_add(1);
            let _ = events.push((slot, Event::Closed));
        }
    }

    /// Picks a free slot, or tears down the least recently active
    /// connection and reuses its slot.
    fn allocate_slot(&mut self, iface: &Interface, now: Instant) -> usize {
        let mut oldest = 0;
        for (i, conn) in self.conns.iter().enumerate() {
            if conn.state == ConnState::Closed {
                return i;
            }
            if conn.last_event < self.conns[oldest].last_event {
                oldest = i;
            }
        }
        warn!(
            "TCP no free connection slots, terminating port {}",
            self.conns[oldest].local_port
        );
        self.close(iface, oldest, now);
        oldest
    }

    /// Wire-level close: FIN-ACK out, slot freed. The service is told via a
    /// `Closed` event by whoever called this.
    pub(crate) fn close(&mut self, iface: &Interface, slot: usize, now: Instant) {
        let conn = &mut self.conns[slot];
        if conn.state == ConnState::Closed {
            return;
        }
        debug!("TCP close port {}", conn.local_port);
        send_segment(iface, conn, None, TCP_FIN | TCP_ACK, now);
        conn.state = ConnState::Closed;
    }

    /// Post-callback half of the per-connection poll: flush a bare ACK if
    /// received data has not been acknowledged yet, and kill connections
    /// whose peer stopped acknowledging ours.
    pub(crate) fn finish_poll(&mut self, iface: &Interface, slot: usize, now: Instant) -> Events {
        let mut events = Events::new();
        let conn = &mut self.conns[slot];
        if conn.state != ConnState::Established {
            return events;
        }
        if conn.last_ack_sent != conn.rx_seq {
            send_segment(iface, conn, None, TCP_ACK, now);
        }
        if conn.tx_seq.wrapping_sub(conn.last_ack_rx) > 2 * TCP_WINDOW {
            warn!("TCP closing connection, peer stopped acking");
            let _ = events.push((slot, Event::Closed));
        }
        events
    }
}

/// Builds the Ethernet/IPv6/TCP headers in the reserved prefix and
/// transmits. `packet`, when given, carries `TCPIP_HEADER_SIZE` of headroom
/// followed by the payload; `None` sends a bare control segment.
pub(crate) fn send_segment(
    iface: &Interface,
    conn: &mut Conn,
    packet: Option<PacketBox>,
    control: u16,
    now: Instant,
) {
    let mut packet = match packet {
        Some(packet) => {
            assert!(packet.len() >= TCPIP_HEADER_SIZE);
            packet
        }
        None => {
            let Some(mut packet) = iface.pool.allocate(TCPIP_HEADER_SIZE) else {
                debug!("dropping TCP segment, out of buffers");
                return;
            };
            packet.set_len(TCPIP_HEADER_SIZE);
            packet
        }
    };

    let payload_len = packet.len() - TCPIP_HEADER_SIZE;
    let mut options_len = 0u16;
    let mut data_offset = 0x5000u16;
    if control & TCP_SYN != 0 && payload_len == 0 {
        // Announce our MSS alongside the handshake.
        let total = packet.len();
        packet.set_len(total + 4);
        let mss = 0x0204_0000u32 | MAX_PAYLOAD as u32;
        packet[total..total + 4].copy_from_slice(&mss.to_be_bytes());
        options_len = 4;
        data_offset = 0x6000;
    }

    let mut f = Frame::new(&mut packet[..]);
    f.set_eth_dest(conn.peer_mac);
    f.set_eth_source(iface.ident.mac);
    f.set_ethertype(ETHERTYPE_IPV6);
    f.set_ipv6_payload_len(TCP_HEADER_SIZE as u16 + options_len + payload_len as u16);
    f.set_next_header(IP_NEXTHDR_TCP);
    f.set_hop_limit(IPV6_HOP_LIMIT);
    f.set_version_class();
    f.set_ipv6_source(iface.ident.addr);
    f.set_ipv6_dest(conn.peer_addr);
    f.set_tcp_source_port(conn.local_port);
    f.set_tcp_dest_port(conn.peer_port);
    f.set_tcp_sequence(conn.tx_seq);
    f.set_tcp_ack(conn.rx_seq);
    f.set_tcp_control(control | data_offset);
    f.set_tcp_window(TCP_WINDOW as u16);
    f.set_tcp_urgent(0);
    f.fill_tcp_checksum();

    trace!(
        "TCP sending ctrl={:02x} len={} seq={:08x}",
        control,
        payload_len,
        conn.tx_seq
    );
    conn.tx_seq = conn.tx_seq.wrapping_add(payload_len as u32);
    conn.last_ack_sent = conn.rx_seq;
    conn.last_event = now;

    iface.transmit(packet);
}

/// RST built in place from the offending segment.
fn send_rst(iface: &Interface, mut packet: PacketBox) {
    if packet.len() < TCPIP_HEADER_SIZE {
        return;
    }
    packet.set_len(TCPIP_HEADER_SIZE);

    let mut f = Frame::new(&mut packet[..]);
    f.prepare_reply(iface.ident.mac, iface.ident.addr);
    f.set_ipv6_payload_len(TCP_HEADER_SIZE as u16);

    let control = f.tcp_control();
    let sport = f.tcp_source_port();
    let dport = f.tcp_dest_port();
    f.set_tcp_source_port(dport);
    f.set_tcp_dest_port(sport);

    let seq = f.tcp_sequence();
    let ack = f.tcp_ack();
    let mut new_ack = seq;
    if control & TCP_SYN != 0 {
        new_ack = new_ack.wrapping_add(1);
    }
    f.set_tcp_sequence(ack);
    f.set_tcp_ack(new_ack);
    f.set_tcp_control(TCP_RST | TCP_ACK | 0x5000);
    f.set_tcp_urgent(0);
    f.fill_tcp_checksum();

    iface.transmit(packet);
}

/// What a service callback gets to talk to its connection.
pub struct TcpIo<'a, 'd> {
    pub(crate) iface: &'a Interface<'d>,
    pub(crate) conn: &'a mut Conn,
    pub(crate) now: Instant,
}

impl<'a, 'd> TcpIo<'a, 'd> {
    /// Allocates a payload with the TCP header prefix reserved, ready for
    /// [`send`](Self::send). `None` when the pool is dry; drop the work.
    pub fn allocate(&self, size: usize) -> Option<Payload> {
        let packet = self.iface.pool.allocate(TCPIP_HEADER_SIZE + size)?;
        Some(packet.slice(TCPIP_HEADER_SIZE, 0))
    }

    /// Sends a payload previously produced by [`allocate`](Self::allocate)
    /// or received from this connection.
    pub fn send(&mut self, payload: Payload) {
        assert!(self.conn.state == ConnState::Established);
        let packet = payload.unslice();
        send_segment(self.iface, self.conn, Some(packet), TCP_ACK, self.now);
    }

    /// FIN-ACK out and the slot freed. The service will not hear about this
    /// connection again (no extra `Closed` event for self-initiated closes).
    pub fn close(&mut self) {
        if self.conn.state == ConnState::Closed {
            return;
        }
        debug!("TCP close port {}", self.conn.local_port);
        send_segment(self.iface, self.conn, None, TCP_FIN | TCP_ACK, self.now);
        self.conn.state = ConnState::Closed;
        self.conn.ctx = ConnCtx::None;
    }

    pub fn state(&self) -> ConnState {
        self.conn.state
    }

    pub fn local_port(&self) -> u16 {
        self.conn.local_port
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Bytes sent but not yet acknowledged by the peer.
    pub fn unacked(&self) -> u32 {
        self.conn.tx_seq.wrapping_sub(self.conn.last_ack_rx)
    }

    /// How much more the connection may push before it hits the
    /// stale-ack kill threshold.
    pub fn send_window(&self) -> u32 {
        (2 * TCP_WINDOW).saturating_sub(self.unacked())
    }

    /// Frames queued or in flight on the USB link.
    pub fn tx_pending(&self) -> usize {
        self.iface.link.tx_pending()
    }

    /// Per-connection service scratch state.
    pub fn ctx(&mut self) -> &mut ConnCtx {
        &mut self.conn.ctx
    }
}
