//! USB composite network function for embedded IPv6 devices.
//!
//! Registers two class functions on an [`embassy_usb::Builder`]: a
//! CDC-Ethernet function (raw or NTB16 framing, picked by the host's first
//! transfer) and a Microsoft RNDIS function. Whichever the host activates
//! owns the link; Ethernet frames move through pooled buffers handed across
//! the layers by ownership, never by copying.
//!
//! The stack side talks to the link through [`LinkHandle`]; the USB side is
//! driven by [`UsbNet::run`].

#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod buffer;
mod ecm;
mod rndis;
mod rx;

pub use buffer::{
    PacketBox, PacketPool, Payload, PayloadWriter, PACKET_COUNT, PACKET_SIZE, SMALL_COUNT,
    SMALL_SIZE,
};

use core::cell::RefCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use embassy_futures::join::{join, join4};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_usb::driver::Driver;
use embassy_usb::msos::windows_version;
use embassy_usb::Builder;
use heapless::Deque;

/// Bulk endpoint packet size. Full speed only.
pub const USB_PACKET_SIZE: usize = 64;
/// Cap on frames parked in the received queue.
pub const MAX_RX_QUEUE: usize = 1;
/// Cap on frames queued for transmission, besides the one in flight.
pub const TX_QUEUE_DEPTH: usize = 4;

const RNDIS_RESPONSE_DEPTH: usize = 4;

/// Which class function currently owns the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    Down,
    Ecm,
    Rndis,
}

impl LinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LinkState::Ecm,
            2 => LinkState::Rndis,
            _ => LinkState::Down,
        }
    }
}

/// Data framing latched on the CDC-Ethernet function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Framing {
    Raw,
    Ntb,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum EcmEvent {
    Activated,
    Deactivated,
    NotifyDown,
}

pub(crate) struct Shared {
    pub(crate) pool: &'static PacketPool,

    pub(crate) rx: Channel<CriticalSectionRawMutex, PacketBox, MAX_RX_QUEUE>,
    pub(crate) tx: Channel<CriticalSectionRawMutex, PacketBox, TX_QUEUE_DEPTH>,
    tx_pending: AtomicUsize,

    link: AtomicU8,
    pub(crate) link_changed: Signal<CriticalSectionRawMutex, ()>,
    framing: AtomicU8,

    pub(crate) ecm_events: Signal<CriticalSectionRawMutex, EcmEvent>,
    pub(crate) rndis_responses:
        Mutex<CriticalSectionRawMutex, RefCell<Deque<PacketBox, RNDIS_RESPONSE_DEPTH>>>,
    pub(crate) rndis_notify: Signal<CriticalSectionRawMutex, ()>,

    pub(crate) frames_tx: AtomicU32,
    pub(crate) frames_rx: AtomicU32,

    pub(crate) host_mac: [u8; 6],
    mac_str: [u8; 12],
}

impl Shared {
    pub(crate) fn new(pool: &'static PacketPool) -> Self {
        Self {
            pool,
            rx: Channel::new(),
            tx: Channel::new(),
            tx_pending: AtomicUsize::new(0),
            link: AtomicU8::new(0),
            link_changed: Signal::new(),
            framing: AtomicU8::new(0),
            ecm_events: Signal::new(),
            rndis_responses: Mutex::new(RefCell::new(Deque::new())),
            rndis_notify: Signal::new(),
            frames_tx: AtomicU32::new(0),
            frames_rx: AtomicU32::new(0),
            host_mac: [0; 6],
            mac_str: *b"000000000000",
        }
    }

    pub(crate) fn link_state(&self) -> LinkState {
        LinkState::from_u8(self.link.load(Ordering::Relaxed))
    }

    pub(crate) fn set_link(&self, new: LinkState) {
        let prev = LinkState::from_u8(self.link.swap(new as u8, Ordering::Relaxed));
        if prev == new {
            return;
        }
        info!("link {:?} -> {:?}", prev, new);
        // The class activated last wins; an ECM link torn down by RNDIS is
        // told so on its interrupt pipe.
        if prev == LinkState::Ecm && new == LinkState::Rndis {
            self.ecm_events.signal(EcmEvent::NotifyDown);
        }
        self.link_changed.signal(());
    }

    pub(crate) fn framing(&self) -> Framing {
        match self.framing.load(Ordering::Relaxed) {
            1 => Framing::Ntb,
            _ => Framing::Raw,
        }
    }

    pub(crate) fn set_framing(&self, framing: Framing) {
        let prev = self.framing.swap(framing as u8, Ordering::Relaxed);
        if prev != framing as u8 {
            debug!("ECM framing latched to {:?}", framing);
        }
    }

    pub(crate) fn mac_str(&self) -> &[u8] {
        &self.mac_str
    }
}

/// Long-lived state backing [`UsbNet`]. Lives in a `static` next to the
/// descriptor buffers.
pub struct State<'d> {
    shared: Shared,
    ecm_control: MaybeUninit<ecm::EcmControl<'d>>,
    rndis_control: MaybeUninit<rndis::RndisControl<'d>>,
}

impl<'d> State<'d> {
    pub fn new(pool: &'static PacketPool) -> Self {
        Self {
            shared: Shared::new(pool),
            ecm_control: MaybeUninit::uninit(),
            rndis_control: MaybeUninit::uninit(),
        }
    }

    /// Handle for the protocol stack sitting on top of the link.
    pub fn link(&self) -> LinkHandle<'_> {
        LinkHandle {
            shared: &self.shared,
        }
    }
}

/// Cloneable consumer-side handle: frame queues, link state, counters.
#[derive(Clone, Copy)]
pub struct LinkHandle<'d> {
    shared: &'d Shared,
}

impl<'d> LinkHandle<'d> {
    pub fn state(&self) -> LinkState {
        self.shared.link_state()
    }

    pub fn is_up(&self) -> bool {
        self.shared.link_state() != LinkState::Down
    }

    /// Forces the link state. The class engines drive this in normal
    /// operation; custom runners and host-side harnesses may too.
    pub fn set_state(&self, state: LinkState) {
        self.shared.set_link(state);
    }

    /// Queues an Ethernet frame for transmission. When the queue is full
    /// (link down or host not draining) the frame is dropped and its buffer
    /// returns to the pool.
    pub fn transmit(&self, frame: PacketBox) {
        match self.shared.tx.try_send(frame) {
            Ok(()) => {
                self.shared.tx_pending.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => warn!("TX queue full, dropping frame"),
        }
    }

    /// Waits for the next received Ethernet frame.
    pub async fn receive(&self) -> PacketBox {
        self.shared.rx.receive().await
    }

    pub fn try_receive(&self) -> Option<PacketBox> {
        self.shared.rx.try_receive().ok()
    }

    /// Frames queued or in flight. 0 means the line is idle, 1 a frame is
    /// being transmitted, 2+ that frames are waiting.
    pub fn tx_pending(&self) -> usize {
        self.shared.tx_pending.load(Ordering::Relaxed)
    }

    /// Takes the next frame queued for transmission. The USB runner drains
    /// this queue; custom runners and host-side harnesses can too.
    pub fn dequeue_tx(&self) -> Option<PacketBox> {
        let frame = self.shared.tx.try_receive().ok()?;
        self.shared.tx_pending.fetch_sub(1, Ordering::Relaxed);
        Some(frame)
    }

    pub fn frames_sent(&self) -> u32 {
        self.shared.frames_tx.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u32 {
        self.shared.frames_rx.load(Ordering::Relaxed)
    }
}

/// The USB network device: both class functions plus their runners.
pub struct UsbNet<'d, D: Driver<'d>> {
    ecm: ecm::EcmFunction<'d, D>,
    rndis: rndis::RndisFunction<'d, D>,
    shared: &'d Shared,
}

impl<'d, D: Driver<'d>> UsbNet<'d, D> {
    /// Registers both network functions on the builder.
    ///
    /// `host_mac` is the address the host-side adapter will use; it is
    /// served through the ECM MAC string and the RNDIS 802.3 OIDs. The
    /// device's own MAC lives in the stack, not here.
    pub fn new(builder: &mut Builder<'d, D>, state: &'d mut State<'d>, host_mac: [u8; 6]) -> Self {
        state.shared.host_mac = host_mac;
        state.shared.mac_str = mac_hex(host_mac);

        builder.msos_descriptor(windows_version::WIN8_1, 2);

        let State {
            shared,
            ecm_control,
            rndis_control,
        } = state;
        let shared: &'d Shared = shared;

        // Interface order matters to Windows: RNDIS first.
        let rndis = rndis::RndisFunction::new(builder, rndis_control, shared);
        let ecm = ecm::EcmFunction::new(builder, ecm_control, shared);

        Self { ecm, rndis, shared }
    }

    /// Handle for the protocol stack sitting on top of the link.
    pub fn link(&self) -> LinkHandle<'d> {
        LinkHandle {
            shared: self.shared,
        }
    }

    /// Drives the receive, transmit and notification engines. Never returns.
    pub async fn run(mut self) -> ! {
        let shared = self.shared;
        let ecm_data_if = self.ecm.data_if;
        join4(
            ecm::link_task::<D>(&mut self.ecm.comm_ep, ecm_data_if, shared),
            ecm::rx_task::<D>(&mut self.ecm.read_ep, shared),
            rndis::notify_task::<D>(&mut self.rndis.comm_ep, shared),
            join(
                rndis::rx_task::<D>(&mut self.rndis.read_ep, shared),
                tx_task::<D>(&mut self.ecm.write_ep, &mut self.rndis.write_ep, shared),
            ),
        )
        .await;
        unreachable!()
    }
}

/// Routes queued frames to whichever class currently owns the link.
async fn tx_task<'d, D: Driver<'d>>(
    ecm_write: &mut D::EndpointIn,
    rndis_write: &mut D::EndpointIn,
    shared: &Shared,
) -> ! {
    let mut seq: u16 = 0;
    loop {
        let frame = shared.tx.receive().await;
        let result = loop {
            match shared.link_state() {
                LinkState::Down => shared.link_changed.wait().await,
                LinkState::Ecm => {
                    break ecm::write_frame::<D>(ecm_write, shared.framing(), &mut seq, &frame)
                        .await
                }
                LinkState::Rndis => break rndis::write_frame::<D>(rndis_write, &frame).await,
            }
        };
        match result {
            Ok(()) => {
                shared.frames_tx.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => warn!("dropping frame on disabled endpoint"),
        }
        shared.tx_pending.fetch_sub(1, Ordering::Relaxed);
    }
}

fn mac_hex(mac: [u8; 6]) -> [u8; 12] {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = [0u8; 12];
    for (i, b) in mac.iter().enumerate() {
        out[i * 2] = HEX[(b >> 4) as usize];
        out[i * 2 + 1] = HEX[(b & 0x0F) as usize];
    }
    out
}
