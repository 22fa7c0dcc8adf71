//! CDC-Ethernet function: ECM enumeration with adaptive raw / NTB16 framing.
//!
//! The data path starts in raw ECM mode (one Ethernet frame per transfer,
//! terminated by a short packet) and latches to NTB mode as soon as an OUT
//! transfer leads with the NTH16 signature. IN framing mirrors the latched
//! mode. `GET_NTB_PARAMETERS` is answered in either mode.

use core::mem::{size_of, MaybeUninit};
use core::sync::atomic::Ordering;

use embassy_time::Timer;
use embassy_usb::control::{InResponse, OutResponse, Recipient, Request, RequestType};
use embassy_usb::driver::{Driver, Endpoint, EndpointError, EndpointIn, EndpointOut};
use embassy_usb::types::{InterfaceNumber, StringIndex};
use embassy_usb::{Builder, Handler};

use crate::buffer::PacketBox;
use crate::rx::TransferWindow;
use crate::{EcmEvent, Framing, LinkState, Shared, PACKET_SIZE, USB_PACKET_SIZE};

const USB_CLASS_CDC: u8 = 0x02;
const USB_CLASS_CDC_DATA: u8 = 0x0a;
const CDC_SUBCLASS_ECM: u8 = 0x06;

const CS_INTERFACE: u8 = 0x24;
const CDC_TYPE_HEADER: u8 = 0x00;
const CDC_TYPE_UNION: u8 = 0x06;
const CDC_TYPE_ETHERNET: u8 = 0x0F;

const REQ_SET_ETHERNET_PACKET_FILTER: u8 = 0x43;
const REQ_GET_NTB_PARAMETERS: u8 = 0x80;

const NOTIFY_NETWORK_CONNECTION: u8 = 0x00;
const NOTIFY_CONNECTION_SPEED_CHANGE: u8 = 0x2A;

pub(crate) const NTH16_SIG: u32 = 0x484d_434e;
pub(crate) const NDP16_SIG_NOCRC: u32 = 0x304d_434e;

const ALT_SETTING_DISABLED: u8 = 0x00;
const ALT_SETTING_ENABLED: u8 = 0x01;

/// Simple NTB header (NTH+NDP all in one) for sending frames. The datagram
/// itself starts at the next packet boundary (offset 64).
#[repr(C, packed)]
struct NtbOutHeader {
    // NTH16
    nth_sig: u32,
    nth_len: u16,
    nth_seq: u16,
    nth_total_len: u16,
    nth_first_index: u16,

    // NDP16
    ndp_sig: u32,
    ndp_len: u16,
    ndp_next_index: u16,
    ndp_datagram_index: u16,
    ndp_datagram_len: u16,
    ndp_term1: u16,
    ndp_term2: u16,
}

#[repr(C, packed)]
struct NtbParameters {
    length: u16,
    formats_supported: u16,
    in_params: NtbParametersDir,
    out_params: NtbParametersDir,
}

#[repr(C, packed)]
struct NtbParametersDir {
    max_size: u32,
    divisor: u16,
    payload_remainder: u16,
    out_alignment: u16,
    max_datagram_count: u16,
}

fn byteify<T>(buf: &mut [u8], data: T) -> &[u8] {
    let len = size_of::<T>();
    unsafe { core::ptr::copy_nonoverlapping(&data as *const _ as *const u8, buf.as_mut_ptr(), len) }
    &buf[..len]
}

fn le16(buf: &[u8], offset: usize) -> usize {
    u16::from_le_bytes([buf[offset], buf[offset + 1]]) as usize
}

/// Classification of the first bulk packet of an OUT transfer.
#[derive(Debug)]
pub(crate) enum FirstPacket {
    /// No NTH16 signature; the transfer is one raw Ethernet frame.
    Raw,
    /// A well-formed single-datagram NTB.
    Transfer(TransferWindow),
    /// NTB that cannot be delivered; drain `block_len` bytes and drop.
    Discard { block_len: usize },
}

pub(crate) fn classify(first: &[u8], capacity: usize) -> FirstPacket {
    if first.len() < 12 || u32::from_le_bytes([first[0], first[1], first[2], first[3]]) != NTH16_SIG
    {
        return FirstPacket::Raw;
    }

    let block_len = le16(first, 8);
    let ndp_index = le16(first, 10);

    // The single NDP is expected inside the first packet, right after the NTH.
    if ndp_index == 0 || ndp_index + 16 > first.len() {
        warn!("NTB with out-of-reach NDP at {}", ndp_index);
        return FirstPacket::Discard { block_len };
    }
    let ndp_sig = u32::from_le_bytes([
        first[ndp_index],
        first[ndp_index + 1],
        first[ndp_index + 2],
        first[ndp_index + 3],
    ]);
    if ndp_sig != NDP16_SIG_NOCRC {
        warn!("NTB with bad NDP signature {:08x}", ndp_sig);
        return FirstPacket::Discard { block_len };
    }

    let frame_off = le16(first, ndp_index + 8);
    let frame_len = le16(first, ndp_index + 10);
    if frame_len == 0 || frame_off + frame_len > block_len {
        warn!("NTB datagram pointer out of range");
        return FirstPacket::Discard { block_len };
    }
    if frame_len > capacity {
        warn!("discarding too long frame: {} bytes", frame_len);
        return FirstPacket::Discard { block_len };
    }

    FirstPacket::Transfer(TransferWindow::new(block_len, frame_off, frame_len))
}

pub(crate) struct EcmFunction<'d, D: Driver<'d>> {
    pub(crate) comm_ep: D::EndpointIn,
    pub(crate) read_ep: D::EndpointOut,
    pub(crate) write_ep: D::EndpointIn,
    pub(crate) data_if: InterfaceNumber,
}

impl<'d, D: Driver<'d>> EcmFunction<'d, D> {
    pub(crate) fn new(
        builder: &mut Builder<'d, D>,
        control: &'d mut MaybeUninit<EcmControl<'d>>,
        shared: &'d Shared,
    ) -> Self {
        let mut func = builder.function(USB_CLASS_CDC, CDC_SUBCLASS_ECM, 0x00);

        // Control interface
        let mut iface = func.interface();
        let comm_if = iface.interface_number();
        let mac_string = iface.string();
        let mut alt = iface.alt_setting(USB_CLASS_CDC, CDC_SUBCLASS_ECM, 0x00, None);
        alt.descriptor(
            CS_INTERFACE,
            &[
                CDC_TYPE_HEADER, // bDescriptorSubtype
                0x10,
                0x01, // bcdCDC (1.10)
            ],
        );
        alt.descriptor(
            CS_INTERFACE,
            &[
                CDC_TYPE_UNION,        // bDescriptorSubtype
                u8::from(comm_if),     // bControlInterface
                u8::from(comm_if) + 1, // bSubordinateInterface
            ],
        );
        alt.descriptor(
            CS_INTERFACE,
            &[
                CDC_TYPE_ETHERNET,          // bDescriptorSubtype
                u8::from(mac_string),       // iMACAddress
                0,                          // bmEthernetStatistics
                0,                          // |
                0,                          // |
                0,                          // |
                (PACKET_SIZE & 0xff) as u8, // wMaxSegmentSize
                (PACKET_SIZE >> 8) as u8,   // |
                0,                          // wNumberMCFilters
                0,                          // |
                0,                          // bNumberPowerFilters
            ],
        );
        let comm_ep = alt.endpoint_interrupt_in(16, 100);

        // Data interface: alt 0 carries no endpoints, alt 1 the bulk pair.
        let mut iface = func.interface();
        let data_if = iface.interface_number();
        let _alt = iface.alt_setting(USB_CLASS_CDC_DATA, 0x00, 0x00, None);
        let mut alt = iface.alt_setting(USB_CLASS_CDC_DATA, 0x00, 0x00, None);
        let read_ep = alt.endpoint_bulk_out(USB_PACKET_SIZE as u16);
        let write_ep = alt.endpoint_bulk_in(USB_PACKET_SIZE as u16);

        drop(func);
        builder.handler(control.write(EcmControl {
            shared,
            comm_if,
            data_if,
            mac_string,
        }));

        Self {
            comm_ep,
            read_ep,
            write_ep,
            data_if,
        }
    }
}

pub(crate) struct EcmControl<'d> {
    shared: &'d Shared,
    comm_if: InterfaceNumber,
    data_if: InterfaceNumber,
    mac_string: StringIndex,
}

impl<'d> Handler for EcmControl<'d> {
    fn reset(&mut self) {
        if self.shared.link_state() == LinkState::Ecm {
            self.shared.set_link(LinkState::Down);
        }
    }

    fn enabled(&mut self, enabled: bool) {
        if !enabled && self.shared.link_state() == LinkState::Ecm {
            self.shared.set_link(LinkState::Down);
        }
    }

    fn set_alternate_setting(&mut self, iface: InterfaceNumber, alternate_setting: u8) {
        if iface != self.data_if {
            return;
        }
        match alternate_setting {
            ALT_SETTING_ENABLED => {
                info!("ECM data interface selected");
                self.shared.ecm_events.signal(EcmEvent::Activated);
            }
            ALT_SETTING_DISABLED => {
                self.shared.ecm_events.signal(EcmEvent::Deactivated);
            }
            _ => unreachable!(),
        }
    }

    fn control_out(&mut self, req: Request, _data: &[u8]) -> Option<OutResponse> {
        if req.request_type != RequestType::Class || req.recipient != Recipient::Interface {
            return None;
        }
        if req.index != u8::from(self.comm_if) as u16 {
            return None;
        }
        match req.request {
            REQ_SET_ETHERNET_PACKET_FILTER => Some(OutResponse::Accepted),
            _ => Some(OutResponse::Rejected),
        }
    }

    fn control_in<'a>(&'a mut self, req: Request, buf: &'a mut [u8]) -> Option<InResponse<'a>> {
        if req.request_type != RequestType::Class || req.recipient != Recipient::Interface {
            return None;
        }
        if req.index != u8::from(self.comm_if) as u16 {
            return None;
        }
        match req.request {
            REQ_GET_NTB_PARAMETERS => {
                let params = NtbParameters {
                    length: size_of::<NtbParameters>() as u16,
                    formats_supported: 1, // 16-bit only
                    in_params: NtbParametersDir {
                        max_size: 4096,
                        divisor: USB_PACKET_SIZE as u16,
                        payload_remainder: 14,
                        out_alignment: 4,
                        max_datagram_count: 1,
                    },
                    out_params: NtbParametersDir {
                        max_size: (PACKET_SIZE + USB_PACKET_SIZE) as u32,
                        divisor: USB_PACKET_SIZE as u16,
                        payload_remainder: 14,
                        out_alignment: 4,
                        max_datagram_count: 1,
                    },
                };
                Some(InResponse::Accepted(byteify(buf, params)))
            }
            _ => Some(InResponse::Rejected),
        }
    }

    fn get_string(&mut self, index: StringIndex, _lang_id: u16) -> Option<&str> {
        if index == self.mac_string {
            core::str::from_utf8(self.shared.mac_str()).ok()
        } else {
            None
        }
    }
}

fn network_connection_notification(data_if: InterfaceNumber, up: bool) -> [u8; 8] {
    [
        0xA1, // bmRequestType
        NOTIFY_NETWORK_CONNECTION,
        up as u8, // wValue
        0x00,
        u8::from(data_if), // wIndex
        0x00,
        0x00, // wLength
        0x00,
    ]
}

fn connection_speed_notification(data_if: InterfaceNumber) -> [u8; 16] {
    let mut notif = [0u8; 16];
    notif[0] = 0xA1;
    notif[1] = NOTIFY_CONNECTION_SPEED_CHANGE;
    notif[4] = u8::from(data_if);
    notif[6] = 8; // wLength
    notif[8..12].copy_from_slice(&12_000_000u32.to_le_bytes()); // DLBitRate
    notif[12..16].copy_from_slice(&12_000_000u32.to_le_bytes()); // ULBitRate
    notif
}

/// Drives the interrupt pipe: speed + connection notifications when the host
/// selects the data interface, a connection-down notification when RNDIS
/// takes the link over.
pub(crate) async fn link_task<'d, D: Driver<'d>>(
    comm_ep: &mut D::EndpointIn,
    data_if: InterfaceNumber,
    shared: &Shared,
) -> ! {
    loop {
        match shared.ecm_events.wait().await {
            EcmEvent::Activated => {
                // The CDC spec wants a speed notification before the
                // connection one.
                Timer::after_millis(100).await;
                let speed = connection_speed_notification(data_if);
                if comm_ep.write(&speed).await.is_err() {
                    continue;
                }
                let up = network_connection_notification(data_if, true);
                if comm_ep.write(&up).await.is_err() {
                    continue;
                }
                shared.set_link(LinkState::Ecm);
            }
            EcmEvent::Deactivated => {
                if shared.link_state() == LinkState::Ecm {
                    shared.set_link(LinkState::Down);
                }
            }
            EcmEvent::NotifyDown => {
                let down = network_connection_notification(data_if, false);
                let _ = comm_ep.write(&down).await;
            }
        }
    }
}

/// Receive engine. A frame buffer is reserved *before* the first read, so an
/// exhausted pool parks the engine and the bulk OUT endpoint NAKs until a
/// consumer releases a buffer.
pub(crate) async fn rx_task<'d, D: Driver<'d>>(read_ep: &mut D::EndpointOut, shared: &Shared) -> ! {
    loop {
        read_ep.wait_enabled().await;
        debug!("ECM bulk OUT enabled");
        loop {
            let buf = shared.pool.allocate_wait(PACKET_SIZE).await;
            match read_frame::<D>(read_ep, buf, shared).await {
                Ok(Some(frame)) => {
                    shared.frames_rx.fetch_add(1, Ordering::Relaxed);
                    shared.rx.send(frame).await;
                }
                Ok(None) => {}
                Err(EndpointError::Disabled) => break,
                Err(EndpointError::BufferOverflow) => warn!("ECM read overflow"),
            }
        }
    }
}

async fn read_frame<'d, D: Driver<'d>>(
    read_ep: &mut D::EndpointOut,
    mut buf: PacketBox,
    shared: &Shared,
) -> Result<Option<PacketBox>, EndpointError> {
    let mut pkt = [0u8; USB_PACKET_SIZE];
    let n = read_ep.read(&mut pkt).await?;

    match classify(&pkt[..n], buf.capacity()) {
        FirstPacket::Raw => {
            if n == 0 {
                return Ok(None);
            }
            buf.set_len(0);
            let mut overflow = !buf.append(&pkt[..n]);
            let mut m = n;
            while m == USB_PACKET_SIZE {
                m = read_ep.read(&mut pkt).await?;
                if !overflow && !buf.append(&pkt[..m]) {
                    overflow = true;
                }
            }
            if overflow {
                warn!("discarding too long frame");
                Ok(None)
            } else {
                Ok(Some(buf))
            }
        }
        FirstPacket::Transfer(mut transfer) => {
            shared.set_framing(Framing::Ntb);
            buf.set_len(transfer.frame_len());
            transfer.absorb(&pkt[..n], &mut buf);
            let mut short = n < USB_PACKET_SIZE;
            while !short && !transfer.complete() {
                let m = read_ep.read(&mut pkt).await?;
                transfer.absorb(&pkt[..m], &mut buf);
                short = m < USB_PACKET_SIZE;
            }
            if transfer.frame_complete() {
                Ok(Some(buf))
            } else {
                warn!("truncated NTB transfer");
                Ok(None)
            }
        }
        FirstPacket::Discard { block_len } => {
            shared.set_framing(Framing::Ntb);
            let mut received = n;
            let mut m = n;
            while m == USB_PACKET_SIZE && received < block_len {
                m = read_ep.read(&mut pkt).await?;
                received += m;
            }
            Ok(None)
        }
    }
}

/// Writes one Ethernet frame in the currently latched framing.
pub(crate) async fn write_frame<'d, D: Driver<'d>>(
    write_ep: &mut D::EndpointIn,
    framing: Framing,
    seq: &mut u16,
    buf: &PacketBox,
) -> Result<(), EndpointError> {
    if let Framing::Ntb = framing {
        let header = NtbOutHeader {
            nth_sig: NTH16_SIG,
            nth_len: 0x0c,
            nth_seq: *seq,
            nth_total_len: (buf.len() + USB_PACKET_SIZE) as u16,
            nth_first_index: 0x0c,

            ndp_sig: NDP16_SIG_NOCRC,
            ndp_len: 0x10,
            ndp_next_index: 0x00,
            ndp_datagram_index: USB_PACKET_SIZE as u16,
            ndp_datagram_len: buf.len() as u16,
            ndp_term1: 0x00,
            ndp_term2: 0x00,
        };
        *seq = seq.wrapping_add(1);

        // The header occupies the whole first packet; the datagram starts on
        // the next packet boundary.
        let mut first = [0u8; USB_PACKET_SIZE];
        byteify(&mut first, header);
        write_ep.write(&first).await?;
    }

    for chunk in buf.chunks(USB_PACKET_SIZE) {
        write_ep.write(chunk).await?;
    }
    if buf.len() % USB_PACKET_SIZE == 0 {
        // ZLP so the host sees the end of the transfer.
        write_ep.write(&[]).await?;
    }
    Ok(())
}
