//! Remote NDIS function: encapsulated control messages over the default
//! pipe, RESPONSE_AVAILABLE notifications on the interrupt pipe, and
//! 44-byte-header packet framing on the bulk pipes.

use core::mem::MaybeUninit;
use core::sync::atomic::Ordering;

use embassy_usb::control::{InResponse, OutResponse, Recipient, Request, RequestType};
use embassy_usb::driver::{Driver, Endpoint, EndpointError, EndpointIn, EndpointOut};
use embassy_usb::msos;
use embassy_usb::types::InterfaceNumber;
use embassy_usb::{Builder, Handler};

use crate::buffer::PacketBox;
use crate::rx::TransferWindow;
use crate::{LinkState, Shared, PACKET_SIZE, USB_PACKET_SIZE};

const USB_CLASS_CDC: u8 = 0x02;
const USB_CLASS_CDC_DATA: u8 = 0x0a;
const CDC_SUBCLASS_ACM: u8 = 0x02;

const REQ_SEND_ENCAPSULATED_COMMAND: u8 = 0x00;
const REQ_GET_ENCAPSULATED_RESPONSE: u8 = 0x01;

const PACKET_MSG: u32 = 0x0000_0001;
const INITIALIZE_MSG: u32 = 0x0000_0002;
const HALT_MSG: u32 = 0x0000_0003;
const QUERY_MSG: u32 = 0x0000_0004;
const SET_MSG: u32 = 0x0000_0005;
const RESET_MSG: u32 = 0x0000_0006;
const KEEPALIVE_MSG: u32 = 0x0000_0008;
const COMPLETION: u32 = 0x8000_0000;

const STATUS_SUCCESS: u32 = 0x0000_0000;
const STATUS_NOT_SUPPORTED: u32 = 0xC000_00BB;

const OID_GEN_SUPPORTED_LIST: u32 = 0x0001_0101;
const OID_GEN_MAXIMUM_FRAME_SIZE: u32 = 0x0001_0106;
const OID_GEN_LINK_SPEED: u32 = 0x0001_0107;
const OID_GEN_TRANSMIT_BLOCK_SIZE: u32 = 0x0001_010A;
const OID_GEN_RECEIVE_BLOCK_SIZE: u32 = 0x0001_010B;
const OID_GEN_CURRENT_PACKET_FILTER: u32 = 0x0001_010E;
const OID_GEN_MAXIMUM_TOTAL_SIZE: u32 = 0x0001_0111;
const OID_GEN_MEDIA_CONNECT_STATUS: u32 = 0x0001_0114;
const OID_GEN_PHYSICAL_MEDIUM: u32 = 0x0001_0202;
const OID_GEN_XMIT_OK: u32 = 0x0002_0101;
const OID_GEN_RCV_OK: u32 = 0x0002_0102;
const OID_802_3_PERMANENT_ADDRESS: u32 = 0x0101_0101;
const OID_802_3_CURRENT_ADDRESS: u32 = 0x0101_0102;

const SUPPORTED_OIDS: [u32; 12] = [
    OID_GEN_SUPPORTED_LIST,
    OID_GEN_MAXIMUM_FRAME_SIZE,
    OID_GEN_LINK_SPEED,
    OID_GEN_TRANSMIT_BLOCK_SIZE,
    OID_GEN_RECEIVE_BLOCK_SIZE,
    OID_GEN_MAXIMUM_TOTAL_SIZE,
    OID_GEN_MEDIA_CONNECT_STATUS,
    OID_GEN_PHYSICAL_MEDIUM,
    OID_GEN_XMIT_OK,
    OID_GEN_RCV_OK,
    OID_802_3_PERMANENT_ADDRESS,
    OID_802_3_CURRENT_ADDRESS,
];

/// Size of the packet message header prefixed to every data frame.
pub(crate) const PACKET_HEADER_SIZE: usize = 44;

fn le32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn put32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) struct RndisFunction<'d, D: Driver<'d>> {
    pub(crate) comm_ep: D::EndpointIn,
    pub(crate) read_ep: D::EndpointOut,
    pub(crate) write_ep: D::EndpointIn,
}

impl<'d, D: Driver<'d>> RndisFunction<'d, D> {
    pub(crate) fn new(
        builder: &mut Builder<'d, D>,
        control: &'d mut MaybeUninit<RndisControl<'d>>,
        shared: &'d Shared,
    ) -> Self {
        let mut func = builder.function(0xEF, 0x04, 0x01);
        // Windows matches this against its inbox RNDIS driver.
        func.msos_feature(msos::CompatibleIdFeatureDescriptor::new("RNDIS", "5162001"));

        let mut iface = func.interface();
        let comm_if = iface.interface_number();
        let mut alt = iface.alt_setting(USB_CLASS_CDC, CDC_SUBCLASS_ACM, 0xFF, None);
        let comm_ep = alt.endpoint_interrupt_in(8, 1);

        let mut iface = func.interface();
        let mut alt = iface.alt_setting(USB_CLASS_CDC_DATA, 0x00, 0x00, None);
        let read_ep = alt.endpoint_bulk_out(USB_PACKET_SIZE as u16);
        let write_ep = alt.endpoint_bulk_in(USB_PACKET_SIZE as u16);

        drop(func);
        builder.handler(control.write(RndisControl { shared, comm_if }));

        Self {
            comm_ep,
            read_ep,
            write_ep,
        }
    }
}

pub(crate) struct RndisControl<'d> {
    shared: &'d Shared,
    comm_if: InterfaceNumber,
}

impl<'d> Handler for RndisControl<'d> {
    fn reset(&mut self) {
        if self.shared.link_state() == LinkState::Rndis {
            self.shared.set_link(LinkState::Down);
        }
    }

    fn enabled(&mut self, enabled: bool) {
        if !enabled && self.shared.link_state() == LinkState::Rndis {
            self.shared.set_link(LinkState::Down);
        }
    }

    fn control_out(&mut self, req: Request, data: &[u8]) -> Option<OutResponse> {
        if req.request_type != RequestType::Class || req.recipient != Recipient::Interface {
            return None;
        }
        if req.index != u8::from(self.comm_if) as u16 {
            return None;
        }
        match req.request {
            REQ_SEND_ENCAPSULATED_COMMAND => {
                self.handle_command(data);
                Some(OutResponse::Accepted)
            }
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
            REQ_GET_ENCAPSULATED_RESPONSE => {
                let resp = self
                    .shared
                    .rndis_responses
                    .lock(|q| q.borrow_mut().pop_front());
                match resp {
                    Some(resp) => {
                        let n = resp.len().min(buf.len());
                        buf[..n].copy_from_slice(&resp[..n]);
                        Some(InResponse::Accepted(&buf[..n]))
                    }
                    None => Some(InResponse::Accepted(&[])),
                }
            }
            _ => Some(InResponse::Rejected),
        }
    }
}

impl<'d> RndisControl<'d> {
    fn prepare_response(&self, size: usize, msg_type: u32, req_id: u32) -> Option<PacketBox> {
        let mut buf = self.shared.pool.allocate(size)?;
        buf.set_len(size);
        buf.fill(0);
        put32(&mut buf, 0, msg_type | COMPLETION);
        put32(&mut buf, 4, size as u32);
        put32(&mut buf, 8, req_id);
        put32(&mut buf, 12, STATUS_SUCCESS);
        Some(buf)
    }

    fn respond(&self, resp: PacketBox) {
        let overflow = self
            .shared
            .rndis_responses
            .lock(|q| q.borrow_mut().push_back(resp).err());
        match overflow {
            None => self.shared.rndis_notify.signal(()),
            // Dropped here, outside the queue's critical section.
            Some(_resp) => warn!("RNDIS response queue full, dropping reply"),
        }
    }

    pub(crate) fn handle_command(&mut self, data: &[u8]) {
        if data.len() < 12 {
            warn!("runt RNDIS command ({} bytes)", data.len());
            return;
        }
        let msg_type = le32(data, 0);
        let req_id = le32(data, 8);
        trace!("RNDIS request {:08x}", msg_type);

        match msg_type {
            INITIALIZE_MSG => {
                let Some(mut resp) = self.prepare_response(52, INITIALIZE_MSG, req_id) else {
                    return;
                };
                put32(&mut resp, 16, 1); // MajorVersion
                put32(&mut resp, 20, 0); // MinorVersion
                put32(&mut resp, 24, 0x10); // DeviceFlags: connectionless
                put32(&mut resp, 28, 0); // Medium: 802.3
                put32(&mut resp, 32, 1); // MaxPacketsPerTransfer
                put32(&mut resp, 36, (36 + PACKET_SIZE) as u32); // MaxTransferSize
                put32(&mut resp, 40, 2); // PacketAlignmentFactor
                self.respond(resp);
            }
            HALT_MSG => {
                info!("RNDIS halt");
                if self.shared.link_state() == LinkState::Rndis {
                    self.shared.set_link(LinkState::Down);
                }
            }
            QUERY_MSG => {
                if data.len() < 16 {
                    return;
                }
                self.handle_query(le32(data, 12), req_id);
            }
            SET_MSG => {
                if data.len() < 24 {
                    return;
                }
                self.handle_set(data, req_id);
            }
            RESET_MSG => {
                info!("RNDIS reset");
                if self.shared.link_state() == LinkState::Rndis {
                    self.shared.set_link(LinkState::Down);
                }
                let Some(mut resp) = self.shared.pool.allocate(16) else {
                    return;
                };
                resp.set_len(16);
                resp.fill(0);
                put32(&mut resp, 0, RESET_MSG | COMPLETION);
                put32(&mut resp, 4, 16);
                put32(&mut resp, 8, STATUS_SUCCESS);
                put32(&mut resp, 12, 0); // AddressingReset
                self.respond(resp);
            }
            KEEPALIVE_MSG => {
                if let Some(resp) = self.prepare_response(16, KEEPALIVE_MSG, req_id) {
                    self.respond(resp);
                }
            }
            other => {
                warn!("unhandled RNDIS message {:08x}", other);
            }
        }
    }

    fn handle_query(&mut self, oid: u32, req_id: u32) {
        trace!("RNDIS query {:08x}", oid);

        let mut info = heapless::Vec::<u8, 48>::new();
        let mut status = STATUS_SUCCESS;
        let mut put = |v: u32| {
            let _ = info.extend_from_slice(&v.to_le_bytes());
        };

        match oid {
            OID_GEN_SUPPORTED_LIST => SUPPORTED_OIDS.iter().for_each(|&oid| put(oid)),
            OID_GEN_MAXIMUM_FRAME_SIZE => put((PACKET_SIZE - 14) as u32),
            OID_GEN_LINK_SPEED => put(100_000), // units of 100 bit/s
            OID_GEN_TRANSMIT_BLOCK_SIZE | OID_GEN_RECEIVE_BLOCK_SIZE => put(PACKET_SIZE as u32),
            OID_GEN_MAXIMUM_TOTAL_SIZE => put(2048),
            OID_GEN_MEDIA_CONNECT_STATUS => put(0), // connected
            OID_GEN_PHYSICAL_MEDIUM => put(0),      // Ethernet
            OID_GEN_CURRENT_PACKET_FILTER => {
                put(if self.shared.link_state() == LinkState::Rndis {
                    0xFFFF_FFFF
                } else {
                    0
                })
            }
            OID_GEN_XMIT_OK => put(self.shared.frames_tx.load(Ordering::Relaxed)),
            OID_GEN_RCV_OK => put(self.shared.frames_rx.load(Ordering::Relaxed)),
            OID_802_3_PERMANENT_ADDRESS | OID_802_3_CURRENT_ADDRESS => {
                let _ = info.extend_from_slice(&self.shared.host_mac);
            }
            other => {
                warn!("RNDIS unsupported query {:08x}", other);
                status = STATUS_NOT_SUPPORTED;
            }
        }

        let Some(mut resp) = self.prepare_response(24 + info.len(), QUERY_MSG, req_id) else {
            return;
        };
        put32(&mut resp, 12, status);
        if !info.is_empty() {
            put32(&mut resp, 16, info.len() as u32); // InformationBufferLength
            put32(&mut resp, 20, 16); // InformationBufferOffset, from RequestID
            resp[24..24 + info.len()].copy_from_slice(&info);
        }
        self.respond(resp);
    }

    fn handle_set(&mut self, data: &[u8], req_id: u32) {
        let oid = le32(data, 12);
        let info_len = le32(data, 16) as usize;
        let info_offset = le32(data, 20) as usize;
        trace!("RNDIS set {:08x}", oid);

        let mut status = STATUS_SUCCESS;
        match oid {
            OID_GEN_CURRENT_PACKET_FILTER => {
                // The buffer offset is counted from the RequestID field.
                let at = 8 + info_offset;
                let filter = if info_len >= 4 && at + 4 <= data.len() {
                    le32(data, at)
                } else {
                    0
                };
                if filter != 0 {
                    info!("RNDIS link up (filter {:08x})", filter);
                    self.shared.set_link(LinkState::Rndis);
                } else {
                    info!("RNDIS link down");
                    if self.shared.link_state() == LinkState::Rndis {
                        self.shared.set_link(LinkState::Down);
                    }
                }
            }
            other => {
                warn!("RNDIS unsupported set {:08x}", other);
                status = STATUS_NOT_SUPPORTED;
            }
        }

        let Some(mut resp) = self.prepare_response(16, SET_MSG, req_id) else {
            return;
        };
        put32(&mut resp, 12, status);
        self.respond(resp);
    }
}

/// Raises RESPONSE_AVAILABLE on the interrupt pipe whenever the control
/// handler queues a reply.
pub(crate) async fn notify_task<'d, D: Driver<'d>>(
    comm_ep: &mut D::EndpointIn,
    shared: &Shared,
) -> ! {
    loop {
        shared.rndis_notify.wait().await;
        let notif = [0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let _ = comm_ep.write(&notif).await;
    }
}

/// Classification of the first bulk packet of an OUT transfer.
#[derive(Debug)]
pub(crate) enum FirstPacket {
    /// ZLP-style terminator or unknown message; nothing to deliver.
    Ignore,
    /// A well-formed packet message.
    Transfer(TransferWindow),
    /// Frame too long for the pool; drain `msg_len` bytes and drop.
    Discard { msg_len: usize },
}

pub(crate) fn classify(first: &[u8], capacity: usize) -> FirstPacket {
    if first.len() < 16 {
        // Short packets down here are ZLP-ish terminators, not headers.
        return FirstPacket::Ignore;
    }
    let msg_type = le32(first, 0);
    if msg_type != PACKET_MSG {
        warn!("RNDIS unknown message {:08x}", msg_type);
        return FirstPacket::Ignore;
    }

    let msg_len = le32(first, 4) as usize;
    let frame_off = le32(first, 8) as usize + 8;
    let frame_len = le32(first, 12) as usize;

    if frame_len == 0 || frame_off + frame_len > msg_len {
        warn!("RNDIS packet message with bad data pointer");
        return FirstPacket::Ignore;
    }
    if frame_len > capacity {
        warn!("discarding too long frame: {} bytes", frame_len);
        return FirstPacket::Discard { msg_len };
    }

    FirstPacket::Transfer(TransferWindow::new(msg_len, frame_off, frame_len))
}

/// Receive engine; mirrors the ECM one but with packet-message framing.
pub(crate) async fn rx_task<'d, D: Driver<'d>>(read_ep: &mut D::EndpointOut, shared: &Shared) -> ! {
    loop {
        read_ep.wait_enabled().await;
        debug!("RNDIS bulk OUT enabled");
        loop {
            let buf = shared.pool.allocate_wait(PACKET_SIZE).await;
            match read_frame::<D>(read_ep, buf, shared).await {
                Ok(Some(frame)) => {
                    shared.frames_rx.fetch_add(1, Ordering::Relaxed);
                    shared.rx.send(frame).await;
                }
                Ok(None) => {}
                Err(EndpointError::Disabled) => break,
                Err(EndpointError::BufferOverflow) => warn!("RNDIS read overflow"),
            }
        }
    }
}

async fn read_frame<'d, D: Driver<'d>>(
    read_ep: &mut D::EndpointOut,
    mut buf: PacketBox,
    _shared: &Shared,
) -> Result<Option<PacketBox>, EndpointError> {
    let mut pkt = [0u8; USB_PACKET_SIZE];
    let n = read_ep.read(&mut pkt).await?;

    match classify(&pkt[..n], buf.capacity()) {
        FirstPacket::Ignore => Ok(None),
        FirstPacket::Transfer(mut transfer) => {
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
                warn!("truncated RNDIS transfer");
                Ok(None)
            }
        }
        FirstPacket::Discard { msg_len } => {
            let mut received = n;
            let mut m = n;
            while m == USB_PACKET_SIZE && received < msg_len {
                m = read_ep.read(&mut pkt).await?;
                received += m;
            }
            Ok(None)
        }
    }
}

/// Writes one Ethernet frame behind a packet-message header. The header and
/// the frame head share the first bulk packet.
pub(crate) async fn write_frame<'d, D: Driver<'d>>(
    write_ep: &mut D::EndpointIn,
    buf: &PacketBox,
) -> Result<(), EndpointError> {
    let mut first = [0u8; USB_PACKET_SIZE];
    put32(&mut first, 0, PACKET_MSG);
    put32(&mut first, 4, (PACKET_HEADER_SIZE + buf.len()) as u32);
    put32(&mut first, 8, (PACKET_HEADER_SIZE - 8) as u32); // DataOffset
    put32(&mut first, 12, buf.len() as u32); // DataLength

    let head = (USB_PACKET_SIZE - PACKET_HEADER_SIZE).min(buf.len());
    first[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + head].copy_from_slice(&buf[..head]);
    write_ep.write(&first[..PACKET_HEADER_SIZE + head]).await?;

    if PACKET_HEADER_SIZE + head == USB_PACKET_SIZE {
        let rest = &buf[head..];
        for chunk in rest.chunks(USB_PACKET_SIZE) {
            write_ep.write(chunk).await?;
        }
        if rest.len() % USB_PACKET_SIZE == 0 {
            write_ep.write(&[]).await?;
        }
    }
    Ok(())
}
