//! IPv6-over-USB gadget on an nRF52840: plug it in, ping it, curl it.
//!
//! The device enumerates as RNDIS + CDC-Ethernet, autoconfigures the host
//! through router advertisements and serves HTTP on 80 plus the echo /
//! discard / chargen diagnostics.

#![no_std]
#![no_main]

use core::fmt::Write;

use defmt::*;
use embassy_executor::Spawner;
use embassy_nrf::usb::vbus_detect::HardwareVbusDetect;
use embassy_nrf::usb::Driver;
use embassy_nrf::{bind_interrupts, peripherals, usb};
use embassy_usb::{Builder, Config, UsbDevice};
use static_cell::StaticCell;

use usbnet::{LinkHandle, PacketPool, State, UsbNet};
use usbnet_stack::http::{self, HttpRequest};
use usbnet_stack::{ConnCtx, Stack, TcpIo, HOST_MAC};

use defmt_rtt as _;
use panic_probe as _;

bind_interrupts!(struct Irqs {
    USBD => usb::InterruptHandler<peripherals::USBD>;
    POWER_CLOCK => usb::vbus_detect::InterruptHandler;
});

const SERIAL: u32 = 0xD400_0001;

type MyDriver = Driver<'static, peripherals::USBD, HardwareVbusDetect>;

static POOL: PacketPool = PacketPool::new();

#[embassy_executor::task]
async fn usb_task(mut device: UsbDevice<'static, MyDriver>) -> ! {
    device.run().await
}

#[embassy_executor::task]
async fn link_task(usbnet: UsbNet<'static, MyDriver>) -> ! {
    usbnet.run().await
}

#[embassy_executor::task]
async fn stack_task(link: LinkHandle<'static>) -> ! {
    let mut stack = Stack::new(link, &POOL, SERIAL);
    stack.register_diagnostics();
    stack.serve_http();
    stack.http_mut().route("/api/firmware.bin", firmware_bin);
    stack.run().await
}

/// Flash is memory-mapped from address zero on this part.
const FIRMWARE_BASE: usize = 0x0000_0000;
const FIRMWARE_SIZE: u32 = 32 * 1024;

/// Streams the running firmware image as a chunked download, one chunk per
/// poll, paced on the USB transmit queue.
fn firmware_bin(io: &mut TcpIo<'_, '_>, request: Option<&HttpRequest<'_>>) {
    match request {
        Some(_) => {
            http::start_response(io, 200, "application/octet-stream", "", false);
        }
        None => {
            if io.tx_pending() >= 2 {
                return;
            }
            let cursor = match io.ctx() {
                ConnCtx::Http(h) => h.cursor,
                _ => return,
            };
            if cursor >= FIRMWARE_SIZE {
                http::end_response(io);
                return;
            }
            let n = ((FIRMWARE_SIZE - cursor) as usize).min(http::CHUNK_SIZE);
            let Some(mut chunk) = http::allocate_chunk(io, n) else {
                return;
            };
            let data = unsafe {
                core::slice::from_raw_parts((FIRMWARE_BASE + cursor as usize) as *const u8, n)
            };
            chunk.append(data);
            if let ConnCtx::Http(h) = io.ctx() {
                h.cursor = cursor + n as u32;
            }
            http::send_chunk(io, chunk);
        }
    }
}

struct Resources {
    config_descriptor: [u8; 256],
    bos_descriptor: [u8; 64],
    msos_descriptor: [u8; 196],
    control_buf: [u8; 128],
    state: State<'static>,
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let p = embassy_nrf::init(Default::default());
    info!("boot, serial {:08x}", SERIAL);

    let driver = Driver::new(p.USBD, Irqs, HardwareVbusDetect::new(Irqs));

    static STRINGS: StaticCell<(heapless::String<32>, heapless::String<16>)> = StaticCell::new();
    let (product, serial_str) = STRINGS.init((heapless::String::new(), heapless::String::new()));
    let _ = write!(product, "USB IPv6 gadget {:08X}", SERIAL);
    let _ = write!(serial_str, "{:08X}", SERIAL);

    let mut config = Config::new(0x1d6b, 0x0129);
    config.manufacturer = Some("devEmbedded");
    config.product = Some(product.as_str());
    config.serial_number = Some(serial_str.as_str());
    config.max_packet_size_0 = 64;
    // Composite device with IADs, so Windows matches per-function.
    config.device_class = 0xEF;
    config.device_sub_class = 0x02;
    config.device_protocol = 0x01;
    config.composite_with_iads = true;

    static RESOURCES: StaticCell<Resources> = StaticCell::new();
    let res = RESOURCES.init(Resources {
        config_descriptor: [0; 256],
        bos_descriptor: [0; 64],
        msos_descriptor: [0; 196],
        control_buf: [0; 128],
        state: State::new(&POOL),
    });

    let mut builder = Builder::new(
        driver,
        config,
        &mut res.config_descriptor,
        &mut res.bos_descriptor,
        &mut res.msos_descriptor,
        &mut res.control_buf,
    );

    let usbnet = UsbNet::new(&mut builder, &mut res.state, HOST_MAC.0);
    let link = usbnet.link();

    let usb = builder.build();

    unwrap!(spawner.spawn(usb_task(usb)));
    unwrap!(spawner.spawn(link_task(usbnet)));
    unwrap!(spawner.spawn(stack_task(link)));
}
