#[cfg(target_os = "linux")]
mod linux;
#[cfg(not(target_os = "linux"))]
mod other;

#[cfg(target_os = "linux")]
use linux::is_port_open;
#[cfg(not(target_os = "linux"))]
use other::is_port_open;

pub use tokio_serial::SerialStream;

use anyhow::Result;
use log::debug;
use serialport::{self, SerialPortType};
use thiserror::Error;
use tokio_serial::SerialPortBuilderExt;

#[derive(Error, Debug)]
pub enum OpenPortError {
    #[error("no compatible radio adapters found")]
    NoCompatiblePort,
    #[error("{port_name:?} busy")]
    PortBusy { port_name: String },
}

#[derive(PartialEq)]
struct UsbId(u16, u16);

static COMPATIBLE_IDS: &[UsbId] = &[
    UsbId(0x10c4, 0xea60), // Silicon Labs CP210x UART Bridge
    UsbId(0x1a86, 0x55d4), // QinHeng Electronics CH9102F
    UsbId(0x1a86, 0x7523), // QinHeng Electronics HL-340 USB-Serial adapter
    UsbId(0x0403, 0x6015), // FTDI FT231X
    UsbId(0x303a, 0x4001), // Espressif USB JTAG/serial bridge
];

/// Opens `port_name` (or the first known radio adapter for `"auto"`).
pub fn open_port_async(port_name: &str, baudrate: u32, force: bool) -> Result<SerialStream> {
    let true_name: String = if port_name == "auto" {
        guess_port()?
    } else {
        port_name.to_string()
    };

    if !force && is_port_open(&true_name) {
        return Err(OpenPortError::PortBusy {
            port_name: true_name,
        }
        .into());
    }

    let port = tokio_serial::new(&true_name, baudrate).open_native_async()?;

    debug!("open_port OK: {} @ {} baud", &true_name, baudrate);
    Ok(port)
}

pub fn guess_port() -> Result<String> {
    serialport::available_ports()?
        .into_iter()
        .filter(|info| match &info.port_type {
            SerialPortType::UsbPort(usb_info) => {
                COMPATIBLE_IDS.contains(&UsbId(usb_info.vid, usb_info.pid))
            }
            SerialPortType::Unknown | SerialPortType::PciPort | SerialPortType::BluetoothPort => {
                false
            }
        })
        .map(|info| info.port_name)
        .next()
        .ok_or_else(|| OpenPortError::NoCompatiblePort.into())
}
