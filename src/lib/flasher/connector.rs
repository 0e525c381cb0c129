use anyhow::Result;
use async_trait::async_trait;
use log::info;

use crate::common::ApplicationType;
use crate::port::open_port_async;
use crate::protocol::{
    cpc::CpcProtocol, router::RouterProtocol, vendor::VendorStack, ApplicationProtocol,
    Bootloader, ProtocolError,
};
use crate::reset::{self, ResetTarget};

/// Opens protocol sessions to one device and fires its reset line.
///
/// Every `connect_*` call returns a fresh connection owned by the caller.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Whether this connector can talk `app_type` at all.
    fn supports(&self, app_type: ApplicationType) -> bool;

    async fn connect_bootloader(&self, baudrate: u32) -> Result<Box<dyn Bootloader>>;

    /// Connects to the CPC, Spinel or router application.
    async fn connect_application(
        &self,
        app_type: ApplicationType,
        baudrate: u32,
    ) -> Result<Box<dyn ApplicationProtocol>>;

    async fn connect_vendor_stack(&self, baudrate: u32) -> Result<Box<dyn VendorStack>>;

    /// Pulses the reset lines without waiting for any acknowledgement.
    /// `baudrate` is used by serial resets.
    async fn trigger_reset(&self, target: ResetTarget, baudrate: u32) -> Result<()>;
}

/// Connector for a device on a local serial port.
pub struct SerialConnector {
    device: String,
    force: bool,
}

impl SerialConnector {
    pub fn new(device: &str, force: bool) -> Self {
        Self {
            device: device.to_string(),
            force,
        }
    }

    fn unsupported(what: &str) -> anyhow::Error {
        ProtocolError::Unsupported(what.to_string()).into()
    }
}

#[async_trait]
impl Connector for SerialConnector {
    fn supports(&self, app_type: ApplicationType) -> bool {
        matches!(app_type, ApplicationType::Cpc | ApplicationType::Router)
    }

    async fn connect_bootloader(&self, _baudrate: u32) -> Result<Box<dyn Bootloader>> {
        Err(Self::unsupported("bootloader"))
    }

    async fn connect_application(
        &self,
        app_type: ApplicationType,
        baudrate: u32,
    ) -> Result<Box<dyn ApplicationProtocol>> {
        match app_type {
            ApplicationType::Cpc => {
                let port = open_port_async(&self.device, baudrate, self.force)?;
                Ok(Box::new(CpcProtocol::new(port)))
            }
            ApplicationType::Router => {
                let port = open_port_async(&self.device, baudrate, self.force)?;
                Ok(Box::new(RouterProtocol::new(port)))
            }
            other => Err(Self::unsupported(other.as_str())),
        }
    }

    async fn connect_vendor_stack(&self, _baudrate: u32) -> Result<Box<dyn VendorStack>> {
        Err(Self::unsupported("ezsp"))
    }

    async fn trigger_reset(&self, target: ResetTarget, baudrate: u32) -> Result<()> {
        info!("Triggering {} bootloader", target);

        match target.gpio_pattern() {
            Some(pattern) => reset::send_gpio_pattern(&pattern).await,
            None => {
                let mut port = open_port_async(&self.device, baudrate, self.force)?;
                reset::send_serial_pulse(&mut port).await
            }
        }
    }
}
