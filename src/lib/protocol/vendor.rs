use std::{fmt::Display, str::FromStr};

use anyhow::Result;
use async_trait::async_trait;
use itertools::Itertools;
use thiserror::Error;

/// Status byte returned by the vendor stack; zero means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorStatus(pub u8);

impl VendorStatus {
    pub const SUCCESS: VendorStatus = VendorStatus(0x00);

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

impl Display for VendorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Bootloader flavor requested through `launch_bootloader`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BootloaderMode {
    Standalone = 0x01,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardInfo {
    pub manufacturer: String,
    pub board: String,
    pub version: String,
}

#[derive(Error, Debug)]
pub enum Eui64Error {
    #[error("invalid IEEE address '{0}'")]
    BadAddress(String),
}

/// IEEE 802.15.4 extended address, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Eui64(pub [u8; 8]);

impl Display for Eui64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.iter().map(|b| format!("{:02x}", b)).join(":"))
    }
}

impl FromStr for Eui64 {
    type Err = Eui64Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let digits: String = input.chars().filter(|&c| c != ':' && c != '-').collect();
        let bytes = hex::decode(&digits).map_err(|_| Eui64Error::BadAddress(input.to_string()))?;
        let bytes: [u8; 8] = bytes
            .try_into()
            .map_err(|_| Eui64Error::BadAddress(input.to_string()))?;
        Ok(Eui64(bytes))
    }
}

/// Vendor network stack running on the coprocessor.
#[async_trait]
pub trait VendorStack: Send {
    async fn get_board_info(&mut self) -> Result<BoardInfo>;
    async fn get_eui64(&mut self) -> Result<Eui64>;

    /// False once a custom address has been burnt into the device.
    async fn can_write_custom_eui64(&mut self) -> Result<bool>;

    async fn write_eui64(&mut self, eui64: Eui64, persist: bool) -> Result<VendorStatus>;
    async fn launch_bootloader(&mut self, mode: BootloaderMode) -> Result<VendorStatus>;
    async fn dump_config(&mut self) -> Result<Vec<(String, u32)>>;

    async fn close(&mut self) {}
}
