mod state_machine;
mod version;

use std::{collections::HashMap, fmt::Display, str::FromStr, time::Duration};

use thiserror::Error;

pub use state_machine::StateMachine;
pub use version::{Version, VersionError};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplicationType {
    Bootloader,
    Cpc,
    Ezsp,
    Spinel,
    Router,
}

impl ApplicationType {
    pub const ALL: [ApplicationType; 5] = [
        ApplicationType::Bootloader,
        ApplicationType::Cpc,
        ApplicationType::Ezsp,
        ApplicationType::Spinel,
        ApplicationType::Router,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationType::Bootloader => "bootloader",
            ApplicationType::Cpc => "cpc",
            ApplicationType::Ezsp => "ezsp",
            ApplicationType::Spinel => "spinel",
            ApplicationType::Router => "router",
        }
    }
}

impl Display for ApplicationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}

#[derive(Error, Debug)]
pub enum ApplicationTypeError {
    #[error("invalid application type '{0}'")]
    BadApplicationType(String),
}

impl FromStr for ApplicationType {
    type Err = ApplicationTypeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        ApplicationType::ALL
            .into_iter()
            .find(|app_type| app_type.as_str() == input)
            .ok_or_else(|| ApplicationTypeError::BadApplicationType(input.to_string()))
    }
}

pub fn default_baudrates() -> HashMap<ApplicationType, Vec<u32>> {
    HashMap::from([
        (ApplicationType::Bootloader, vec![115200]),
        (ApplicationType::Cpc, vec![460800, 115200, 230400]),
        (ApplicationType::Ezsp, vec![115200]),
        (ApplicationType::Spinel, vec![460800]),
        (ApplicationType::Router, vec![115200]),
    ])
}

pub fn default_probe_methods() -> Vec<ApplicationType> {
    vec![
        ApplicationType::Bootloader,
        ApplicationType::Cpc,
        ApplicationType::Ezsp,
        ApplicationType::Spinel,
        ApplicationType::Router,
    ]
}

/// Pads `data` with `fill` up to the next multiple of `multiple` bytes.
pub fn pad_to_multiple(data: &[u8], multiple: usize, fill: u8) -> Vec<u8> {
    let remainder = data.len() % multiple;
    let mut padded = data.to_vec();

    if remainder != 0 {
        padded.resize(data.len() + multiple - remainder, fill);
    }

    padded
}
