#[cfg(target_os = "linux")]
mod linux;
#[cfg(not(target_os = "linux"))]
mod other;

#[cfg(target_os = "linux")]
pub use linux::send_gpio_pattern;
#[cfg(not(target_os = "linux"))]
pub use other::send_gpio_pattern;

use std::{fmt::Display, str::FromStr, time::Duration};

use anyhow::Result;
use log::debug;
use thiserror::Error;
use tokio_serial::SerialStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTarget {
    Yellow,
    Ihost,
    Sonoff,
}

impl ResetTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetTarget::Yellow => "yellow",
            ResetTarget::Ihost => "ihost",
            ResetTarget::Sonoff => "sonoff",
        }
    }

    /// GPIO wiring for boards that reset the radio through GPIO lines.
    pub fn gpio_pattern(&self) -> Option<GpioPattern> {
        match self {
            ResetTarget::Yellow => Some(GpioPattern {
                chip: "/dev/gpiochip0",
                pins: &[
                    (24, &[true, false, false, true]),
                    (25, &[true, false, true, true]),
                ],
                toggle_delay: Duration::from_millis(100),
            }),
            ResetTarget::Ihost => Some(GpioPattern {
                chip: "/dev/gpiochip1",
                pins: &[
                    (27, &[true, false, false, true]),
                    (26, &[true, false, true, true]),
                ],
                toggle_delay: Duration::from_millis(100),
            }),
            ResetTarget::Sonoff => None,
        }
    }
}

impl Display for ResetTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}

#[derive(Error, Debug)]
pub enum ResetTargetError {
    #[error("invalid reset target '{0}'")]
    BadResetTarget(String),
}

impl FromStr for ResetTarget {
    type Err = ResetTargetError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "yellow" => Ok(ResetTarget::Yellow),
            "ihost" => Ok(ResetTarget::Ihost),
            "sonoff" => Ok(ResetTarget::Sonoff),
            _ => Err(ResetTargetError::BadResetTarget(input.to_string())),
        }
    }
}

/// Sequence of output levels driven on a set of GPIO lines.
#[derive(Debug, Clone)]
pub struct GpioPattern {
    pub chip: &'static str,
    pub pins: &'static [(u32, &'static [bool])],
    pub toggle_delay: Duration,
}

impl GpioPattern {
    /// Line levels per step; the first step is applied when the lines are requested.
    pub fn steps(&self) -> Vec<Vec<bool>> {
        let count = self
            .pins
            .iter()
            .map(|(_, states)| states.len())
            .min()
            .unwrap_or(0);

        (0..count)
            .map(|i| self.pins.iter().map(|(_, states)| states[i]).collect())
            .collect()
    }
}

/// DTR/RTS control of a serial adapter.
pub trait ModemControl {
    fn set_dtr(&mut self, level: bool) -> Result<()>;
    fn set_rts(&mut self, level: bool) -> Result<()>;
}

impl ModemControl for SerialStream {
    fn set_dtr(&mut self, level: bool) -> Result<()> {
        Ok(serialport::SerialPort::write_data_terminal_ready(self, level)?)
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        Ok(serialport::SerialPort::write_request_to_send(self, level)?)
    }
}

/// Pulses DTR/RTS the way auto-reset USB adapters expect to enter the bootloader.
pub async fn send_serial_pulse<P: ModemControl>(port: &mut P) -> Result<()> {
    debug!("pulsing DTR/RTS");

    port.set_dtr(false)?;
    port.set_rts(true)?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    port.set_dtr(true)?;
    port.set_rts(false)?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    port.set_dtr(false)?;

    Ok(())
}
