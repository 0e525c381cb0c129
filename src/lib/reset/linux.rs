use std::{
    fs::File,
    os::unix::io::{AsRawFd, FromRawFd},
};

use anyhow::{Context, Result};
use log::debug;

use super::GpioPattern;

/// Drives `pattern` through the GPIO character device, then releases the lines.
pub async fn send_gpio_pattern(pattern: &GpioPattern) -> Result<()> {
    let steps = pattern.steps();
    let first = match steps.first() {
        Some(first) => first,
        None => return Ok(()),
    };

    let chip = File::open(pattern.chip).with_context(|| format!("Failed to open {}", pattern.chip))?;

    let mut request = ioctl::gpiohandle_request::default();
    for (i, ((offset, _), level)) in pattern.pins.iter().zip(first).enumerate() {
        request.lineoffsets[i] = *offset;
        request.default_values[i] = *level as u8;
    }
    request.lines = pattern.pins.len() as u32;
    request.flags = ioctl::GPIOHANDLE_REQUEST_OUTPUT;
    request.consumer_label[..ioctl::CONSUMER.len()].copy_from_slice(ioctl::CONSUMER);

    unsafe { ioctl::gpio_get_linehandle(chip.as_raw_fd(), &mut request) }
        .with_context(|| format!("Failed to request lines on {}", pattern.chip))?;

    // Dropping the handle releases the lines.
    let lines = unsafe { File::from_raw_fd(request.fd) };
    debug!("gpio {} step 0: {:?}", pattern.chip, first);

    for (n, step) in steps.iter().enumerate().skip(1) {
        tokio::time::sleep(pattern.toggle_delay).await;

        let mut data = ioctl::gpiohandle_data::default();
        for (i, level) in step.iter().enumerate() {
            data.values[i] = *level as u8;
        }

        debug!("gpio {} step {}: {:?}", pattern.chip, n, step);
        unsafe { ioctl::gpiohandle_set_line_values(lines.as_raw_fd(), &mut data) }
            .context("Failed to set GPIO line values")?;
    }

    Ok(())
}

#[allow(non_camel_case_types)]
mod ioctl {
    use nix::{ioctl_readwrite, libc::c_int};

    pub const GPIOHANDLES_MAX: usize = 64;
    pub const GPIOHANDLE_REQUEST_OUTPUT: u32 = 1 << 1;
    pub const CONSUMER: &[u8] = b"silabs-flasher";

    #[repr(C)]
    pub struct gpiohandle_request {
        pub lineoffsets: [u32; GPIOHANDLES_MAX],
        pub flags: u32,
        pub default_values: [u8; GPIOHANDLES_MAX],
        pub consumer_label: [u8; 32],
        pub lines: u32,
        pub fd: c_int,
    }

    impl Default for gpiohandle_request {
        fn default() -> Self {
            Self {
                lineoffsets: [0; GPIOHANDLES_MAX],
                flags: 0,
                default_values: [0; GPIOHANDLES_MAX],
                consumer_label: [0; 32],
                lines: 0,
                fd: -1,
            }
        }
    }

    #[repr(C)]
    pub struct gpiohandle_data {
        pub values: [u8; GPIOHANDLES_MAX],
    }

    impl Default for gpiohandle_data {
        fn default() -> Self {
            Self {
                values: [0; GPIOHANDLES_MAX],
            }
        }
    }

    ioctl_readwrite!(gpio_get_linehandle, 0xB4, 0x03, gpiohandle_request);
    ioctl_readwrite!(gpiohandle_set_line_values, 0xB4, 0x09, gpiohandle_data);
}
