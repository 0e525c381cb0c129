use anyhow::{anyhow, Result};

use super::GpioPattern;

pub async fn send_gpio_pattern(pattern: &GpioPattern) -> Result<()> {
    Err(anyhow!("GPIO reset via {} is only supported on Linux", pattern.chip))
}
