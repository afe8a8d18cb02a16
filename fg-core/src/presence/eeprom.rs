//! EEPROM driver binding
//!
//! Some fan assemblies carry a VPD EEPROM that only enumerates once the fan
//! is plugged. On an absent→present transition the configured I2C driver is
//! bound to the device address, after a delay that gives the hardware time
//! to settle; present→absent unbinds immediately.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info};

use crate::config::EepromConfig;
use crate::constants::paths;
use crate::timer::OneShotTimer;

#[derive(Debug)]
pub struct EepromDevice {
    /// Bus-address string as sysfs names it, e.g. `32-0050`
    address: String,
    /// Driver directory, e.g. `/sys/bus/i2c/drivers/at24`
    driver_dir: PathBuf,
    bind_delay: Duration,
    timer: OneShotTimer,
}

impl EepromDevice {
    pub fn new(config: &EepromConfig) -> Self {
        Self {
            address: config.bus_address.clone(),
            driver_dir: PathBuf::from(paths::I2C_DRIVERS).join(&config.driver),
            bind_delay: Duration::from_millis(config.bind_delay_ms),
            timer: OneShotTimer::new(),
        }
    }

    /// Schedule the bind after the settle delay.
    pub fn bind(&mut self) {
        let address = self.address.clone();
        let driver_dir = self.driver_dir.clone();
        self.timer.restart_once(self.bind_delay, move || async move {
            bind_device(&driver_dir, &address);
        });
    }

    /// Cancel a pending bind and unbind the device.
    pub fn unbind(&mut self) {
        self.timer.disarm();
        unbind_device(&self.driver_dir, &self.address);
    }
}

fn bind_device(driver_dir: &std::path::Path, address: &str) {
    // A stale binding from a previous plug cycle must go first.
    unbind_device(driver_dir, address);

    let bind_path = driver_dir.join("bind");
    match std::fs::write(&bind_path, address) {
        Ok(()) => info!(address, "bound fan EEPROM device"),
        Err(e) => error!(
            path = %bind_path.display(),
            address,
            error = %e,
            "failed to bind fan EEPROM device"
        ),
    }
}

fn unbind_device(driver_dir: &std::path::Path, address: &str) {
    // Nothing bound, nothing to do.
    if !driver_dir.join(address).exists() {
        return;
    }

    let unbind_path = driver_dir.join("unbind");
    if let Err(e) = std::fs::write(&unbind_path, address) {
        error!(
            path = %unbind_path.display(),
            address,
            error = %e,
            "failed to unbind fan EEPROM device"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_writes_after_delay() {
        let dir = tempfile::tempdir().unwrap();
        let driver_dir = dir.path().join("at24");
        std::fs::create_dir(&driver_dir).unwrap();
        std::fs::write(driver_dir.join("bind"), "").unwrap();
        std::fs::write(driver_dir.join("unbind"), "").unwrap();

        let mut device = EepromDevice {
            address: "32-0050".into(),
            driver_dir: driver_dir.clone(),
            bind_delay: Duration::from_millis(10),
            timer: OneShotTimer::new(),
        };

        device.bind();
        assert_eq!(std::fs::read_to_string(driver_dir.join("bind")).unwrap(), "");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(
            std::fs::read_to_string(driver_dir.join("bind")).unwrap(),
            "32-0050"
        );
    }

    #[tokio::test]
    async fn test_unbind_cancels_pending_bind() {
        let dir = tempfile::tempdir().unwrap();
        let driver_dir = dir.path().join("at24");
        std::fs::create_dir(&driver_dir).unwrap();
        std::fs::write(driver_dir.join("bind"), "").unwrap();
        std::fs::write(driver_dir.join("unbind"), "").unwrap();

        let mut device = EepromDevice {
            address: "32-0050".into(),
            driver_dir: driver_dir.clone(),
            bind_delay: Duration::from_millis(20),
            timer: OneShotTimer::new(),
        };

        device.bind();
        device.unbind();
        tokio::time::sleep(Duration::from_millis(60)).await;
        // The pending bind was cancelled, so the bind file stays empty.
        assert_eq!(std::fs::read_to_string(driver_dir.join("bind")).unwrap(), "");
    }
}
