use crate::common::{ActuatorError, StartupFailure};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;

/// A single binary output line.
pub trait OutputPin: Send {
    fn set_high(&mut self) -> Result<(), ActuatorError>;
    fn set_low(&mut self) -> Result<(), ActuatorError>;
}

/// Output pin driven through the Linux sysfs GPIO interface.
pub struct SysfsPin {
    pin: u32,
    value: File,
}

impl SysfsPin {
    /// Exports `pin` under `root` if needed, configures it as an output and drives it low.
    pub fn open(root: &Path, pin: u32) -> Result<Self, StartupFailure> {
        let pin_dir = root.join(format!("gpio{}", pin));

        if !pin_dir.exists() {
            fs::write(root.join("export"), pin.to_string()).map_err(|e| {
                StartupFailure::Gpio(format!("failed to export pin {}: {}", pin, e))
            })?;
            // udev needs a moment to apply permissions to the new nodes
            wait_for(&pin_dir.join("direction"));
        }

        fs::write(pin_dir.join("direction"), "out").map_err(|e| {
            StartupFailure::Gpio(format!("failed to set pin {} as output: {}", pin, e))
        })?;

        let value = OpenOptions::new()
            .write(true)
            .open(pin_dir.join("value"))
            .map_err(|e| StartupFailure::Gpio(format!("failed to open pin {} value: {}", pin, e)))?;

        let mut sysfs = Self { pin, value };
        sysfs
            .set_low()
            .map_err(|e| StartupFailure::Gpio(e.to_string()))?;

        tracing::info!("GPIO pin {} ready ({})", pin, pin_dir.display());
        Ok(sysfs)
    }

    fn write_level(&mut self, level: &[u8]) -> Result<(), ActuatorError> {
        let pin = self.pin;
        self.value
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.value.write_all(level))
            .and_then(|_| self.value.flush())
            .map_err(|source| ActuatorError::Gpio { pin, source })
    }
}

impl OutputPin for SysfsPin {
    fn set_high(&mut self) -> Result<(), ActuatorError> {
        self.write_level(b"1")
    }

    fn set_low(&mut self) -> Result<(), ActuatorError> {
        self.write_level(b"0")
    }
}

fn wait_for(path: &Path) {
    for _ in 0..20 {
        if path.exists() {
            return;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}
