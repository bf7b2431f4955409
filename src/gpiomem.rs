use anyhow::{Context, Result};
use log::debug;
use std::{
    fs::OpenOptions,
    io,
    os::unix::{fs::OpenOptionsExt, io::AsRawFd},
    path::Path,
    ptr, thread,
    time::Duration,
};

use crate::gpio::Pull;

// Size of the register window exposed by /dev/gpiomem.
const GPIO_MEM_SIZE: usize = 4096;

// Register offsets, in 32-bit words.
const GPPUD: usize = 0x94 / 4;
const GPPUDCLK0: usize = 0x98 / 4;
const GPPUPPDN0: usize = 0xe4 / 4;
const GPPUPPDN3: usize = 0xf0 / 4;

// Pre-BCM2711 SoCs return "gpio" in ASCII from the unused GPPUPPDN3 slot.
const LEGACY_MAGIC: u32 = 0x6770_696f;

const MAX_PIN: u32 = 53;

/// The GPIO register block, mapped from `/dev/gpiomem`.
///
/// Only pull-up/down control goes through the registers; everything else uses sysfs.
#[derive(Debug)]
pub(crate) struct GpioMem {
    base: *mut u32,
    bcm2711: bool,
}

// The mapping is process-wide and every access is a single volatile word read or write.
unsafe impl Send for GpioMem {}

impl GpioMem {
    pub(crate) fn open(path: &Path) -> Result<GpioMem> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        // the mapping stays valid after the file is closed
        let mapped = unsafe {
            libc::mmap(
                ptr::null_mut(),
                GPIO_MEM_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("Failed to map {}", path.display()));
        }

        let mut mem = GpioMem {
            base: mapped as *mut u32,
            bcm2711: false,
        };
        mem.bcm2711 = mem.read(GPPUPPDN3) != LEGACY_MAGIC;
        debug!(
            "Mapped {} ({} pull registers)",
            path.display(),
            if mem.bcm2711 { "BCM2711" } else { "BCM283x" }
        );
        Ok(mem)
    }

    fn read(&self, offset: usize) -> u32 {
        unsafe { ptr::read_volatile(self.base.add(offset)) }
    }

    fn write(&self, offset: usize, value: u32) {
        unsafe { ptr::write_volatile(self.base.add(offset), value) }
    }

    pub(crate) fn set_pull(&self, pin: u32, pull: Pull) -> Result<()> {
        if pin > MAX_PIN {
            anyhow::bail!("The pin sent is invalid: {}", pin);
        }

        if self.bcm2711 {
            let bits = match pull {
                Pull::OFF => 0,
                Pull::UP => 1,
                Pull::DOWN => 2,
            };
            let reg = GPPUPPDN0 + (pin >> 4) as usize;
            let shift = (pin & 0xf) * 2;

            let value = (self.read(reg) & !(0b11 << shift)) | (bits << shift);
            self.write(reg, value);
        } else {
            let bits = match pull {
                Pull::OFF => 0,
                Pull::DOWN => 1,
                Pull::UP => 2,
            };
            let clk = GPPUDCLK0 + (pin >> 5) as usize;

            // the control signal needs 150 cycles of setup and hold around the clock
            self.write(GPPUD, bits);
            thread::sleep(Duration::from_micros(20));
            self.write(clk, 1 << (pin & 0x1f));
            thread::sleep(Duration::from_micros(20));
            self.write(GPPUD, 0);
            self.write(clk, 0);
        }

        Ok(())
    }
}

impl Drop for GpioMem {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, GPIO_MEM_SIZE);
        }
    }
}
