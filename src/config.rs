use std::fs;
use std::path::Path;

use simple_error::SimpleError;

use crate::error::Error;
use crate::memory::PAGE_SIZE;

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub emulator: EmulatorConfig,
    pub machine: MachineConfig,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// logs every decoded instruction at trace level
    pub trace: bool,

    /// logs instructions without handler at warn level
    pub report_unimplemented: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        EmulatorConfig {
            trace: false,
            report_unimplemented: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MachineConfig {
    /// bytes of guest ram, mapped from guest physical 0
    pub ram_size: u64,

    pub mmio: Vec<MmioConfig>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            ram_size: 0x20_0000,
            mmio: Vec::new(),
        }
    }
}

/// a device backed window of guest physical memory
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MmioConfig {
    pub base: u64,
    pub size: u64,
}

impl MmioConfig {
    fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, Error> {
        let cfg: Config = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let data = fs::read_to_string(path)?;
        Config::from_toml(&data)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.machine.validate()
    }
}

fn is_page_aligned(v: u64) -> bool {
    v % PAGE_SIZE == 0
}

impl MachineConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.ram_size == 0 || !is_page_aligned(self.ram_size) {
            return Err(SimpleError::new(format!("ram_size {:#X} must be a non-zero multiple of {:#X}", self.ram_size, PAGE_SIZE)).into());
        }
        for (i, window) in self.mmio.iter().enumerate() {
            if window.size == 0 || !is_page_aligned(window.base) || !is_page_aligned(window.size) {
                return Err(SimpleError::new(format!("mmio window {:#X}+{:#X} is not page aligned", window.base, window.size)).into());
            }
            if window.base < self.ram_size {
                return Err(SimpleError::new(format!("mmio window {:#X} overlaps ram", window.base)).into());
            }
            for other in &self.mmio[..i] {
                if window.base < other.end() && other.base < window.end() {
                    return Err(SimpleError::new(format!("mmio windows {:#X} and {:#X} overlap", window.base, other.base)).into());
                }
            }
        }
        Ok(())
    }
}
