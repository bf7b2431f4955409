use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
};

/// Environment variable naming a TOML configuration file.
pub static CONFIG_ENV: &str = "RPI_GPIO_CONFIG";

/// Runtime configuration of the sysfs backend and the dispatcher.
///
/// Every field has a default matching a stock Raspberry Pi OS install, so an
/// empty (or absent) configuration file is valid.
///
/// # Example
///
/// ```rust
/// use rpi_gpio_cmd::Config;
///
/// let config = Config::from_toml("pwm_chip = 2\nstrict_errors = true").unwrap();
/// assert_eq!(config.pwm_chip, 2);
/// assert!(config.strict_errors);
/// assert_eq!(config.sysfs_root.to_str(), Some("/sys/class/gpio"));
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root of the legacy GPIO sysfs interface.
    pub sysfs_root: PathBuf,
    /// Root of the PWM sysfs interface.
    pub pwm_root: PathBuf,
    /// Mount point of procfs, used for `cpuinfo`.
    pub proc_root: PathBuf,
    /// Register window used for pull-up/down control.
    pub gpiomem_path: PathBuf,
    /// Index of the `pwmchipN` that drives the hardware PWM channels.
    pub pwm_chip: u32,
    /// PWM period written when a channel is first exported.
    pub pwm_period_ns: u64,
    /// How long to wait for udev to create exported pin/channel directories.
    pub export_timeout_ms: u64,
    /// Surface read/write/direction/pull failures as errors instead of logging them.
    pub strict_errors: bool,
    /// Unexport lines and disable PWM channels on shutdown. When off, pin
    /// state outlives the process, as a one-shot CLI call needs.
    pub release_pins: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sysfs_root: PathBuf::from("/sys/class/gpio"),
            pwm_root: PathBuf::from("/sys/class/pwm"),
            proc_root: PathBuf::from("/proc"),
            gpiomem_path: PathBuf::from("/dev/gpiomem"),
            pwm_chip: 0,
            pwm_period_ns: 1_000_000,
            export_timeout_ms: 1_000,
            strict_errors: false,
            release_pins: true,
        }
    }
}

impl Config {
    /// Parses a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Config> {
        let config: Config = toml::from_str(text).context("Invalid configuration")?;
        if config.pwm_period_ns == 0 {
            anyhow::bail!("pwm_period_ns must be greater than zero");
        }
        Ok(config)
    }

    /// Loads the configuration.
    ///
    /// An explicit `path` wins, then the file named by `RPI_GPIO_CONFIG`,
    /// otherwise the defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => env::var_os(CONFIG_ENV).map(PathBuf::from),
        };

        match path {
            Some(path) => {
                debug!("Loading configuration from {}", path.display());
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                Config::from_toml(&text)
                    .with_context(|| format!("In config file {}", path.display()))
            }
            None => Ok(Config::default()),
        }
    }
}
