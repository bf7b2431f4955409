use anyhow::{Context, Error, Result};
use log::{debug, error, info, warn};
use std::{
    collections::HashMap,
    fs,
    io::{self, Read, Seek, Write},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::board_data::{find_gpio_chip, hardware_revision, BoardInfo, ChipInfo};
use crate::config::Config;
use crate::gpiomem::GpioMem;

/// PWM range every pin starts out with, before anyone calls `set_pwm_range`.
pub const DEFAULT_PWM_RANGE: u32 = 255;

/// Largest PWM range a backend has to accept.
pub const MAX_PWM_RANGE: u32 = 40_000;

// Upper bound on how long an edge watcher sleeps before checking for cancellation.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Specifies the GPIO pin level.
///
/// * `LOW` - 0
/// * `HIGH` - 1
///
/// # Example
///
/// ```rust
/// use rpi_gpio_cmd::Level;
///
/// assert_eq!(Level::try_from(1_i32).unwrap(), Level::HIGH);
/// assert!(Level::try_from(2_i32).is_err());
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Level {
    LOW = 0,
    HIGH = 1,
}

impl TryFrom<i32> for Level {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Level::LOW),
            1 => Ok(Level::HIGH),
            _ => Err(Error::msg(format!("Invalid logic level {}: must be 0 or 1", value))),
        }
    }
}

impl Level {
    fn from_sysfs(value: &str) -> Level {
        match value.trim() {
            "0" => Level::LOW,
            _ => Level::HIGH,
        }
    }

    fn to_sysfs(self) -> &'static str {
        match self {
            Level::HIGH => "1",
            Level::LOW => "0",
        }
    }
}

/// Specifies the GPIO pin direction.
///
/// * `IN` - Input
/// * `OUT` - Output
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Direction {
    IN = 0,
    OUT = 1,
}

impl Direction {
    fn to_sysfs(self) -> &'static str {
        match self {
            Direction::IN => "in",
            Direction::OUT => "out",
        }
    }
}

/// Specifies the pull resistor of an input pin.
///
/// * `DOWN` - Pull down
/// * `OFF` - No pull resistor
/// * `UP` - Pull up
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Pull {
    DOWN = -1,
    OFF = 0,
    UP = 1,
}

/// What an edge callback is told when it fires.
///
/// * `Edge(level)` - the pin changed, `level` is the level after the change
/// * `Timeout` - no change happened within the registered timeout
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EdgeEvent {
    Edge(Level),
    Timeout,
}

/// Notification handler for [`Backend::set_edge_callback`]. It is invoked at
/// most once per registration, on a thread owned by the backend.
pub type EdgeCallback = Box<dyn FnMut(EdgeEvent) + Send + 'static>;

/// A pin-addressable GPIO backend.
///
/// Pins are addressed by their BCM number. Implementations must reject every
/// pin operation until `initialize` has succeeded.
pub trait Backend: Send {
    /// Brings the GPIO subsystem up.
    fn initialize(&mut self) -> Result<()>;

    /// Releases everything acquired since `initialize`. Never fails; problems are logged.
    fn terminate(&mut self);

    /// Returns the board revision code, or 0 if unknown.
    fn hardware_revision(&self) -> Result<u32>;

    fn read(&mut self, pin: u32) -> Result<Level>;

    fn write(&mut self, pin: u32, level: Level) -> Result<()>;

    fn pwm_range(&mut self, pin: u32) -> Result<u32>;

    fn set_pwm_range(&mut self, pin: u32, range: u32) -> Result<()>;

    fn pwm_duty(&mut self, pin: u32) -> Result<u32>;

    /// Sets the duty cycle, `0..=pwm_range(pin)`.
    fn set_pwm_duty(&mut self, pin: u32, duty: u32) -> Result<()>;

    fn set_direction(&mut self, pin: u32, direction: Direction) -> Result<()>;

    fn set_pull(&mut self, pin: u32, pull: Pull) -> Result<()>;

    /// Registers `callback` for rising and falling edges on `pin`, replacing
    /// any earlier registration. With `Some(timeout)` the callback receives
    /// `EdgeEvent::Timeout` if no edge arrives in time; `None` waits forever.
    fn set_edge_callback(&mut self, pin: u32, timeout: Option<Duration>, callback: EdgeCallback) -> Result<()>;

    /// Drops the registration for `pin`, if any.
    fn clear_edge_callback(&mut self, pin: u32) -> Result<()>;
}

/// Information about a single exported GPIO line.
///
/// * `pin`: BCM pin number
/// * `global_gpio`: Linux exported GPIO number (global)
/// * `global_gpio_name`: Linux exported GPIO name
#[derive(Debug, Clone)]
struct ChannelInfo {
    pin: u32,
    global_gpio: u32,
    global_gpio_name: String,
}

fn check_write_access(sysfs_root: &Path) -> Result<()> {
    let export_path = sysfs_root.join("export");
    let unexport_path = sysfs_root.join("unexport");

    let export_metadata = fs::metadata(&export_path)
        .with_context(|| format!("GPIO sysfs interface not found at {}", sysfs_root.display()))?;
    let unexport_metadata = fs::metadata(&unexport_path)
        .with_context(|| format!("GPIO sysfs interface not found at {}", sysfs_root.display()))?;

    if !export_metadata.permissions().readonly() && !unexport_metadata.permissions().readonly() {
        Ok(())
    } else {
        Err(Error::msg("You do not have write access to the GPIO sysfs interface."))
    }
}

fn write_sysfs(path: &Path, value: &str) -> Result<()> {
    let mut f = fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    f.rewind()?;
    f.write_all(value.as_bytes())
        .with_context(|| format!("Failed to write '{}' to {}", value, path.display()))?;
    Ok(())
}

fn read_sysfs(path: &Path) -> Result<String> {
    let mut f = fs::OpenOptions::new()
        .read(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut value = String::new();
    f.rewind()?;
    f.read_to_string(&mut value)?;
    Ok(value.trim().to_string())
}

// Waits for udev to create `path` after an export.
fn wait_for_path(path: &Path, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    while !path.exists() {
        if start.elapsed() >= timeout {
            anyhow::bail!("Timed out waiting for {} to appear", path.display());
        }
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

fn gpio_dir(sysfs_root: &Path, ch_info: &ChannelInfo) -> PathBuf {
    sysfs_root.join(&ch_info.global_gpio_name)
}

/// Exports the line if needed. Returns `true` if this call exported it.
fn export_gpio(sysfs_root: &Path, ch_info: &ChannelInfo, timeout: Duration) -> Result<bool> {
    let gpio_dir = gpio_dir(sysfs_root, ch_info);
    let mut exported = false;
    if !gpio_dir.exists() {
        write_sysfs(&sysfs_root.join("export"), &ch_info.global_gpio.to_string())?;
        exported = true;
    }

    wait_for_path(&gpio_dir.join("value"), timeout)?;
    Ok(exported)
}

fn unexport_gpio(sysfs_root: &Path, ch_info: &ChannelInfo) -> Result<()> {
    if gpio_dir(sysfs_root, ch_info).exists() {
        write_sysfs(&sysfs_root.join("unexport"), &ch_info.global_gpio.to_string())?;
    }
    Ok(())
}

/// Hardware PWM channel wired to a BCM pin, when routed through the
/// `pwm` / `pwm-2chan` overlays.
fn pwm_channel_for_pin(pin: u32) -> Option<u32> {
    match pin {
        12 | 18 => Some(0),
        13 | 19 => Some(1),
        _ => None,
    }
}

#[derive(Debug)]
struct PwmState {
    channel: u32,
    range: u32,
    duty: u32,
    exported: bool,
}

struct EdgeWatcher {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

// Blocks up to `timeout` for an edge on a sysfs value file. `Ok(true)` means
// the kernel flagged a change.
fn poll_priority(file: &fs::File, timeout: Duration) -> io::Result<bool> {
    let mut fds = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLPRI | libc::POLLERR,
        revents: 0,
    };
    // round up so a sub-millisecond remainder doesn't turn into a busy loop
    let millis = timeout.as_micros().div_ceil(1000) as libc::c_int;
    let rc = unsafe { libc::poll(&mut fds, 1, millis) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc > 0 && fds.revents & (libc::POLLPRI | libc::POLLERR) != 0)
}

fn watch_edges<W>(
    mut value_file: fs::File,
    timeout: Option<Duration>,
    stop: Arc<AtomicBool>,
    mut callback: EdgeCallback,
    mut wait: W,
) where
    W: FnMut(&fs::File, Duration) -> io::Result<bool>,
{
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }

        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    callback(EdgeEvent::Timeout);
                    return;
                }
                (deadline - now).min(POLL_SLICE)
            }
            None => POLL_SLICE,
        };

        match wait(&value_file, slice) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // dropping the callback unblocks the waiter with a lost notification
                error!("poll() on GPIO value file failed: {}", e);
                return;
            }
        }

        let mut value = String::new();
        let level = match value_file.rewind().and_then(|_| value_file.read_to_string(&mut value)) {
            Ok(_) => Level::from_sysfs(&value),
            Err(e) => {
                error!("Failed to read GPIO value after edge: {}", e);
                return;
            }
        };
        callback(EdgeEvent::Edge(level));
        return;
    }
}

fn spawn_watcher(
    pin: u32,
    value_path: &Path,
    timeout: Option<Duration>,
    callback: EdgeCallback,
) -> Result<EdgeWatcher> {
    let mut value_file = fs::File::open(value_path)
        .with_context(|| format!("Failed to open {}", value_path.display()))?;
    // consume the current value so only a new change raises POLLPRI
    let mut discard = String::new();
    value_file
        .read_to_string(&mut discard)
        .with_context(|| format!("Failed to read {}", value_path.display()))?;

    let stop = Arc::new(AtomicBool::new(false));
    let watcher_stop = Arc::clone(&stop);
    let handle = thread::Builder::new()
        .name(format!("gpio-edge-{}", pin))
        .spawn(move || watch_edges(value_file, timeout, watcher_stop, callback, poll_priority))
        .context("Failed to spawn edge watcher thread")?;

    Ok(EdgeWatcher { stop, handle })
}

/// A [`Backend`] driving the Linux GPIO and PWM sysfs interfaces.
///
/// Pull resistors are not exposed through sysfs; they are set through the
/// register window at `Config::gpiomem_path` when the board has one.
///
/// # Example
///
/// ```rust,no_run
/// use rpi_gpio_cmd::{Backend, Config, Direction, Level, SysfsBackend};
///
/// let mut gpio = SysfsBackend::new(Config::default());
/// gpio.initialize().unwrap();
/// gpio.set_direction(17, Direction::OUT).unwrap();
/// gpio.write(17, Level::HIGH).unwrap();
/// gpio.terminate();
/// ```
pub struct SysfsBackend {
    config: Config,
    chip: Option<ChipInfo>,
    gpiomem: Option<GpioMem>,
    // # Lines and PWM channels this process exported, released on terminate
    exported: HashMap<u32, ChannelInfo>,
    pwm: HashMap<u32, PwmState>,
    watchers: HashMap<u32, EdgeWatcher>,
}

impl SysfsBackend {
    pub fn new(config: Config) -> Self {
        SysfsBackend {
            config,
            chip: None,
            gpiomem: None,
            exported: HashMap::new(),
            pwm: HashMap::new(),
            watchers: HashMap::new(),
        }
    }

    fn export_timeout(&self) -> Duration {
        Duration::from_millis(self.config.export_timeout_ms)
    }

    fn channel_to_info(&self, pin: u32) -> Result<ChannelInfo> {
        let chip = match &self.chip {
            Some(chip) => chip,
            None => anyhow::bail!("GPIO subsystem is not initialized"),
        };

        let global_gpio = chip.global_gpio(pin)?;
        Ok(ChannelInfo {
            pin,
            global_gpio,
            global_gpio_name: format!("gpio{}", global_gpio),
        })
    }

    fn exported_channel(&mut self, pin: u32) -> Result<ChannelInfo> {
        let ch_info = self.channel_to_info(pin)?;
        if export_gpio(&self.config.sysfs_root, &ch_info, self.export_timeout())? {
            debug!("Exported {} for pin {}", ch_info.global_gpio_name, pin);
            self.exported.insert(ch_info.pin, ch_info.clone());
        }
        Ok(ch_info)
    }

    fn pwm_chip_dir(&self) -> PathBuf {
        self.config.pwm_root.join(format!("pwmchip{}", self.config.pwm_chip))
    }

    fn pwm_channel_dir(&self, channel: u32) -> PathBuf {
        self.pwm_chip_dir().join(format!("pwm{}", channel))
    }

    fn pwm_state(&mut self, pin: u32) -> Result<&mut PwmState> {
        // validates the pin against the controller as well
        self.channel_to_info(pin)?;
        let channel = match pwm_channel_for_pin(pin) {
            Some(channel) => channel,
            None => anyhow::bail!("Pin {} has no hardware PWM channel", pin),
        };

        Ok(self.pwm.entry(pin).or_insert(PwmState {
            channel,
            range: DEFAULT_PWM_RANGE,
            duty: 0,
            exported: false,
        }))
    }

    fn export_pwm(&mut self, pin: u32) -> Result<u32> {
        let state = self.pwm_state(pin)?;
        let (channel, already) = (state.channel, state.exported);
        if already {
            return Ok(channel);
        }

        let channel_dir = self.pwm_channel_dir(channel);
        if !channel_dir.exists() {
            write_sysfs(&self.pwm_chip_dir().join("export"), &channel.to_string())?;
        }
        wait_for_path(&channel_dir.join("duty_cycle"), self.export_timeout())?;

        // duty must never exceed the period, so clear it before changing the period
        write_sysfs(&channel_dir.join("duty_cycle"), "0")?;
        write_sysfs(&channel_dir.join("period"), &self.config.pwm_period_ns.to_string())?;

        if let Some(state) = self.pwm.get_mut(&pin) {
            state.exported = true;
        }
        info!("Exported PWM channel {} for pin {}", channel, pin);
        Ok(channel)
    }

    fn release_pwm(&self, state: &PwmState) -> Result<()> {
        let channel_dir = self.pwm_channel_dir(state.channel);
        if channel_dir.exists() {
            write_sysfs(&channel_dir.join("enable"), "0")?;
            write_sysfs(&self.pwm_chip_dir().join("unexport"), &state.channel.to_string())?;
        }
        Ok(())
    }

    fn stop_watcher(&mut self, pin: u32) -> Result<()> {
        if let Some(watcher) = self.watchers.remove(&pin) {
            watcher.stop.store(true, Ordering::Release);
            if watcher.handle.join().is_err() {
                warn!("Edge watcher for pin {} panicked", pin);
            }
            let ch_info = self.channel_to_info(pin)?;
            write_sysfs(&gpio_dir(&self.config.sysfs_root, &ch_info).join("edge"), "none")?;
        }
        Ok(())
    }
}

impl Backend for SysfsBackend {
    fn initialize(&mut self) -> Result<()> {
        check_write_access(&self.config.sysfs_root)?;

        let chip = find_gpio_chip(&self.config.sysfs_root)?;
        info!(
            "Using GPIO controller {} (base {}, {} lines)",
            chip.label, chip.base, chip.ngpio
        );
        self.chip = Some(chip);

        let board = BoardInfo::from_revision(hardware_revision(&self.config.proc_root));
        if board.has_legacy_gpio_registers() {
            match GpioMem::open(&self.config.gpiomem_path) {
                Ok(mem) => self.gpiomem = Some(mem),
                Err(e) => warn!("Pull resistor control unavailable: {:#}", e),
            }
        } else {
            warn!("Pull resistor control is not supported on {}", board.processor);
        }

        Ok(())
    }

    fn terminate(&mut self) {
        let pins: Vec<u32> = self.watchers.keys().copied().collect();
        for pin in pins {
            if let Err(e) = self.stop_watcher(pin) {
                warn!("Failed to stop edge watcher for pin {}: {:#}", pin, e);
            }
        }

        let pwm = std::mem::take(&mut self.pwm);
        let exported = std::mem::take(&mut self.exported);

        if self.config.release_pins {
            for (pin, state) in pwm {
                if state.exported {
                    if let Err(e) = self.release_pwm(&state) {
                        warn!("Failed to release PWM channel for pin {}: {:#}", pin, e);
                    }
                }
            }

            for (pin, ch_info) in exported {
                if let Err(e) = unexport_gpio(&self.config.sysfs_root, &ch_info) {
                    warn!("Failed to unexport pin {}: {:#}", pin, e);
                }
            }
        } else {
            debug!(
                "Leaving {} line(s) and {} PWM channel(s) configured",
                exported.len(),
                pwm.values().filter(|s| s.exported).count()
            );
        }

        self.gpiomem = None;
        self.chip = None;
    }

    fn hardware_revision(&self) -> Result<u32> {
        Ok(hardware_revision(&self.config.proc_root))
    }

    fn read(&mut self, pin: u32) -> Result<Level> {
        let ch_info = self.exported_channel(pin)?;
        let value = read_sysfs(&gpio_dir(&self.config.sysfs_root, &ch_info).join("value"))?;
        Ok(Level::from_sysfs(&value))
    }

    fn write(&mut self, pin: u32, level: Level) -> Result<()> {
        let ch_info = self.exported_channel(pin)?;
        write_sysfs(&gpio_dir(&self.config.sysfs_root, &ch_info).join("value"), level.to_sysfs())
    }

    fn pwm_range(&mut self, pin: u32) -> Result<u32> {
        Ok(self.pwm_state(pin)?.range)
    }

    fn set_pwm_range(&mut self, pin: u32, range: u32) -> Result<()> {
        if range == 0 || range > MAX_PWM_RANGE {
            anyhow::bail!("Invalid PWM range {}: must be 1 - {}", range, MAX_PWM_RANGE);
        }

        let state = self.pwm_state(pin)?;
        // keep the output unchanged: rescale the duty to the new range
        state.duty = (state.duty as u64 * range as u64 / state.range as u64) as u32;
        state.range = range;
        Ok(())
    }

    fn pwm_duty(&mut self, pin: u32) -> Result<u32> {
        Ok(self.pwm_state(pin)?.duty)
    }

    fn set_pwm_duty(&mut self, pin: u32, duty: u32) -> Result<()> {
        let range = self.pwm_state(pin)?.range;
        if duty > range {
            anyhow::bail!("Invalid PWM duty {} for pin {}: range is 0 - {}", duty, pin, range);
        }

        let channel = self.export_pwm(pin)?;
        let channel_dir = self.pwm_channel_dir(channel);
        let duty_ns = self.config.pwm_period_ns * duty as u64 / range as u64;

        write_sysfs(&channel_dir.join("duty_cycle"), &duty_ns.to_string())?;
        write_sysfs(&channel_dir.join("enable"), "1")?;
        debug!("Pin {} PWM duty {}/{} ({} ns)", pin, duty, range, duty_ns);

        if let Some(state) = self.pwm.get_mut(&pin) {
            state.duty = duty;
        }
        Ok(())
    }

    fn set_direction(&mut self, pin: u32, direction: Direction) -> Result<()> {
        let ch_info = self.exported_channel(pin)?;
        write_sysfs(
            &gpio_dir(&self.config.sysfs_root, &ch_info).join("direction"),
            direction.to_sysfs(),
        )
    }

    fn set_pull(&mut self, pin: u32, pull: Pull) -> Result<()> {
        self.channel_to_info(pin)?;
        match &self.gpiomem {
            Some(mem) => mem.set_pull(pin, pull),
            None => anyhow::bail!("Pull resistor control is not available on this board"),
        }
    }

    fn set_edge_callback(&mut self, pin: u32, timeout: Option<Duration>, callback: EdgeCallback) -> Result<()> {
        self.stop_watcher(pin)?;

        let ch_info = self.exported_channel(pin)?;
        let dir = gpio_dir(&self.config.sysfs_root, &ch_info);
        let edge_path = dir.join("edge");
        write_sysfs(&edge_path, "both")?;

        match spawn_watcher(pin, &dir.join("value"), timeout, callback) {
            Ok(watcher) => {
                self.watchers.insert(pin, watcher);
                Ok(())
            }
            Err(e) => {
                if let Err(restore) = write_sysfs(&edge_path, "none") {
                    warn!("Failed to disable edge detection on pin {}: {:#}", pin, restore);
                }
                Err(e)
            }
        }
    }

    fn clear_edge_callback(&mut self, pin: u32) -> Result<()> {
        self.stop_watcher(pin)
    }
}

impl Drop for SysfsBackend {
    fn drop(&mut self) {
        if self.chip.is_some() {
            self.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use std::sync::mpsc;
    use tempfile::{tempdir, TempDir};

    // A fake sysfs tree with gpiochip512 (58 lines), pins 17 and 18 already
    // exported and pwmchip0 channel 0 already present.
    fn fake_tree() -> (TempDir, Config) {
        let dir = tempdir().unwrap();
        let gpio = dir.path().join("gpio");
        let chip = gpio.join("gpiochip512");
        fs::create_dir_all(&chip).unwrap();
        fs::write(chip.join("base"), "512\n").unwrap();
        fs::write(chip.join("ngpio"), "58\n").unwrap();
        fs::write(chip.join("label"), "pinctrl-bcm2711\n").unwrap();
        fs::write(gpio.join("export"), "").unwrap();
        fs::write(gpio.join("unexport"), "").unwrap();

        for global in [529, 530] {
            let line = gpio.join(format!("gpio{}", global));
            fs::create_dir_all(&line).unwrap();
            fs::write(line.join("value"), "0\n").unwrap();
            fs::write(line.join("direction"), "in\n").unwrap();
            fs::write(line.join("edge"), "none\n").unwrap();
        }

        let pwm = dir.path().join("pwm/pwmchip0");
        let pwm0 = pwm.join("pwm0");
        fs::create_dir_all(&pwm0).unwrap();
        fs::write(pwm.join("export"), "").unwrap();
        fs::write(pwm.join("unexport"), "").unwrap();
        for f in ["period", "duty_cycle", "enable"] {
            fs::write(pwm0.join(f), "0\n").unwrap();
        }

        let proc_root = dir.path().join("proc");
        fs::create_dir_all(&proc_root).unwrap();
        fs::write(proc_root.join("cpuinfo"), "Revision\t: c03111\n").unwrap();

        let config = Config {
            sysfs_root: gpio,
            pwm_root: dir.path().join("pwm"),
            proc_root,
            gpiomem_path: dir.path().join("no-gpiomem"),
            export_timeout_ms: 50,
            ..Config::default()
        };
        (dir, config)
    }

    fn line_file(config: &Config, global: u32, name: &str) -> String {
        fs::read_to_string(config.sysfs_root.join(format!("gpio{}", global)).join(name))
            .unwrap()
            .trim()
            .to_string()
    }

    #[test]
    fn rejects_pins_before_initialize() {
        let (_dir, config) = fake_tree();
        let mut gpio = SysfsBackend::new(config);
        assert!(gpio.read(17).is_err());
    }

    #[test]
    fn missing_sysfs_fails_initialize() {
        let dir = tempdir().unwrap();
        let config = Config {
            sysfs_root: dir.path().join("nothing"),
            ..Config::default()
        };
        let mut gpio = SysfsBackend::new(config);
        assert!(gpio.initialize().is_err());
    }

    #[test]
    fn direction_write_and_read() {
        let (_dir, config) = fake_tree();
        let mut gpio = SysfsBackend::new(config.clone());
        gpio.initialize().unwrap();

        gpio.set_direction(17, Direction::OUT).unwrap();
        assert_eq!(line_file(&config, 529, "direction"), "out");

        gpio.write(17, Level::HIGH).unwrap();
        assert_eq!(line_file(&config, 529, "value"), "1");
        assert_eq!(gpio.read(17).unwrap(), Level::HIGH);

        gpio.write(17, Level::LOW).unwrap();
        assert_eq!(gpio.read(17).unwrap(), Level::LOW);
    }

    #[test]
    fn unexported_line_times_out() {
        let (_dir, config) = fake_tree();
        let mut gpio = SysfsBackend::new(config.clone());
        gpio.initialize().unwrap();

        // nothing creates gpio516 after the export write in a fake tree
        let err = gpio.read(4).unwrap_err();
        assert!(format!("{:#}", err).contains("Timed out"));
        assert_eq!(fs::read_to_string(config.sysfs_root.join("export")).unwrap(), "516");
    }

    #[test]
    fn pwm_duty_scales_to_period() {
        let (dir, config) = fake_tree();
        let mut gpio = SysfsBackend::new(config);
        gpio.initialize().unwrap();

        assert_eq!(gpio.pwm_range(18).unwrap(), DEFAULT_PWM_RANGE);
        gpio.set_pwm_range(18, 1024).unwrap();
        gpio.set_pwm_duty(18, 256).unwrap();

        let pwm0 = dir.path().join("pwm/pwmchip0/pwm0");
        let read = |f: &str| fs::read_to_string(pwm0.join(f)).unwrap().trim().to_string();
        assert_eq!(read("period"), "1000000");
        assert_eq!(read("duty_cycle"), "250000");
        assert_eq!(read("enable"), "1");
        assert_eq!(gpio.pwm_duty(18).unwrap(), 256);

        gpio.set_pwm_duty(18, 0).unwrap();
        assert_eq!(read("duty_cycle"), "0");
        assert_eq!(gpio.pwm_duty(18).unwrap(), 0);

        assert!(gpio.set_pwm_duty(18, 1025).is_err());
        assert!(gpio.pwm_range(17).is_err());
        assert!(gpio.set_pwm_range(18, 0).is_err());
    }

    #[test]
    fn pull_without_gpiomem_fails() {
        let (_dir, config) = fake_tree();
        let mut gpio = SysfsBackend::new(config);
        gpio.initialize().unwrap();
        assert!(gpio.set_pull(17, Pull::UP).is_err());
    }

    #[test]
    fn edge_wait_times_out_and_restores_edge() {
        let (_dir, config) = fake_tree();
        let mut gpio = SysfsBackend::new(config.clone());
        gpio.initialize().unwrap();

        let (tx, rx) = mpsc::channel();
        gpio.set_edge_callback(
            17,
            Some(Duration::from_millis(20)),
            Box::new(move |event: EdgeEvent| {
                let _ = tx.send(event);
            }),
        )
        .unwrap();
        assert_eq!(line_file(&config, 529, "edge"), "both");

        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event, EdgeEvent::Timeout);

        gpio.clear_edge_callback(17).unwrap();
        assert_eq!(line_file(&config, 529, "edge"), "none");
    }

    #[test]
    fn edge_watcher_reports_level_after_edge() {
        let dir = tempdir().unwrap();
        let value_path = dir.path().join("value");
        fs::write(&value_path, "1\n").unwrap();

        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        watch_edges(
            fs::File::open(&value_path).unwrap(),
            None,
            stop,
            Box::new(move |event: EdgeEvent| {
                let _ = tx.send(event);
            }),
            |_: &fs::File, _: Duration| Ok(true),
        );

        assert_eq!(rx.recv().unwrap(), EdgeEvent::Edge(Level::HIGH));
        assert!(rx.recv().is_err());
    }

    #[test]
    fn edge_watcher_drops_callback_on_poll_error() {
        let dir = tempdir().unwrap();
        let value_path = dir.path().join("value");
        fs::write(&value_path, "0\n").unwrap();

        let (tx, rx) = mpsc::channel::<EdgeEvent>();
        let mut interrupted = false;
        watch_edges(
            fs::File::open(&value_path).unwrap(),
            None,
            Arc::new(AtomicBool::new(false)),
            Box::new(move |event: EdgeEvent| {
                let _ = tx.send(event);
            }),
            move |_: &fs::File, _: Duration| {
                // an interrupted poll is retried, anything else ends the watch
                if !interrupted {
                    interrupted = true;
                    return Err(io::Error::from(io::ErrorKind::Interrupted));
                }
                Err(io::Error::from_raw_os_error(libc::EBADF))
            },
        );

        assert!(rx.recv().is_err());
    }

    #[test]
    fn failed_edge_setup_restores_edge() {
        let (_dir, config) = fake_tree();
        let value = config.sysfs_root.join("gpio529/value");
        fs::remove_file(&value).unwrap();
        fs::create_dir(&value).unwrap();

        let mut gpio = SysfsBackend::new(config.clone());
        gpio.initialize().unwrap();

        let result = gpio.set_edge_callback(17, None, Box::new(|_: EdgeEvent| {}));
        assert!(result.is_err());
        assert_eq!(line_file(&config, 529, "edge"), "none");
    }

    #[test]
    fn shutdown_keeps_pins_when_not_releasing() {
        let (dir, config) = fake_tree();
        let config = Config {
            release_pins: false,
            ..config
        };
        let mut dispatcher = Dispatcher::with_config(SysfsBackend::new(config.clone()), &config);
        dispatcher.call(&[2, 18, 512]).unwrap();
        dispatcher.shutdown();

        let pwm0 = dir.path().join("pwm/pwmchip0/pwm0");
        assert_eq!(fs::read_to_string(pwm0.join("enable")).unwrap().trim(), "1");
        assert_eq!(fs::read_to_string(pwm0.join("duty_cycle")).unwrap().trim(), "500000");
        assert_eq!(fs::read_to_string(config.pwm_root.join("pwmchip0/unexport")).unwrap(), "");
        assert!(!dispatcher.is_initialized());
    }

    #[test]
    fn terminate_unexports_what_it_exported() {
        let (_dir, config) = fake_tree();
        let mut gpio = SysfsBackend::new(config.clone());
        gpio.initialize().unwrap();
        gpio.set_pwm_duty(18, 10).unwrap();
        gpio.terminate();

        // pins 17/18 were pre-exported, only the PWM channel was ours
        assert_eq!(fs::read_to_string(config.sysfs_root.join("unexport")).unwrap(), "");
        assert_eq!(
            fs::read_to_string(config.pwm_root.join("pwmchip0/unexport")).unwrap(),
            "0"
        );
        assert!(gpio.read(17).is_err());
    }
}
