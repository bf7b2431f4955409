use anyhow::Result;
use log::{debug, warn};
use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
};

/// Environment variable overriding the detected board revision (hex, with or
/// without `0x`). Useful inside containers where `/proc/cpuinfo` is the host's
/// or is missing the `Revision` line.
pub static REVISION_ENV: &str = "RPI_BOARD_REVISION";

// Bits above the 24-bit revision code carry warranty/overvoltage flags.
const REVISION_MASK: u32 = 0x00FF_FFFF;
const NEW_STYLE_FLAG: u32 = 1 << 23;

static BOARD_TYPES: [(u32, &str); 24] = [
    (0x00, "A"),
    (0x01, "B"),
    (0x02, "A+"),
    (0x03, "B+"),
    (0x04, "2B"),
    (0x05, "Alpha"),
    (0x06, "CM1"),
    (0x08, "3B"),
    (0x09, "Zero"),
    (0x0a, "CM3"),
    (0x0c, "Zero W"),
    (0x0d, "3B+"),
    (0x0e, "3A+"),
    (0x10, "CM3+"),
    (0x11, "4B"),
    (0x12, "Zero 2 W"),
    (0x13, "400"),
    (0x14, "CM4"),
    (0x15, "CM4S"),
    (0x17, "5"),
    (0x18, "CM5"),
    (0x19, "500"),
    (0x1a, "CM5 Lite"),
    (0x16, "Internal"),
];

static PROCESSORS: [&str; 5] = ["BCM2835", "BCM2836", "BCM2837", "BCM2711", "BCM2712"];

static MANUFACTURERS: [&str; 6] = [
    "Sony UK",
    "Egoman",
    "Embest",
    "Sony Japan",
    "Embest",
    "Stadium",
];

// (revision, model, memory in MB) for boards predating the bit-23 scheme.
static OLD_STYLE_BOARDS: [(u32, &str, u32); 19] = [
    (0x02, "B", 256),
    (0x03, "B", 256),
    (0x04, "B", 256),
    (0x05, "B", 256),
    (0x06, "B", 256),
    (0x07, "A", 256),
    (0x08, "A", 256),
    (0x09, "A", 256),
    (0x0d, "B", 512),
    (0x0e, "B", 512),
    (0x0f, "B", 512),
    (0x10, "B+", 512),
    (0x11, "CM1", 512),
    (0x12, "A+", 256),
    (0x13, "B+", 512),
    (0x14, "CM1", 512),
    (0x15, "A+", 256),
    (0x00, "Unknown", 0),
    (0x01, "Unknown", 0),
];

/// Contains information about the Raspberry Pi board, decoded from its revision code.
///
/// The fields are:
/// * `revision`: Raw 24-bit revision code
/// * `model`: Board model, e.g. `"4B"`
/// * `processor`: SoC, e.g. `"BCM2711"`
/// * `manufacturer`: Board manufacturer
/// * `memory_mb`: RAM size in megabytes (0 if unknown)
/// * `pcb_revision`: PCB revision number
#[derive(Debug, Clone, PartialEq)]
pub struct BoardInfo {
    pub revision: u32,
    pub model: String,
    pub processor: String,
    pub manufacturer: String,
    pub memory_mb: u32,
    pub pcb_revision: u32,
}

impl BoardInfo {
    /// Decodes a revision code as reported by [`hardware_revision`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use rpi_gpio_cmd::BoardInfo;
    ///
    /// let info = BoardInfo::from_revision(0xc03111);
    /// assert_eq!(info.model, "4B");
    /// assert_eq!(info.processor, "BCM2711");
    /// assert_eq!(info.memory_mb, 4096);
    /// ```
    pub fn from_revision(revision: u32) -> BoardInfo {
        let revision = revision & REVISION_MASK;

        if revision & NEW_STYLE_FLAG == 0 {
            let (model, memory_mb) = OLD_STYLE_BOARDS
                .iter()
                .find(|(rev, _, _)| *rev == revision)
                .map(|(_, model, mem)| (*model, *mem))
                .unwrap_or(("Unknown", 0));

            return BoardInfo {
                revision,
                model: String::from(model),
                processor: String::from(if model == "Unknown" { "Unknown" } else { "BCM2835" }),
                manufacturer: String::from("Unknown"),
                memory_mb,
                pcb_revision: 0,
            };
        }

        let pcb_revision = revision & 0xf;
        let board_type = (revision >> 4) & 0xff;
        let processor = ((revision >> 12) & 0xf) as usize;
        let manufacturer = ((revision >> 16) & 0xf) as usize;
        let memory = (revision >> 20) & 0x7;

        let model = BOARD_TYPES
            .iter()
            .find(|(t, _)| *t == board_type)
            .map(|(_, name)| *name)
            .unwrap_or("Unknown");

        BoardInfo {
            revision,
            model: String::from(model),
            processor: String::from(PROCESSORS.get(processor).copied().unwrap_or("Unknown")),
            manufacturer: String::from(MANUFACTURERS.get(manufacturer).copied().unwrap_or("Unknown")),
            memory_mb: 256 << memory,
            pcb_revision,
        }
    }

    /// Returns `true` if the SoC exposes the BCM283x-style GPIO register block
    /// through `/dev/gpiomem`. Boards built around the RP1 I/O controller don't.
    pub fn has_legacy_gpio_registers(&self) -> bool {
        self.processor != "BCM2712"
    }
}

impl fmt::Display for BoardInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Raspberry Pi {} rev 1.{} ({}, {} MB, {}) [revision {:06x}]",
            self.model, self.pcb_revision, self.processor, self.memory_mb, self.manufacturer, self.revision
        )
    }
}

/// The GPIO controller found under the sysfs root.
///
/// * `base`: Global number of the controller's first line
/// * `ngpio`: Number of lines
/// * `label`: Driver label, e.g. `pinctrl-bcm2711`
#[derive(Debug, Clone, PartialEq)]
pub struct ChipInfo {
    pub base: u32,
    pub ngpio: u32,
    pub label: String,
}

impl ChipInfo {
    /// Maps a BCM pin number to the global sysfs GPIO number.
    pub fn global_gpio(&self, pin: u32) -> Result<u32> {
        if pin >= self.ngpio {
            anyhow::bail!("The pin sent is invalid: {} (controller {} has {} lines)", pin, self.label, self.ngpio);
        }
        Ok(self.base + pin)
    }
}

fn read_file_to_string(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(contents) => contents.trim().to_string(),
        Err(e) => {
            debug!("Failed to read file {}: {}", path.display(), e);
            String::from("")
        }
    }
}

fn string_to_uint(s: &str) -> Option<u32> {
    let s = s.trim();
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u32::from_str_radix(s, 16).ok()
}

/// Extracts the revision code from the text of `/proc/cpuinfo`.
///
/// Returns `None` when there is no well-formed `Revision` line.
pub fn parse_cpuinfo_revision(cpuinfo: &str) -> Option<u32> {
    cpuinfo
        .lines()
        .filter(|line| line.starts_with("Revision"))
        .find_map(|line| {
            let (_, value) = line.split_once(':')?;
            string_to_uint(value)
        })
        .map(|rev| rev & REVISION_MASK)
}

/// Returns the board revision code, or 0 if it cannot be determined.
///
/// `RPI_BOARD_REVISION` takes precedence over `<proc_root>/cpuinfo`.
pub fn hardware_revision(proc_root: &Path) -> u32 {
    revision_from(env::var(REVISION_ENV).ok().as_deref(), proc_root)
}

/// Resolves the revision from an override value, falling back to
/// `<proc_root>/cpuinfo` when it is absent or invalid.
pub fn revision_from(override_value: Option<&str>, proc_root: &Path) -> u32 {
    if let Some(value) = override_value {
        match string_to_uint(value) {
            Some(rev) => return rev & REVISION_MASK,
            None => warn!("Environment variable '{}={}' is invalid.", REVISION_ENV, value),
        }
    }

    let cpuinfo = read_file_to_string(&proc_root.join("cpuinfo"));
    match parse_cpuinfo_revision(&cpuinfo) {
        Some(rev) => rev,
        None => {
            warn!("Could not determine board revision from {}/cpuinfo", proc_root.display());
            0
        }
    }
}

/// Returns the board model string from the device tree, if present.
pub fn board_model(proc_root: &Path) -> Option<String> {
    let model = read_file_to_string(&proc_root.join("device-tree/model"));
    let model = model.trim_end_matches('\0');
    if model.is_empty() {
        None
    } else {
        Some(model.to_string())
    }
}

/// Finds the SoC's GPIO controller among the `gpiochip*` entries of `sysfs_root`.
///
/// Controllers labelled `pinctrl-bcm*` or `pinctrl-rp1*` are preferred, else
/// the one with the lowest base is used.
pub fn find_gpio_chip(sysfs_root: &Path) -> Result<ChipInfo> {
    let mut chips: Vec<ChipInfo> = Vec::new();

    let entries = fs::read_dir(sysfs_root)
        .map_err(|e| anyhow::anyhow!("Cannot list {}: {}", sysfs_root.display(), e))?;
    for entry in entries {
        let path: PathBuf = entry?.path();
        let file_name = match path.file_name().and_then(|f| f.to_str()) {
            Some(name) => name,
            None => continue,
        };
        // check if the file name starts with "gpiochip"
        if !file_name.starts_with("gpiochip") {
            continue;
        }

        let base = string_to_decimal(&read_file_to_string(&path.join("base")));
        let ngpio = string_to_decimal(&read_file_to_string(&path.join("ngpio")));
        let (base, ngpio) = match (base, ngpio) {
            (Some(b), Some(n)) => (b, n),
            _ => {
                debug!("Skipping {}: unreadable base/ngpio", path.display());
                continue;
            }
        };

        chips.push(ChipInfo {
            base,
            ngpio,
            label: read_file_to_string(&path.join("label")),
        });
    }

    chips.sort_by_key(|c| c.base);

    let preferred = chips
        .iter()
        .find(|c| c.label.starts_with("pinctrl-bcm") || c.label.starts_with("pinctrl-rp1"))
        .cloned();

    match preferred.or_else(|| chips.into_iter().next()) {
        Some(chip) => Ok(chip),
        None => anyhow::bail!("Cannot find a GPIO chip under {}", sysfs_root.display()),
    }
}

fn string_to_decimal(s: &str) -> Option<u32> {
    s.trim().parse::<u32>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_chip(root: &Path, name: &str, base: u32, ngpio: u32, label: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("base"), format!("{}\n", base)).unwrap();
        fs::write(dir.join("ngpio"), format!("{}\n", ngpio)).unwrap();
        fs::write(dir.join("label"), format!("{}\n", label)).unwrap();
    }

    #[test]
    fn cpuinfo_revision_masks_warranty_bits() {
        let cpuinfo = "processor\t: 0\nHardware\t: BCM2835\nRevision\t: 1a02082\nSerial\t\t: 00000000\n";
        assert_eq!(parse_cpuinfo_revision(cpuinfo), Some(0xa02082));
    }

    #[test]
    fn cpuinfo_without_revision() {
        assert_eq!(parse_cpuinfo_revision("processor\t: 0\n"), None);
        assert_eq!(parse_cpuinfo_revision("Revision\t: zz\n"), None);
    }

    #[test]
    fn hardware_revision_from_proc_root() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("cpuinfo"), "Revision\t: c03112\n").unwrap();

        assert_eq!(revision_from(None, dir.path()), 0xc03112);

        let empty = tempdir().unwrap();
        assert_eq!(revision_from(None, empty.path()), 0);
    }

    #[test]
    fn revision_override_wins_over_cpuinfo() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("cpuinfo"), "Revision\t: c03112\n").unwrap();

        assert_eq!(revision_from(Some("a02082"), dir.path()), 0xa02082);
        assert_eq!(revision_from(Some("0x900092"), dir.path()), 0x900092);
        // warranty bits are masked off like the cpuinfo value
        assert_eq!(revision_from(Some("0x1a02082"), dir.path()), 0xa02082);
    }

    #[test]
    fn invalid_revision_override_falls_back_to_cpuinfo() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("cpuinfo"), "Revision\t: c03112\n").unwrap();

        assert_eq!(revision_from(Some("pi4"), dir.path()), 0xc03112);
        assert_eq!(revision_from(Some(""), dir.path()), 0xc03112);
    }

    #[test]
    fn board_model_strips_trailing_nul() {
        let dir = tempdir().unwrap();
        assert_eq!(board_model(dir.path()), None);

        fs::create_dir(dir.path().join("device-tree")).unwrap();
        fs::write(dir.path().join("device-tree/model"), "Raspberry Pi 4 Model B Rev 1.1\0").unwrap();
        assert_eq!(board_model(dir.path()).as_deref(), Some("Raspberry Pi 4 Model B Rev 1.1"));
    }

    #[test]
    fn decode_new_style_revisions() {
        let info = BoardInfo::from_revision(0xa02082);
        assert_eq!(info.model, "3B");
        assert_eq!(info.processor, "BCM2837");
        assert_eq!(info.manufacturer, "Sony UK");
        assert_eq!(info.memory_mb, 1024);
        assert_eq!(info.pcb_revision, 2);
        assert!(info.has_legacy_gpio_registers());

        let pi5 = BoardInfo::from_revision(0xd04170);
        assert_eq!(pi5.model, "5");
        assert_eq!(pi5.processor, "BCM2712");
        assert_eq!(pi5.memory_mb, 8192);
        assert!(!pi5.has_legacy_gpio_registers());
    }

    #[test]
    fn decode_old_style_revisions() {
        let info = BoardInfo::from_revision(0x000e);
        assert_eq!(info.model, "B");
        assert_eq!(info.memory_mb, 512);
        assert_eq!(info.processor, "BCM2835");

        let unknown = BoardInfo::from_revision(0);
        assert_eq!(unknown.model, "Unknown");
        assert_eq!(unknown.memory_mb, 0);
    }

    #[test]
    fn finds_pinctrl_chip() {
        let dir = tempdir().unwrap();
        make_chip(dir.path(), "gpiochip0", 0, 8, "raspberrypi-exp-gpio");
        make_chip(dir.path(), "gpiochip512", 512, 58, "pinctrl-bcm2711");
        fs::write(dir.path().join("export"), "").unwrap();

        let chip = find_gpio_chip(dir.path()).unwrap();
        assert_eq!(chip.base, 512);
        assert_eq!(chip.global_gpio(17).unwrap(), 529);
        assert!(chip.global_gpio(58).is_err());
    }

    #[test]
    fn falls_back_to_lowest_base() {
        let dir = tempdir().unwrap();
        make_chip(dir.path(), "gpiochip100", 100, 16, "expander");
        make_chip(dir.path(), "gpiochip0", 0, 54, "some-soc");

        let chip = find_gpio_chip(dir.path()).unwrap();
        assert_eq!(chip.label, "some-soc");
    }

    #[test]
    fn no_chip_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(find_gpio_chip(dir.path()).is_err());
    }
}
