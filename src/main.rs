//! `rpi-gpio` - basic GPIO control of the Raspberry Pi from the command line.
//!
//! ```bash
//! # Board revision
//! rpi-gpio
//!
//! # Configure BCM 17 as output and drive it high
//! rpi-gpio 3 17 1
//! rpi-gpio 1 17 1
//!
//! # Wait up to 5 s for an edge on BCM 27
//! rpi-gpio 5 27 5000
//! ```

use anyhow::Result;
use clap::{CommandFactory, Parser};
use log::debug;
use std::path::PathBuf;

use rpi_gpio_cmd::{board_data, Backend, BoardInfo, Config, Dispatcher, SimBackend, SysfsBackend};

// Revision reported by the simulated board (a Raspberry Pi 4B, 4 GB).
const SIM_REVISION: u32 = 0xc03111;

/// Basic GPIO control of the Raspberry Pi
///
/// Pin numbers are in Broadcom numbering scheme aka BCM_GPIO numbering.
/// With no arguments, prints the board revision.
#[derive(Parser)]
#[command(name = "rpi-gpio")]
#[command(version)]
#[command(after_long_help = USAGE)]
struct Cli {
    /// Command code, pin number and optional argument
    #[arg(value_name = "COMMAND PIN [ARG]", allow_negative_numbers = true, num_args = 0..=3)]
    args: Vec<i32>,

    /// Configuration file (TOML); defaults to $RPI_GPIO_CONFIG
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run against an in-memory board instead of the hardware
    #[arg(long)]
    simulate: bool,

    /// Report read/write/direction/pull failures as errors
    #[arg(long)]
    strict: bool,

    /// With no command, print the decoded board information instead of the revision number
    #[arg(long)]
    board_info: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

const USAGE: &str = "\
Commands:
  rpi-gpio
      Return RaspberryPi board revision number. Different revisions == different pinout.
  rpi-gpio 0 PIN
      Query state of pin number PIN: 1 = High, 0 = Low.
  rpi-gpio 1 PIN LEVEL
      Set state of pin number PIN to logic level LEVEL: 1 = High, 0 = Low.
  rpi-gpio 2 PIN LEVEL
      Set pulse-width modulation level of pin number PIN to LEVEL: 0 - 1024.
  rpi-gpio 3 PIN DIRECTION
      Set direction of pin number PIN: 1 = Output, 0 = Input.
  rpi-gpio 4 PIN PULLMODE
      Set resistor mode of pin PIN: -1 = Pull down, 1 = Pull up, 0 = None.
      Pin must be configured as input for pullup/pulldown resistors to work.
  rpi-gpio 5 PIN TIMEOUT_MS
      Wait for rising/falling edge on input pin PIN with a timeout of TIMEOUT_MS: -1 = Infinite wait.
      Prints -1 = error, 0 = timed out, 1 = trigger received.";

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    if cli.args.len() == 1 {
        Cli::command().print_long_help()?;
        return Ok(());
    }

    let mut config = Config::load(cli.config.as_deref())?;
    // each invocation is one command, so pin setup must outlive the process
    config.release_pins = false;
    debug!("Configuration: {:?}", config);

    if cli.simulate {
        run(Dispatcher::with_config(SimBackend::new(SIM_REVISION), &config), &cli, &config)
    } else {
        run(Dispatcher::with_config(SysfsBackend::new(config.clone()), &config), &cli, &config)
    }
}

fn run<B: Backend>(mut dispatcher: Dispatcher<B>, cli: &Cli, config: &Config) -> Result<()> {
    if cli.strict {
        dispatcher.set_strict_errors(true);
    }

    let result = dispatcher.call(&cli.args)?;

    match result {
        Some(revision) if cli.args.is_empty() && cli.board_info => {
            if let Some(model) = board_data::board_model(&config.proc_root) {
                println!("{}", model);
            }
            println!("{}", BoardInfo::from_revision(revision as u32));
        }
        Some(value) => println!("{}", value),
        None => {}
    }

    dispatcher.shutdown();
    Ok(())
}
