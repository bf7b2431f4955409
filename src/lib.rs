//! Basic GPIO control of the Raspberry Pi through numeric command codes.
//!
//! A call is a positional triple `(command, pin, argument)` handed to a
//! [`Dispatcher`], which runs it against a [`Backend`]:
//!
//! * no arguments - board revision
//! * `(0, pin)` - read the pin level, 1 = high, 0 = low
//! * `(1, pin, level)` - write an output level
//! * `(2, pin, duty)` - PWM duty cycle, 0 - 1024
//! * `(3, pin, direction)` - 1 = output, 0 = input
//! * `(4, pin, pull)` - -1 = pull down, 0 = none, 1 = pull up
//! * `(5, pin, timeout_ms)` - wait for an edge, -1 = forever; returns 1 on an
//!   edge, 0 on timeout and -1 on error
//!
//! Pins use the Broadcom (BCM) numbering. [`SysfsBackend`] drives real
//! hardware, [`SimBackend`] is an in-memory board.

pub mod board_data;
pub mod config;
pub mod dispatch;
pub mod gpio;
mod gpiomem;
pub mod sim;

pub use board_data::BoardInfo;
pub use config::Config;
pub use dispatch::{Command, Dispatcher};
pub use gpio::{Backend, Direction, EdgeEvent, Level, Pull, SysfsBackend};
pub use sim::SimBackend;
