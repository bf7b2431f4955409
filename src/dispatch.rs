use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::{
    sync::mpsc::{self, RecvTimeoutError},
    time::Duration,
};

use crate::config::Config;
use crate::gpio::{Backend, Direction, EdgeEvent, Level, Pull};

/// PWM range the dispatcher puts every pin on before setting a duty cycle.
pub const PWM_RANGE: u32 = 1024;

// How much longer than the requested timeout an edge wait blocks before it
// gives up on the backend's timeout notification.
const EDGE_WAIT_GRACE: Duration = Duration::from_millis(250);

/// A decoded call.
///
/// Built from the positional `(command code, pin, argument)` triple with
/// [`Command::from_args`]; `Revision` is the zero-argument query.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Report the hardware revision.
    Revision,
    /// Code 0: read the pin level.
    Read { pin: u32 },
    /// Code 1: drive an output pin.
    Write { pin: u32, level: Level },
    /// Code 2: set the PWM duty cycle, `0..=1024`.
    Pwm { pin: u32, duty: u32 },
    /// Code 3: set the pin direction.
    SetDirection { pin: u32, direction: Direction },
    /// Code 4: set the pull resistor.
    SetPull { pin: u32, pull: Pull },
    /// Code 5: block until an edge or the timeout; `None` waits forever.
    WaitEdge { pin: u32, timeout: Option<Duration> },
}

impl Command {
    /// Decodes a command code, pin number and optional argument.
    ///
    /// # Example
    ///
    /// ```rust
    /// use rpi_gpio_cmd::{Command, Level};
    ///
    /// let cmd = Command::from_args(1, 17, Some(1)).unwrap();
    /// assert_eq!(cmd, Command::Write { pin: 17, level: Level::HIGH });
    ///
    /// assert!(Command::from_args(1, 17, None).is_err());
    /// assert!(Command::from_args(99, 17, Some(0)).is_err());
    /// ```
    pub fn from_args(code: i32, pin: i32, arg: Option<i32>) -> Result<Command> {
        // the pin is only checked once the code is known
        let parse_pin = || u32::try_from(pin).map_err(|_| anyhow!("Invalid pin number {}", pin));

        let cmd = match code {
            0 => Command::Read { pin: parse_pin()? },
            1 => {
                let pin = parse_pin()?;
                let level = match arg {
                    Some(a) if a >= 0 => Level::try_from(a)?,
                    _ => anyhow::bail!("New logic level of output pin missing for output pin write."),
                };
                Command::Write { pin, level }
            }
            2 => {
                let pin = parse_pin()?;
                let duty = match arg {
                    Some(a) if a >= 0 => a as u32,
                    _ => anyhow::bail!("New pwm level of output pin missing for output pin pulse-width modulation."),
                };
                if duty > PWM_RANGE {
                    anyhow::bail!("Invalid pwm level specified. Must be in range 0 - {}.", PWM_RANGE);
                }
                Command::Pwm { pin, duty }
            }
            3 => {
                let pin = parse_pin()?;
                let direction = match arg {
                    Some(0) => Direction::IN,
                    Some(a) if a > 0 => Direction::OUT,
                    _ => anyhow::bail!("New opmode for pin missing for pin mode configuration."),
                };
                Command::SetDirection { pin, direction }
            }
            4 => {
                let pin = parse_pin()?;
                let pull = match arg {
                    Some(0) => Pull::OFF,
                    Some(a) if a > 0 => Pull::UP,
                    Some(-1) => Pull::DOWN,
                    _ => anyhow::bail!("New pullup/down for pin missing for pin resistor configuration."),
                };
                Command::SetPull { pin, pull }
            }
            5 => {
                let pin = parse_pin()?;
                let timeout = match arg {
                    Some(-1) => None,
                    Some(ms) if ms >= 0 => Some(Duration::from_millis(ms as u64)),
                    _ => anyhow::bail!("Timeout value in milliseconds missing."),
                };
                Command::WaitEdge { pin, timeout }
            }
            _ => anyhow::bail!("Unknown command code provided: {}", code),
        };

        Ok(cmd)
    }
}

/// Executes [`Command`]s against a [`Backend`].
///
/// The backend is initialized on the first executed command and terminated by
/// [`shutdown`](Dispatcher::shutdown) or when the dispatcher is dropped.
///
/// # Example
///
/// ```rust
/// use rpi_gpio_cmd::{Dispatcher, SimBackend};
///
/// let mut dispatcher = Dispatcher::new(SimBackend::new(0xa02082));
///
/// assert_eq!(dispatcher.call(&[]).unwrap(), Some(0xa02082));
///
/// dispatcher.call(&[3, 17, 1]).unwrap();
/// dispatcher.call(&[1, 17, 1]).unwrap();
/// assert_eq!(dispatcher.call(&[0, 17]).unwrap(), Some(1));
/// ```
pub struct Dispatcher<B: Backend> {
    backend: B,
    initialized: bool,
    strict_errors: bool,
}

impl<B: Backend> Dispatcher<B> {
    pub fn new(backend: B) -> Self {
        Dispatcher {
            backend,
            initialized: false,
            strict_errors: false,
        }
    }

    pub fn with_config(backend: B, config: &Config) -> Self {
        let mut dispatcher = Dispatcher::new(backend);
        dispatcher.strict_errors = config.strict_errors;
        dispatcher
    }

    /// Surface read/write/direction/pull failures as errors instead of logging them.
    pub fn set_strict_errors(&mut self, strict: bool) {
        self.strict_errors = strict;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Runs a call given in positional form.
    ///
    /// * `[]` - hardware revision
    /// * `[code, pin]` or `[code, pin, arg]` - see [`Command::from_args`]
    ///
    /// Returns the scalar result of the command, if it has one.
    pub fn call(&mut self, args: &[i32]) -> Result<Option<i64>> {
        let cmd = match *args {
            [] => Command::Revision,
            [code, pin] => Command::from_args(code, pin, None)?,
            [code, pin, arg] => Command::from_args(code, pin, Some(arg))?,
            _ => anyhow::bail!(
                "Expected no arguments, or a command code and pin number with an optional argument (got {})",
                args.len()
            ),
        };
        self.execute(cmd)
    }

    /// Executes one command. The backend is brought up first if needed.
    pub fn execute(&mut self, cmd: Command) -> Result<Option<i64>> {
        self.ensure_initialized()?;
        debug!("Executing {:?}", cmd);

        match cmd {
            Command::Revision => Ok(Some(self.backend.hardware_revision()? as i64)),
            Command::Read { pin } => match self.backend.read(pin) {
                Ok(level) => Ok(Some(level as i64)),
                Err(e) => {
                    self.unchecked(e, "read", pin)?;
                    Ok(Some(-1))
                }
            },
            Command::Write { pin, level } => {
                let result = self.backend.write(pin, level);
                self.check(result, "write", pin)
            }
            Command::Pwm { pin, duty } => {
                self.set_pwm(pin, duty)?;
                Ok(None)
            }
            Command::SetDirection { pin, direction } => {
                let result = self.backend.set_direction(pin, direction);
                self.check(result, "set direction of", pin)
            }
            Command::SetPull { pin, pull } => {
                let result = self.backend.set_pull(pin, pull);
                self.check(result, "set pull resistor of", pin)
            }
            Command::WaitEdge { pin, timeout } => Ok(Some(self.wait_for_edge(pin, timeout))),
        }
    }

    /// Terminates the backend if it was initialized.
    pub fn shutdown(&mut self) {
        if self.initialized {
            info!("Shutting down GPIO subsystem");
            self.backend.terminate();
            self.initialized = false;
        }
    }

    fn ensure_initialized(&mut self) -> Result<()> {
        if !self.initialized {
            self.backend
                .initialize()
                .map_err(|e| anyhow!("Failed to initialize GPIO system: {:#}", e))?;
            self.initialized = true;
            info!("GPIO subsystem initialized");
        }
        Ok(())
    }

    fn check(&self, result: Result<()>, what: &str, pin: u32) -> Result<Option<i64>> {
        if let Err(e) = result {
            self.unchecked(e, what, pin)?;
        }
        Ok(None)
    }

    // Read/write/direction/pull failures only abort the call in strict mode.
    fn unchecked(&self, e: anyhow::Error, what: &str, pin: u32) -> Result<()> {
        if self.strict_errors {
            return Err(e.context(format!("Failed to {} pin {}", what, pin)));
        }
        warn!("Failed to {} pin {}: {:#}", what, pin, e);
        Ok(())
    }

    fn set_pwm(&mut self, pin: u32, duty: u32) -> Result<()> {
        if self.backend.pwm_range(pin)? != PWM_RANGE {
            self.backend.set_pwm_range(pin, PWM_RANGE)?;
        }

        self.backend
            .set_pwm_duty(pin, duty)
            .map_err(|e| anyhow!("Failed to set new pwm level of output pin for output pin pulse-width modulation: {:#}", e))
    }

    /// Returns 1 on an edge, 0 on timeout and -1 if the wait could not be set up.
    fn wait_for_edge(&mut self, pin: u32, timeout: Option<Duration>) -> i64 {
        let (tx, rx) = mpsc::channel();
        let callback = Box::new(move |event: EdgeEvent| {
            // the waiter may already have given up
            let _ = tx.send(event);
        });

        if let Err(e) = self.backend.set_edge_callback(pin, timeout, callback) {
            warn!("Failed to set up edge detection on pin {}: {:#}", pin, e);
            return -1;
        }

        let event = match timeout {
            Some(timeout) => match rx.recv_timeout(timeout + EDGE_WAIT_GRACE) {
                Ok(event) => Some(event),
                Err(RecvTimeoutError::Timeout) => {
                    warn!("No timeout notification for pin {}, treating as timeout", pin);
                    Some(EdgeEvent::Timeout)
                }
                Err(RecvTimeoutError::Disconnected) => None,
            },
            None => rx.recv().ok(),
        };

        if let Err(e) = self.backend.clear_edge_callback(pin) {
            warn!("Failed to clear edge detection on pin {}: {:#}", pin, e);
        }

        match event {
            Some(EdgeEvent::Edge(level)) => {
                debug!("Edge on pin {}, level now {:?}", pin, level);
                1
            }
            Some(EdgeEvent::Timeout) => 0,
            None => {
                warn!("Edge notification for pin {} was lost", pin);
                -1
            }
        }
    }
}

impl<B: Backend> Drop for Dispatcher<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
