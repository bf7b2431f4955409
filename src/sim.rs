use anyhow::Result;
use log::debug;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use crate::gpio::{
    Backend, Direction, EdgeCallback, EdgeEvent, Level, Pull, DEFAULT_PWM_RANGE, MAX_PWM_RANGE,
};

/// Number of pins on the simulated board (BCM 0 - 53).
pub const SIM_PIN_COUNT: u32 = 54;

// Pins that can run PWM, as on the real board's user GPIOs.
const SIM_PWM_PINS: u32 = 32;

/// One backend operation, as recorded by [`SimBackend::calls`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Initialize,
    Terminate,
    HardwareRevision,
    Read(u32),
    Write(u32, Level),
    PwmRange(u32),
    SetPwmRange(u32, u32),
    PwmDuty(u32),
    SetPwmDuty(u32, u32),
    SetDirection(u32, Direction),
    SetPull(u32, Pull),
    SetEdgeCallback(u32, Option<Duration>),
    ClearEdgeCallback(u32),
}

#[derive(Debug, Clone)]
struct PinState {
    direction: Direction,
    level: Level,
    pull: Pull,
    pwm_range: u32,
    pwm_duty: u32,
}

impl Default for PinState {
    fn default() -> Self {
        PinState {
            direction: Direction::IN,
            level: Level::LOW,
            pull: Pull::OFF,
            pwm_range: DEFAULT_PWM_RANGE,
            pwm_duty: 0,
        }
    }
}

struct Registration {
    generation: u64,
    callback: EdgeCallback,
}

struct SimState {
    revision: u32,
    initialized: bool,
    fail_next_init: bool,
    fail_edge_setup: bool,
    pins: HashMap<u32, PinState>,
    edges: HashMap<u32, Registration>,
    next_generation: u64,
    calls: Vec<Call>,
}

/// An in-memory board implementing [`Backend`].
///
/// Output writes loop back to reads, input levels can be driven from outside
/// with [`set_input_level`](SimBackend::set_input_level), and every backend
/// call is recorded. The handle is cheap to clone; clones share the board, so
/// a test can keep one while a dispatcher owns another.
///
/// # Example
///
/// ```rust
/// use rpi_gpio_cmd::{Backend, Level, SimBackend};
/// use rpi_gpio_cmd::sim::Call;
///
/// let mut board = SimBackend::new(0xc03111);
/// board.initialize().unwrap();
/// board.write(17, Level::HIGH).unwrap();
/// assert_eq!(board.read(17).unwrap(), Level::HIGH);
/// assert_eq!(board.calls()[1], Call::Write(17, Level::HIGH));
/// ```
#[derive(Clone)]
pub struct SimBackend {
    state: Arc<Mutex<SimState>>,
}

impl SimBackend {
    /// Creates a board reporting `revision` as its hardware revision.
    pub fn new(revision: u32) -> Self {
        SimBackend {
            state: Arc::new(Mutex::new(SimState {
                revision,
                initialized: false,
                fail_next_init: false,
                fail_edge_setup: false,
                pins: HashMap::new(),
                edges: HashMap::new(),
                next_generation: 0,
                calls: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns every backend call made so far, oldest first.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    /// Makes the next `initialize` fail.
    pub fn fail_next_init(&self) {
        self.lock().fail_next_init = true;
    }

    /// Makes every `set_edge_callback` fail while `fail` is set.
    pub fn fail_edge_setup(&self, fail: bool) {
        self.lock().fail_edge_setup = fail;
    }

    pub fn direction(&self, pin: u32) -> Option<Direction> {
        self.lock().pins.get(&pin).map(|p| p.direction)
    }

    pub fn pull(&self, pin: u32) -> Option<Pull> {
        self.lock().pins.get(&pin).map(|p| p.pull)
    }

    pub fn has_edge_callback(&self, pin: u32) -> bool {
        self.lock().edges.contains_key(&pin)
    }

    /// Drives an input pin from outside. A change of level fires the pin's
    /// edge callback, if one is registered.
    pub fn set_input_level(&self, pin: u32, level: Level) {
        let fired = {
            let mut state = self.lock();
            let pin_state = state.pins.entry(pin).or_default();
            let changed = pin_state.level != level;
            pin_state.level = level;
            if changed {
                state.edges.remove(&pin)
            } else {
                None
            }
        };

        if let Some(mut registration) = fired {
            (registration.callback)(EdgeEvent::Edge(level));
        }
    }

    /// Fires the pin's edge callback as if the level had just changed to `level`.
    /// Returns `false` if nothing was registered.
    pub fn trigger_edge(&self, pin: u32, level: Level) -> bool {
        let fired = {
            let mut state = self.lock();
            state.pins.entry(pin).or_default().level = level;
            state.edges.remove(&pin)
        };

        match fired {
            Some(mut registration) => {
                (registration.callback)(EdgeEvent::Edge(level));
                true
            }
            None => false,
        }
    }

    // Records the call and checks the board is up and the pin exists.
    fn begin(&self, call: Call, pin: Option<u32>) -> Result<MutexGuard<'_, SimState>> {
        let mut state = self.lock();
        state.calls.push(call);
        if !state.initialized {
            anyhow::bail!("GPIO subsystem is not initialized");
        }
        if let Some(pin) = pin {
            if pin >= SIM_PIN_COUNT {
                anyhow::bail!("The pin sent is invalid: {}", pin);
            }
        }
        Ok(state)
    }

    fn check_pwm_pin(pin: u32) -> Result<()> {
        if pin >= SIM_PWM_PINS {
            anyhow::bail!("Pin {} has no PWM support", pin);
        }
        Ok(())
    }
}

impl Backend for SimBackend {
    fn initialize(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(Call::Initialize);
        if state.fail_next_init {
            state.fail_next_init = false;
            anyhow::bail!("Simulated initialization failure");
        }
        state.initialized = true;
        Ok(())
    }

    fn terminate(&mut self) {
        let dropped = {
            let mut state = self.lock();
            state.calls.push(Call::Terminate);
            state.initialized = false;
            std::mem::take(&mut state.edges)
        };
        // callbacks are dropped outside the lock
        drop(dropped);
    }

    fn hardware_revision(&self) -> Result<u32> {
        let state = self.begin(Call::HardwareRevision, None)?;
        Ok(state.revision)
    }

    fn read(&mut self, pin: u32) -> Result<Level> {
        let mut state = self.begin(Call::Read(pin), Some(pin))?;
        Ok(state.pins.entry(pin).or_default().level)
    }

    fn write(&mut self, pin: u32, level: Level) -> Result<()> {
        let fired = {
            let mut state = self.begin(Call::Write(pin, level), Some(pin))?;
            let pin_state = state.pins.entry(pin).or_default();
            let changed = pin_state.level != level;
            pin_state.level = level;
            pin_state.pwm_duty = 0;
            if changed {
                state.edges.remove(&pin)
            } else {
                None
            }
        };

        if let Some(mut registration) = fired {
            (registration.callback)(EdgeEvent::Edge(level));
        }
        Ok(())
    }

    fn pwm_range(&mut self, pin: u32) -> Result<u32> {
        let mut state = self.begin(Call::PwmRange(pin), Some(pin))?;
        Self::check_pwm_pin(pin)?;
        Ok(state.pins.entry(pin).or_default().pwm_range)
    }

    fn set_pwm_range(&mut self, pin: u32, range: u32) -> Result<()> {
        let mut state = self.begin(Call::SetPwmRange(pin, range), Some(pin))?;
        Self::check_pwm_pin(pin)?;
        if range == 0 || range > MAX_PWM_RANGE {
            anyhow::bail!("Invalid PWM range {}", range);
        }

        let pin_state = state.pins.entry(pin).or_default();
        pin_state.pwm_duty = (pin_state.pwm_duty as u64 * range as u64 / pin_state.pwm_range as u64) as u32;
        pin_state.pwm_range = range;
        Ok(())
    }

    fn pwm_duty(&mut self, pin: u32) -> Result<u32> {
        let mut state = self.begin(Call::PwmDuty(pin), Some(pin))?;
        Self::check_pwm_pin(pin)?;
        Ok(state.pins.entry(pin).or_default().pwm_duty)
    }

    fn set_pwm_duty(&mut self, pin: u32, duty: u32) -> Result<()> {
        let mut state = self.begin(Call::SetPwmDuty(pin, duty), Some(pin))?;
        Self::check_pwm_pin(pin)?;

        let pin_state = state.pins.entry(pin).or_default();
        if duty > pin_state.pwm_range {
            anyhow::bail!("Invalid PWM duty {}: range is 0 - {}", duty, pin_state.pwm_range);
        }
        pin_state.pwm_duty = duty;
        pin_state.direction = Direction::OUT;
        Ok(())
    }

    fn set_direction(&mut self, pin: u32, direction: Direction) -> Result<()> {
        let mut state = self.begin(Call::SetDirection(pin, direction), Some(pin))?;
        state.pins.entry(pin).or_default().direction = direction;
        Ok(())
    }

    fn set_pull(&mut self, pin: u32, pull: Pull) -> Result<()> {
        {
            let mut state = self.begin(Call::SetPull(pin, pull), Some(pin))?;
            state.pins.entry(pin).or_default().pull = pull;
        }

        // an undriven input follows its pull resistor
        if self.direction(pin) != Some(Direction::OUT) {
            match pull {
                Pull::UP => self.set_input_level(pin, Level::HIGH),
                Pull::DOWN => self.set_input_level(pin, Level::LOW),
                Pull::OFF => {}
            }
        }
        Ok(())
    }

    fn set_edge_callback(&mut self, pin: u32, timeout: Option<Duration>, callback: EdgeCallback) -> Result<()> {
        let generation = {
            let mut state = self.begin(Call::SetEdgeCallback(pin, timeout), Some(pin))?;
            if state.fail_edge_setup {
                anyhow::bail!("Simulated edge setup failure on pin {}", pin);
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            state.edges.insert(pin, Registration { generation, callback });
            generation
        };

        if let Some(timeout) = timeout {
            let shared = Arc::clone(&self.state);
            thread::spawn(move || {
                thread::sleep(timeout);
                let expired = {
                    let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
                    match state.edges.get(&pin) {
                        Some(r) if r.generation == generation => state.edges.remove(&pin),
                        _ => None,
                    }
                };
                if let Some(mut registration) = expired {
                    debug!("Simulated edge wait on pin {} timed out", pin);
                    (registration.callback)(EdgeEvent::Timeout);
                }
            });
        }

        Ok(())
    }

    fn clear_edge_callback(&mut self, pin: u32) -> Result<()> {
        let removed = {
            let mut state = self.begin(Call::ClearEdgeCallback(pin), Some(pin))?;
            state.edges.remove(&pin)
        };
        drop(removed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn board() -> SimBackend {
        let mut board = SimBackend::new(0xa02082);
        board.initialize().unwrap();
        board
    }

    #[test]
    fn operations_need_initialize() {
        let mut board = SimBackend::new(1);
        assert!(board.read(4).is_err());
        assert!(board.hardware_revision().is_err());
        board.initialize().unwrap();
        assert_eq!(board.hardware_revision().unwrap(), 1);
    }

    #[test]
    fn pull_drives_undriven_input() {
        let mut board = board();
        board.set_pull(22, Pull::UP).unwrap();
        assert_eq!(board.read(22).unwrap(), Level::HIGH);
        board.set_pull(22, Pull::DOWN).unwrap();
        assert_eq!(board.read(22).unwrap(), Level::LOW);
        assert_eq!(board.pull(22), Some(Pull::DOWN));
    }

    #[test]
    fn range_change_rescales_duty() {
        let mut board = board();
        board.set_pwm_duty(18, 100).unwrap();
        board.set_pwm_range(18, 510).unwrap();
        assert_eq!(board.pwm_duty(18).unwrap(), 200);
        assert!(board.set_pwm_duty(40, 1).is_err());
    }

    #[test]
    fn edge_callback_fires_once() {
        let mut board = board();
        let (tx, rx) = mpsc::channel();
        board
            .set_edge_callback(5, None, Box::new(move |e: EdgeEvent| tx.send(e).unwrap()))
            .unwrap();

        assert!(board.trigger_edge(5, Level::HIGH));
        assert!(!board.trigger_edge(5, Level::LOW));
        assert_eq!(rx.recv().unwrap(), EdgeEvent::Edge(Level::HIGH));
        assert!(rx.recv().is_err());
    }

    #[test]
    fn stale_timer_does_not_fire_new_registration() {
        let mut board = board();
        let (tx1, rx1) = mpsc::channel();
        board
            .set_edge_callback(6, Some(Duration::from_millis(10)), Box::new(move |e: EdgeEvent| tx1.send(e).unwrap()))
            .unwrap();
        board.clear_edge_callback(6).unwrap();

        let (tx2, rx2) = mpsc::channel();
        board
            .set_edge_callback(6, None, Box::new(move |e: EdgeEvent| tx2.send(e).unwrap()))
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert!(rx1.recv().is_err());
        assert!(rx2.try_recv().is_err());
        assert!(board.has_edge_callback(6));
    }

    #[test]
    fn terminate_drops_callbacks() {
        let mut board = board();
        let (tx, rx) = mpsc::channel::<EdgeEvent>();
        board
            .set_edge_callback(7, None, Box::new(move |e: EdgeEvent| tx.send(e).unwrap()))
            .unwrap();
        board.terminate();
        assert!(rx.recv().is_err());
        assert!(!board.is_initialized());
    }
}
