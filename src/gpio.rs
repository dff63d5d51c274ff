use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use log::{error, info, warn};
use parking_lot::{RwLock, RwLockWriteGuard};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::error::AppError;
use crate::store::KvStore;

/// Store key holding the last applied mode of every configured pin.
pub const GPIO_LIST_KEY: &str = "gpio_list";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl FromStr for Direction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            other => Err(AppError::InvalidDirection(other.to_string())),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::In => "in",
            Direction::Out => "out",
        })
    }
}

/// Polarity hint. Validated and recorded, not applied to the line request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActiveState {
    Low,
    High,
}

impl FromStr for ActiveState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(ActiveState::Low),
            "high" => Ok(ActiveState::High),
            other => Err(AppError::InvalidActiveState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinMode {
    pub pin: u32,
    pub value: u8,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<ActiveState>,
}

impl PinMode {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.value > 1 {
            return Err(AppError::InvalidValue("Value must be 0 or 1".into()));
        }
        Ok(())
    }
}

/// Untyped pin mode as received from clients.
#[derive(Debug, Default, Deserialize)]
pub struct PinModePayload {
    pub pin: Option<i64>,
    pub value: Option<i64>,
    pub direction: Option<String>,
    pub active: Option<String>,
}

impl PinModePayload {
    /// Validates every field against the allowed values. `pin` always wins
    /// over any pin number carried in the payload.
    pub fn into_pin_mode(self, pin: u32) -> Result<PinMode, AppError> {
        let direction = self.direction.unwrap_or_default().parse::<Direction>()?;
        let active = match self.active.as_deref() {
            None | Some("") => None,
            Some(s) => Some(s.parse::<ActiveState>()?),
        };
        let value = match self.value.unwrap_or(0) {
            0 => 0,
            1 => 1,
            _ => return Err(AppError::InvalidValue("Value must be 0 or 1".into())),
        };

        Ok(PinMode {
            pin,
            value,
            direction,
            active,
        })
    }
}

pub type PersistedPinMap = BTreeMap<u32, PinMode>;

/// How a single line is requested from the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineMode {
    Input,
    Output { value: u8 },
}

impl From<&PinMode> for LineMode {
    fn from(mode: &PinMode) -> Self {
        match mode.direction {
            Direction::In => LineMode::Input,
            Direction::Out => LineMode::Output { value: mode.value },
        }
    }
}

pub trait GpioBackend: Send + Sync {
    fn open_chip(&self, name: &str) -> Result<Box<dyn GpioChip>, AppError>;
}

/// An open chip. Dropping it closes the underlying device.
pub trait GpioChip: Send + Sync {
    fn num_lines(&self) -> u32;
    /// Consumer label of whoever holds `offset`, `None` when unclaimed.
    fn line_consumer(&self, offset: u32) -> Result<Option<String>, AppError>;
    fn request_line(
        &self,
        offset: u32,
        mode: LineMode,
        consumer: &str,
    ) -> Result<Box<dyn LineRequest>, AppError>;
}

/// Exclusive request on one line.
pub trait LineRequest: Send + Sync {
    fn value(&self) -> Result<u8, AppError>;
    fn release(self: Box<Self>) -> Result<(), AppError>;
}

/// Cancellation flag observed by [`GpioManager::initialize`].
#[derive(Debug, Clone, Default)]
pub struct InitContext {
    cancel: Arc<AtomicBool>,
}

impl InitContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct ChipState {
    chip: Option<Box<dyn GpioChip>>,
    lines: FxHashMap<u32, Box<dyn LineRequest>>, // keyed by pin
}

pub struct GpioManager {
    config: Arc<AppConfig>,
    backend: Arc<dyn GpioBackend>,
    store: Arc<dyn KvStore>,
    state: RwLock<ChipState>,
    init: OnceLock<Result<(), AppError>>,
}

impl GpioManager {
    pub fn new(
        config: Arc<AppConfig>,
        backend: Arc<dyn GpioBackend>,
        store: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            config,
            backend,
            store,
            state: RwLock::new(ChipState::default()),
            init: OnceLock::new(),
        }
    }

    /// Opens the chip once per manager. Later and concurrent callers get the
    /// outcome of that single attempt.
    pub fn initialize(&self, ctx: &InitContext) -> Result<(), AppError> {
        self.init.get_or_init(|| self.open_chip(ctx)).clone()
    }

    fn open_chip(&self, ctx: &InitContext) -> Result<(), AppError> {
        let mut state = self.state.write();

        let chip = self.backend.open_chip(&self.config.chip).map_err(|e| {
            error!("GPIO: {e}");
            e
        })?;

        if ctx.is_cancelled() {
            info!("Closing GPIO chip {} due to cancellation", self.config.chip);
            drop(chip);
            return Err(AppError::Cancelled);
        }

        info!(
            "GPIO chip {} initialized with {} lines",
            self.config.chip,
            chip.num_lines()
        );
        state.chip = Some(chip);
        Ok(())
    }

    pub fn check_chip(&self) -> bool {
        self.state.read().chip.is_some()
    }

    /// Applies `mode` to the chip and records it in the store.
    ///
    /// A `Persistence` error means the line was configured but not recorded.
    /// A `ReadBack` error means the input line was configured and recorded.
    pub fn set_pin_mode(&self, mode: &PinMode) -> Result<(), AppError> {
        mode.validate()?;

        let mut state = self.state.write();
        let ChipState { chip, lines } = &mut *state;
        let chip = chip.as_ref().ok_or(AppError::ChipNotInitialized)?;
        let pin = mode.pin;

        if let Some(old) = lines.remove(&pin)
            && let Err(e) = old.release()
        {
            warn!("GPIO: ignoring error closing previous request on pin {pin}: {e}");
        }

        let request = chip
            .request_line(pin, LineMode::from(mode), &self.config.app_name)
            .map_err(|e| {
                let err = AppError::LineRequest {
                    pin,
                    reason: e.to_string(),
                };
                error!("GPIO: {err}");
                err
            })?;
        lines.insert(pin, request);

        self.record_pin(mode).map_err(|e| {
            error!("GPIO: pin {pin} applied but not recorded: {e}");
            e
        })?;

        // Read-back only needs the handle to stay registered, so it runs under
        // the shared lock: other readers proceed, writers still wait.
        let state = RwLockWriteGuard::downgrade(state);
        if mode.direction == Direction::In
            && let Some(request) = state.lines.get(&pin)
        {
            let value = request.value().map_err(|e| {
                let err = AppError::ReadBack {
                    pin,
                    reason: e.to_string(),
                };
                error!("GPIO: {err}");
                err
            })?;
            info!("GPIO: pin {pin} value: {value}");
        }

        info!("GPIO: pin {pin} set to {} ({})", mode.value, mode.direction);
        Ok(())
    }

    fn load_pins(&self) -> Result<PersistedPinMap, AppError> {
        match self.store.get(GPIO_LIST_KEY)? {
            None => Ok(PersistedPinMap::new()),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| AppError::Persistence(format!("corrupt {GPIO_LIST_KEY}: {e}"))),
        }
    }

    fn record_pin(&self, mode: &PinMode) -> Result<(), AppError> {
        let mut pins = self.load_pins()?;
        pins.insert(mode.pin, mode.clone());
        let bytes = serde_json::to_vec(&pins)
            .map_err(|e| AppError::Persistence(format!("encode {GPIO_LIST_KEY}: {e}")))?;
        self.store.put(GPIO_LIST_KEY, &bytes)
    }

    /// Last configured mode of every pin, not the live electrical state.
    pub fn get_all(&self) -> Result<PersistedPinMap, AppError> {
        if !self.check_chip() {
            return Err(AppError::ChipNotInitialized);
        }
        self.load_pins()
    }

    /// Lines currently claimed by any consumer on the chip, keyed by offset.
    pub fn get_gpio_all(&self) -> Result<BTreeMap<u32, String>, AppError> {
        let state = self.state.read();
        let chip = state.chip.as_ref().ok_or(AppError::ChipNotInitialized)?;

        let mut used = BTreeMap::new();
        for offset in 0..chip.num_lines() {
            match chip.line_consumer(offset) {
                Ok(Some(consumer)) if !consumer.is_empty() => {
                    used.insert(offset, consumer);
                }
                Ok(_) => {}
                Err(e) => warn!("GPIO: error retrieving line info for line {offset}: {e}"),
            }
        }
        Ok(used)
    }

    /// Pins holding a live line request from this manager.
    pub fn open_lines(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self.state.read().lines.keys().copied().collect();
        pins.sort_unstable();
        pins
    }

    /// Releases every line request and closes the chip.
    pub fn shutdown(&self) {
        let mut state = self.state.write();
        for (pin, request) in state.lines.drain() {
            if let Err(e) = request.release() {
                warn!("GPIO: error closing pin {pin} on shutdown: {e}");
            }
        }
        if state.chip.take().is_some() {
            info!("GPIO chip {} closed", self.config.chip);
        }
    }
}

impl Drop for GpioManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
