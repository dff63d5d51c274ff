mod backend;
mod config;
mod error;
mod gpio;
mod routes;
mod store;
pub mod telemetry;
pub mod topology;

pub use config::{AppConfig, HttpConfig};
pub use error::AppError;
pub use gpio::{
    ActiveState, Direction, GPIO_LIST_KEY, GpioBackend, GpioChip, GpioManager, InitContext,
    LineMode, LineRequest, PersistedPinMap, PinMode, PinModePayload,
};
pub use routes::AppState;
pub use store::{KvStore, MemoryStore, SqliteStore};
pub use topology::{ChipInfo, LineDirection, LineInfo, TopologyTool};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::MockGpioBackend;
