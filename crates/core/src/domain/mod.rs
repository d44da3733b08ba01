//! Domain entities and hardware protocols

pub mod attenuator;
pub mod config;
pub mod controller;
pub mod error;
pub mod hardware;
pub mod matrix;
pub mod output;
pub mod power;
pub mod preamp;
pub mod scheduler;
pub mod sim;

// Re-export specific items to avoid ambiguous glob imports
pub use attenuator::VolumeAttenuator;
pub use config::{ConfigError, ConfigManager, OutputConfig, PreampConfig};
pub use controller::{PreampController, PreampStatus};
pub use error::{PreampError, Result, Violation};
pub use hardware::{GpioLine, GpioProvider, HardwareLock, OutputLine, RelayLatch, RelayTiming};
pub use matrix::RoutingMatrix;
pub use output::OutputId;
pub use power::LazyPowerSwitch;
pub use preamp::{FilterEngine, Preamp};
pub use scheduler::{Scheduler, Task, TaskHandle};
pub use sim::{ManualScheduler, RecordingFilterEngine, SimulatedGpio};
