//! Asynchronous device-supervision runtime and data-reduction pipeline for a
//! SAXS instrument. See `DESIGN.md` for the grounding ledger.

pub mod bus;
pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod front;
pub mod message;
pub mod motor_coordinator;
pub mod pipeline;
pub mod protocol;
pub mod supervisor;
pub mod telemetry;
pub mod transport;
pub mod value;
pub mod watchdog;

pub use bus::{BusReceiver, BusSender};
pub use config::Config;
pub use data::{Curve, Exposure, Header};
pub use device::DeviceSpec;
pub use error::SupervisorError;
pub use front::{DeviceFront, FrontEvent};
pub use message::{Argument, Message, MessageKind};
pub use motor_coordinator::MotorCoordinator;
pub use supervisor::{DeviceSupervisor, Termination};
pub use value::Value;
