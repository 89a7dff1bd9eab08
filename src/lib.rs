pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod room;
pub mod wal;

pub use config::{BookingPolicy, PackageSelection};
pub use engine::{Engine, EngineError};
