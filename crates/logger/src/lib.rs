//! The data logging engine: the tick-driven scheduler, the calendar
//! archiver, the IPC request handler, and the `App` that wires them up
//! from a configuration.

pub mod app;
pub mod archiver;
pub mod handler;
mod metrics;
pub mod scheduler;

pub use app::{
    App,
    ClientFactory,
    DefaultClientFactory,
};
pub use archiver::Archiver;
pub use handler::LoggerRequestHandler;
pub use scheduler::DataLogger;
