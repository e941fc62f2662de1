//! Utility helpers

pub mod logger;
mod sync;
pub mod timer;

pub use logger::{init_logger, LogLevel};
pub(crate) use sync::lock;
pub use timer::Timer;
