//! The `utils` module collects definitions shared across `busline`: the
//! crate-level error type and logging setup.

pub mod error;
pub mod logging;

pub use error::BusError;
