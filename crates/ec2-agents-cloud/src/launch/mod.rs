//! Instance lifecycle: the transition table and the per-instance driver

pub mod driver;
pub mod state;

pub use driver::{DriverContext, DriverHandle, spawn};
pub use state::{Event, IdleAction, TransitionError};
