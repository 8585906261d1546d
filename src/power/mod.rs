//! Component power control.

pub mod controller;
pub mod driver;

pub use controller::{ComponentSelector, PowerCommand, PowerController, PowerReport};
pub use driver::{driver_for, DriverFuture, PowerDriver, SimulatedDriver};
