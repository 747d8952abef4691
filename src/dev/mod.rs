//! Useful development utils

mod async_simulation;
mod simulation;

pub use async_simulation::*;
pub use simulation::*;
