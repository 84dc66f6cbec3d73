//! Step/fiber execution model
//!
//! - [`packet`]: per-fiber context
//! - [`step`]: steps, next actions and fiber errors
//! - [`engine`]: the interpreter that runs fibers, forks and joins them

pub mod engine;
pub mod packet;
pub mod step;

pub use engine::{Engine, FiberOutcome};
pub use packet::{keys, Packet};
pub use step::{same_step, FiberError, NextAction, Resume, Step, StepAndPacket, StepRef};

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "engine_test.rs"]
mod engine_tests;
