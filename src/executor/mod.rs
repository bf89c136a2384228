//! Step and phase execution.
//!
//! The step executor runs one tool invocation and never fails the caller
//! with a tool error; the phase executor schedules a phase's steps into
//! waves and short-circuits the phase on the first failed wave.

pub mod phase;
pub mod step;

pub use phase::{PhaseContext, PhaseExecutor};
pub use step::{StepContext, StepExecutor};
