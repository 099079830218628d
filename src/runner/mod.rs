//! Runner supervision.
//!
//! Everything between the scheduler and the native runner process: choosing
//! a build variant, planning layer offload, spawning and watching the child,
//! and adapting its completion stream.

pub mod options;
pub mod planner;
pub mod process;
pub mod stream;
pub mod variant;
