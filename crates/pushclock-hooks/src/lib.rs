//! # Pushclock Hooks
//! Runs user-supplied scripts around a task firing, each in its own
//! subprocess with a temporary working directory and a wall-clock timeout.

pub mod runner;
pub mod sandbox;

pub use runner::{HookContext, HookOutcome, HookRunner};
pub use sandbox::{SandboxOutput, SandboxSpec};
