//! External process execution
//!
//! Logged subprocess runs for the compiler and tuner, and the ephemeral
//! warm-up server the JIT cache classes are driven through.

pub mod server;
pub mod subprocess;

pub use server::{
    LaunchServerBackend, ServerHandle, ServerSpec, ServingBackend, ShutdownOutcome,
};
pub use subprocess::{run_logged, tail_lines, CommandSpec};
