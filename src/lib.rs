//! Kiln - GPU Inference Cache Staging
//!
//! Validates and regenerates the expensive machine-specific caches an
//! inference server depends on: AOT-compiled kernels, autotuned kernel
//! configuration tables and warm-up-populated JIT caches.

pub mod cache;
pub mod cli;
pub mod config;
pub mod environment;
pub mod error;
pub mod events;
pub mod exec;
pub mod jsonio;
pub mod manifest;
pub mod pipeline;
pub mod telemetry;

pub use error::{KilnError, KilnResult};
