//! Reveille library exports for the binary, integration tests and fuzzing.

pub mod alarm;
pub mod config;
#[cfg(unix)]
pub mod daemon;
pub mod engine;
#[cfg(unix)]
pub mod ipc;
pub mod lease;
pub mod panic_handler;
pub mod playback;
pub mod state;
pub mod store;
pub mod trigger;

// Re-export commonly used types for convenience
pub use alarm::{Alarm, AlarmId};
pub use config::Config;
pub use engine::AlarmEngine;
